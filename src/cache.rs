//! Prefix cache: a token trie plus a single-owner task that serializes
//! every mutation.
//!
//! Routing code never touches the trie directly. It holds a [`CacheHandle`],
//! which queues inserts and removals without waiting and answers lookups
//! through a oneshot reply. Because the owner task applies commands in
//! arrival order, [`CacheHandle::settle`] gives tests a point after which
//! every earlier write is visible.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::pattern;

/// Trie keyed by pattern tokens.
///
/// Each edge is one comma-separated token, so a stored key only matches a
/// probe on whole-token boundaries.
#[derive(Debug, Clone)]
pub struct PrefixCache<V> {
    root: Node<V>,
    len: usize,
}

#[derive(Debug, Clone)]
struct Node<V> {
    children: HashMap<String, Node<V>>,
    entry: Option<(String, V)>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            entry: None,
        }
    }
}

impl<V> Node<V> {
    fn is_vacant(&self) -> bool {
        self.entry.is_none() && self.children.is_empty()
    }

    fn remove_at(&mut self, tokens: &[&str]) -> Option<V> {
        let Some((head, rest)) = tokens.split_first() else {
            return self.entry.take().map(|(_, value)| value);
        };
        let child = self.children.get_mut(*head)?;
        let removed = child.remove_at(rest);
        if child.is_vacant() {
            self.children.remove(*head);
        }
        removed
    }
}

impl<V> Default for PrefixCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PrefixCache<V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    /// Number of stored patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace the value stored under `pattern`.
    ///
    /// Returns the previous value, if any.
    pub fn insert(&mut self, pattern: &str, value: V) -> Option<V> {
        let mut node = &mut self.root;
        for token in pattern::tokens(pattern) {
            node = node.children.entry(token.to_string()).or_default();
        }
        let previous = node.entry.replace((pattern.to_string(), value));
        if previous.is_none() {
            self.len += 1;
        }
        previous.map(|(_, value)| value)
    }

    /// Remove the value stored under exactly `pattern`. Absent keys are a no-op.
    pub fn remove(&mut self, pattern: &str) -> Option<V> {
        let tokens: Vec<&str> = pattern::tokens(pattern).collect();
        let removed = self.root.remove_at(&tokens);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Longest stored key that is a token prefix of `pattern`.
    pub fn longest_prefix(&self, pattern: &str) -> Option<(&str, &V)> {
        let mut node = &self.root;
        let mut best = node.entry.as_ref();
        for token in pattern::tokens(pattern) {
            match node.children.get(token) {
                Some(child) => {
                    node = child;
                    if node.entry.is_some() {
                        best = node.entry.as_ref();
                    }
                }
                None => break,
            }
        }
        best.map(|(key, value)| (key.as_str(), value))
    }
}

enum Command<V> {
    Insert(String, V),
    Remove(String),
    Lookup(String, oneshot::Sender<Option<(String, V)>>),
    Settle(oneshot::Sender<()>),
}

/// Cloneable handle to a cache owned by a background task.
///
/// The owner task stops once every handle has been dropped.
pub struct CacheHandle<V> {
    tx: mpsc::UnboundedSender<Command<V>>,
}

impl<V> Clone for CacheHandle<V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<V> std::fmt::Debug for CacheHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<V> CacheHandle<V>
where
    V: Clone + Send + 'static,
{
    /// Spawn the owner task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<V>>();
        tokio::spawn(async move {
            let mut cache = PrefixCache::new();
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Insert(pattern, value) => {
                        cache.insert(&pattern, value);
                        trace!(%pattern, entries = cache.len(), "cache insert");
                    }
                    Command::Remove(pattern) => {
                        if cache.remove(&pattern).is_some() {
                            trace!(%pattern, entries = cache.len(), "cache remove");
                        }
                    }
                    Command::Lookup(pattern, reply) => {
                        let hit = cache
                            .longest_prefix(&pattern)
                            .map(|(key, value)| (key.to_string(), value.clone()));
                        let _ = reply.send(hit);
                    }
                    Command::Settle(reply) => {
                        let _ = reply.send(());
                    }
                }
            }
            debug!("cache owner task stopped");
        });
        Self { tx }
    }

    /// Queue an upsert. Returns immediately.
    pub fn insert(&self, pattern: impl Into<String>, value: V) {
        self.submit(Command::Insert(pattern.into(), value));
    }

    /// Queue removal of an exact key. Returns immediately.
    pub fn remove(&self, pattern: impl Into<String>) {
        self.submit(Command::Remove(pattern.into()));
    }

    /// Longest-prefix lookup. Returns the matched key and a copy of its value.
    pub async fn lookup(&self, pattern: &str) -> Option<(String, V)> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Lookup(pattern.to_string(), reply)).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Wait until every command queued before this call has been applied.
    pub async fn settle(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Settle(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    fn submit(&self, command: Command<V>) {
        if self.tx.send(command).is_err() {
            debug!("cache owner task gone, dropping update");
        }
    }
}
