//! Helpers for comma-separated `key:value` routing patterns.
//!
//! Token order is significant: `role:math,cmd:sum` is a prefix of
//! `role:math,cmd:sum,return:zero` but not of `cmd:sum,role:math`.

/// Separator between pattern tokens.
pub const SEPARATOR: char = ',';

/// Split a pattern into its ordered tokens.
pub fn tokens(pattern: &str) -> impl Iterator<Item = &str> {
    pattern.split(SEPARATOR)
}

/// Candidate keys for a longest-prefix probe, longest first.
///
/// `a:1,b:2,c:3` yields `a:1,b:2,c:3`, `a:1,b:2`, `a:1`.
pub fn prefixes(pattern: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(pattern), |p| p.rfind(SEPARATOR).map(|i| &p[..i]))
}

/// Whether a node registered under `registered` accepts a request
/// declaring `requested`.
///
/// This is plain substring containment on the raw strings, not a token
/// subset test. Existing clients rely on it, so `cmd:sum` also accepts
/// `cmd:summary`.
pub fn accepts(registered: &str, requested: &str) -> bool {
    requested.contains(registered)
}
