//! Minimal glob matching for method and upstream-id patterns.
//!
//! Patterns support `*` (any run of characters, including empty) and literal
//! characters; this covers every pattern the configuration surface accepts
//! (`eth_*`, `*`, `trace_*|debug_*` style alternatives are expressed as
//! separate rules). Matching is case-sensitive.

/// Returns `true` if `candidate` matches `pattern`.
///
/// # Examples
/// ```
/// use braid_core::utils::glob::matches;
///
/// assert!(matches("*", "eth_call"));
/// assert!(matches("eth_*", "eth_getLogs"));
/// assert!(matches("eth_getBlockBy*", "eth_getBlockByNumber"));
/// assert!(!matches("eth_*", "net_version"));
/// ```
#[must_use]
pub fn matches(pattern: &str, candidate: &str) -> bool {
    // Fast paths for the two overwhelmingly common cases.
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == candidate;
    }

    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();

    // Classic two-pointer wildcard matching with backtracking to the last
    // star. Linear in practice for the short patterns used here.
    let (mut pi, mut ci) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut matched = 0usize;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            matched = ci;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            matched += 1;
            ci = matched;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Returns `true` if any pattern in `patterns` matches `candidate`.
#[must_use]
pub fn matches_any(patterns: &[String], candidate: &str) -> bool {
    patterns.iter().any(|p| matches(p, candidate))
}
