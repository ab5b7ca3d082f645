//! Hostname pattern matching
//!
//! A configured hostname is either a literal (`svc.example.com`) or a glob
//! containing `*` / `?`. Globs only ever consume characters from `[a-z0-9]`,
//! so a wildcard never crosses a label boundary: `*.ops` matches `alpha.ops`
//! but neither `ops` nor `alpha.beta.ops`.

/// Returns true if `domain` only uses the hostname alphabet plus glob characters.
///
/// Anything else (uppercase, `/`, `_`, ...) is rejected before a pattern is built.
pub fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'*' | b'?'))
}

/// Returns true if the hostname contains a glob character.
pub fn is_glob(domain: &str) -> bool {
    domain.contains(&['*', '?'][..])
}

/// Compiled hostname pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainMatcher {
    /// Plain string equality
    Exact(String),
    /// Wildcard pattern over `[a-z0-9]`
    Glob(String),
}

impl DomainMatcher {
    /// Compile a hostname pattern
    pub fn compile(pattern: &str) -> Self {
        if is_glob(pattern) {
            Self::Glob(pattern.to_string())
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    /// Test a candidate hostname against the pattern
    pub fn test(&self, candidate: &str) -> bool {
        match self {
            Self::Exact(host) => host == candidate,
            Self::Glob(pattern) => glob_matches(pattern.as_bytes(), candidate.as_bytes()),
        }
    }

    /// The pattern text this matcher was compiled from
    pub fn pattern(&self) -> &str {
        match self {
            Self::Exact(p) | Self::Glob(p) => p,
        }
    }
}

fn is_wildcard_char(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// Row-by-row glob evaluation, O(pattern * candidate) with no backtracking.
///
/// `row[j]` holds whether the pattern consumed so far matches `candidate[..j]`.
fn glob_matches(pattern: &[u8], candidate: &[u8]) -> bool {
    let n = candidate.len();
    let mut row = vec![false; n + 1];
    row[0] = true;

    for &pc in pattern {
        let mut next = vec![false; n + 1];
        match pc {
            b'*' => {
                next[0] = row[0];
                for j in 1..=n {
                    next[j] = row[j] || (next[j - 1] && is_wildcard_char(candidate[j - 1]));
                }
            }
            b'?' => {
                for j in 1..=n {
                    next[j] = row[j - 1] && is_wildcard_char(candidate[j - 1]);
                }
            }
            literal => {
                for j in 1..=n {
                    next[j] = row[j - 1] && candidate[j - 1] == literal;
                }
            }
        }
        if !next.iter().any(|&reachable| reachable) {
            return false;
        }
        row = next;
    }

    row[n]
}
