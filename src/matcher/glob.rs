/// Wildcard pattern: `*` matches zero or more characters, `?` exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    raw: String,
    chars: Vec<char>,
    case_insensitive: bool,
}

impl GlobPattern {
    /// Case-sensitive pattern
    pub fn new(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            chars: pattern.chars().collect(),
            case_insensitive: false,
        }
    }

    /// ASCII case-insensitive pattern
    pub fn case_insensitive(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            chars: pattern.chars().map(|c| c.to_ascii_lowercase()).collect(),
            case_insensitive: true,
        }
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains wildcards
    pub fn has_wildcards(&self) -> bool {
        self.chars.iter().any(|c| *c == '*' || *c == '?')
    }

    /// Match the whole input against the pattern
    pub fn matches(&self, input: &str) -> bool {
        let fold = self.case_insensitive;
        let input: Vec<char> = if fold {
            input.chars().map(|c| c.to_ascii_lowercase()).collect()
        } else {
            input.chars().collect()
        };
        wildcard_match(&self.chars, &input)
    }
}

/// Iterative wildcard matching with single-star backtracking.
///
/// On mismatch, resume from the most recent `*` and let it absorb one more
/// input character. Linear in practice, O(n*m) worst case.
fn wildcard_match(p: &[char], s: &[char]) -> bool {
    let (mut pi, mut si) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, si));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if let Some((star_p, star_s)) = backtrack {
            pi = star_p + 1;
            si = star_s + 1;
            backtrack = Some((star_p, star_s + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
