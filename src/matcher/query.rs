use super::{GlobPattern, RequestMatcher};
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

/// One key/value pair of a query-string condition
#[derive(Debug, Clone)]
pub struct QueryPair {
    key: Option<String>,
    value: GlobPattern,
}

impl QueryPair {
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &GlobPattern {
        &self.value
    }

    fn matches(&self, params: &[(Option<String>, String)]) -> bool {
        match &self.key {
            Some(key) => params
                .iter()
                .any(|(k, v)| k.as_deref() == Some(key.as_str()) && self.value.matches(v)),
            None => params.iter().any(|(_, v)| self.value.matches(v)),
        }
    }
}

/// Query string matcher - true if any configured pair matches
#[derive(Debug, Clone)]
pub struct QueryStringMatcher {
    pairs: Vec<QueryPair>,
}

impl QueryStringMatcher {
    pub fn new(pairs: Vec<(Option<String>, String)>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(LbError::config(
                ConfigErrorKind::InvalidCondition,
                "query-string condition requires at least one value",
            ));
        }
        let mut compiled = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            if value.is_empty() || key.as_deref().is_some_and(str::is_empty) {
                return Err(LbError::config(
                    ConfigErrorKind::InvalidCondition,
                    format!("Invalid query-string pair: {:?}={:?}", key, value),
                ));
            }
            compiled.push(QueryPair {
                key,
                value: GlobPattern::case_insensitive(&value),
            });
        }
        Ok(Self { pairs: compiled })
    }

    /// Single pair shorthand
    pub fn single(key: Option<&str>, value: &str) -> Result<Self> {
        Self::new(vec![(key.map(str::to_string), value.to_string())])
    }

    pub fn pairs(&self) -> &[QueryPair] {
        &self.pairs
    }
}

impl RequestMatcher for QueryStringMatcher {
    fn matches(&self, request: &Request) -> bool {
        let Some(query) = request.query.as_deref() else {
            return false;
        };
        let params = parse_query(query);
        self.pairs.iter().any(|p| p.matches(&params))
    }
}

/// Split a raw query into decoded (key, value) pairs.
///
/// A bare token (`?flag`) yields `(None, "flag")`. Tokens whose percent
/// escapes do not decode are dropped so they can never match.
fn parse_query(query: &str) -> Vec<(Option<String>, String)> {
    query
        .split('&')
        .filter(|t| !t.is_empty())
        .filter_map(|token| match token.split_once('=') {
            Some((k, v)) => Some((Some(percent_decode(k)?), percent_decode(v)?)),
            None => Some((None, percent_decode(token)?)),
        })
        .collect()
}

/// Decode `%XX` escapes and `+` as space. Returns None on malformed input.
pub(crate) fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hi = (hex[0] as char).to_digit(16)?;
                let lo = (hex[1] as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_pair() {
        let m = QueryStringMatcher::single(Some("version"), "v?").unwrap();
        assert!(m.matches(&Request::get("/?version=v1")));
        assert!(m.matches(&Request::get("/?a=1&version=V2")));
        assert!(!m.matches(&Request::get("/?version=v10")));
        assert!(!m.matches(&Request::get("/?Version=v1")));
        assert!(!m.matches(&Request::get("/")));
    }

    #[test]
    fn test_unkeyed_matches_value_or_bare_token() {
        let m = QueryStringMatcher::single(None, "debug").unwrap();
        assert!(m.matches(&Request::get("/?mode=debug")));
        assert!(m.matches(&Request::get("/?debug")));
        assert!(!m.matches(&Request::get("/?debug=1")));
    }

    #[test]
    fn test_percent_decoding() {
        let m = QueryStringMatcher::single(Some("q"), "hello world").unwrap();
        assert!(m.matches(&Request::get("/?q=hello%20world")));
        assert!(m.matches(&Request::get("/?q=hello+world")));
    }

    #[test]
    fn test_malformed_escape_fails_closed() {
        let m = QueryStringMatcher::single(Some("q"), "*").unwrap();
        assert!(!m.matches(&Request::get("/?q=%zz")));
        assert!(m.matches(&Request::get("/?q=%zz&q=ok")));
        assert_eq!(percent_decode("%4"), None);
        assert_eq!(percent_decode("%41b"), Some("Ab".to_string()));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(QueryStringMatcher::new(vec![]).is_err());
        assert!(QueryStringMatcher::single(Some(""), "x").is_err());
        assert!(QueryStringMatcher::single(Some("k"), "").is_err());
    }
}
