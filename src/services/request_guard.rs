//! Malicious request-URI detection
//!
//! Looks for path traversal, stream-wrapper inclusion, script injection and
//! SQL keywords in the request URI. The URI is checked as received and after
//! up to two rounds of percent-decoding, so `%252e%252e%252f` is caught too.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const TRAVERSAL_PATTERNS: &[&str] = &[
    "../", "..\\", "..%2f", "..%5c", "%2e%2e%2f", "%2e%2e%5c", "..%252f", "..%255c",
];

const INCLUSION_PATTERNS: &[&str] = &[
    "php://", "file://", "data://", "expect://", "zip://", "phar://", "glob://",
];

const SCRIPT_PATTERNS: &[&str] = &[
    "<script", "</script", "javascript:", "vbscript:", "<iframe", "<object", "<embed",
];

static EVENT_HANDLER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bon(load|error|click|mouseover|focus|blur|change|submit)\s*=")
        .expect("event handler pattern is valid")
});

static SQL_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(union|select|insert|update|delete|drop|create|alter|exec|execute)\b")
        .expect("sql keyword pattern is valid")
});

/// Category of a detected pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    PathTraversal,
    FileInclusion,
    ScriptInjection,
    SqlInjection,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::PathTraversal => "path traversal",
            ThreatKind::FileInclusion => "file inclusion",
            ThreatKind::ScriptInjection => "script injection",
            ThreatKind::SqlInjection => "sql injection",
        }
    }
}

impl std::fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inspect a request URI, returning the first threat found.
pub fn inspect_uri(uri: &str) -> Option<ThreatKind> {
    let raw = uri.to_lowercase();
    let once = decode(&raw);
    let twice = decode(&once);

    let found = [raw.as_str(), once.as_str(), twice.as_str()]
        .into_iter()
        .find_map(inspect_decoded);
    found
}

fn decode(input: &str) -> String {
    // `+` is a space in query strings
    let spaced = input.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.to_lowercase(),
        Err(_) => spaced,
    }
}

fn inspect_decoded(candidate: &str) -> Option<ThreatKind> {
    if TRAVERSAL_PATTERNS.iter().any(|p| candidate.contains(p)) {
        return Some(ThreatKind::PathTraversal);
    }
    if INCLUSION_PATTERNS.iter().any(|p| candidate.contains(p)) {
        return Some(ThreatKind::FileInclusion);
    }
    if SCRIPT_PATTERNS.iter().any(|p| candidate.contains(p)) || EVENT_HANDLER.is_match(candidate) {
        return Some(ThreatKind::ScriptInjection);
    }
    if SQL_KEYWORD.is_match(candidate) {
        return Some(ThreatKind::SqlInjection);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_uris() {
        for uri in ["/", "/?utm_source=google", "/?q=cheap+flights", "/index.html?page=2", "/?lang=en-US"] {
            assert_eq!(inspect_uri(uri), None, "{} flagged", uri);
        }
    }

    #[test]
    fn test_script_injection() {
        assert_eq!(inspect_uri("/?q=<script>alert(1)</script>"), Some(ThreatKind::ScriptInjection));
        assert_eq!(inspect_uri("/?q=%3Cscript%3Ealert(1)%3C/script%3E"), Some(ThreatKind::ScriptInjection));
        assert_eq!(inspect_uri("/?next=javascript:alert(1)"), Some(ThreatKind::ScriptInjection));
        assert_eq!(inspect_uri("/?x=%22%20onerror%3Dalert(1)"), Some(ThreatKind::ScriptInjection));
    }

    #[test]
    fn test_path_traversal() {
        assert_eq!(inspect_uri("/../../etc/passwd"), Some(ThreatKind::PathTraversal));
        assert_eq!(inspect_uri("/?file=..%2f..%2fetc%2fpasswd"), Some(ThreatKind::PathTraversal));
        assert_eq!(inspect_uri("/?file=%252e%252e%252fetc"), Some(ThreatKind::PathTraversal));
        assert_eq!(inspect_uri("/?file=..\\windows"), Some(ThreatKind::PathTraversal));
    }

    #[test]
    fn test_file_inclusion() {
        assert_eq!(inspect_uri("/?page=php://filter/resource=index"), Some(ThreatKind::FileInclusion));
        assert_eq!(inspect_uri("/?page=file:///etc/passwd"), Some(ThreatKind::FileInclusion));
    }

    #[test]
    fn test_sql_keywords() {
        assert_eq!(inspect_uri("/?id=1%20UNION%20SELECT%20password"), Some(ThreatKind::SqlInjection));
        assert_eq!(inspect_uri("/?id=1+union+select+1"), Some(ThreatKind::SqlInjection));
        assert_eq!(inspect_uri("/?q=drop"), Some(ThreatKind::SqlInjection));
    }

    #[test]
    fn test_keywords_inside_words_are_allowed() {
        assert_eq!(inspect_uri("/?q=selection"), None);
        assert_eq!(inspect_uri("/?sort=updated_at"), None);
        assert_eq!(inspect_uri("/?ref=reunion"), None);
    }

    #[test]
    fn test_malformed_encoding_does_not_panic() {
        assert_eq!(inspect_uri("/?q=%ff%fe"), None);
        assert!(inspect_uri("/?q=%ff<script").is_some());
    }
}
