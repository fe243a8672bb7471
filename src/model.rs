//! Decision log records and the encodings used to persist them.

use crate::api::RequestContext;
use crate::content::render_template;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One strategy's contribution to a submission's score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    #[serde(rename = "name")]
    pub strategy: String,
    pub points: i32,
    #[serde(rename = "text")]
    pub message: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Reason {
    pub fn new(strategy: impl Into<String>, points: i32, message: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            points,
            message: message.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn rendered_message(&self) -> String {
        render_template(&self.message, &self.args)
    }

    /// `Strategy (points): message`
    pub fn render(&self) -> String {
        format!(
            "{} ({}): {}",
            self.strategy,
            self.points,
            self.rendered_message()
        )
    }
}

/// Enough of the original request to replay it during training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub target: String,
    #[serde(default)]
    pub args: Vec<(String, String)>,
}

impl ReplayRequest {
    pub fn from_request(req: &RequestContext) -> Self {
        Self {
            target: req.path.clone(),
            args: req.args.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: Option<i64>,
    pub time: DateTime<Utc>,
    pub path: String,
    pub author: String,
    pub authenticated: bool,
    pub ip: String,
    /// `Name: value` lines.
    pub headers: String,
    pub content: String,
    pub rejected: bool,
    pub karma: i32,
    pub reasons: Vec<Reason>,
    pub request: Option<ReplayRequest>,
}

impl LogEntry {
    pub fn exists(&self) -> bool {
        self.id.is_some()
    }

    /// Points the named strategy contributed, 0 if it gave no reason.
    pub fn reason_points(&self, strategy: &str) -> i32 {
        self.reasons
            .iter()
            .find(|r| r.strategy == strategy)
            .map(|r| r.points)
            .unwrap_or(0)
    }

    pub fn rendered_reasons(&self) -> Vec<String> {
        self.reasons.iter().map(Reason::render).collect()
    }

    /// Parsed header lines; malformed lines are skipped.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .filter(|(name, _)| !name.is_empty())
            .collect()
    }
}

/// Render request headers into the stored `Name: value` block.
pub fn format_headers(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}", title_case(name), value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn title_case(name: &str) -> String {
    name.replace('_', "-")
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub fn encode_content(content: &str) -> String {
    STANDARD.encode(content.as_bytes())
}

/// Reverse `encode_content`; rows stored before encoding are returned as-is.
pub fn decode_content(stored: &str) -> String {
    let compact: String = stored.chars().filter(|c| !c.is_whitespace()).collect();
    match STANDARD.decode(compact.as_bytes()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| stored.to_string()),
        Err(_) => stored.to_string(),
    }
}

pub fn encode_reasons(reasons: &[Reason]) -> String {
    serde_json::to_string(reasons).unwrap_or_else(|e| {
        log::warn!("Failed to encode reasons: {e}");
        "[]".to_string()
    })
}

pub fn decode_reasons(stored: Option<&str>) -> Vec<Reason> {
    let Some(stored) = stored else {
        return Vec::new();
    };
    serde_json::from_str(stored).unwrap_or_else(|e| {
        log::debug!("Ignoring malformed reasons ({e}): {stored:?}");
        Vec::new()
    })
}

pub fn encode_request(request: Option<&ReplayRequest>) -> Option<String> {
    request.and_then(|r| serde_json::to_string(r).ok())
}

pub fn decode_request(stored: Option<&str>) -> Option<ReplayRequest> {
    serde_json::from_str(stored?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_round_trip_unicode() {
        let text = "Grüße aus Köln\n日本語のテキスト\n🙂";
        assert_eq!(decode_content(&encode_content(text)), text);
        assert_eq!(decode_content(&encode_content("")), "");
    }

    #[test]
    fn test_legacy_content_falls_back() {
        // Not base64 at all.
        assert_eq!(decode_content("Hello, world!"), "Hello, world!");
        // Valid base64 alphabet, but not UTF-8 once decoded.
        assert_eq!(decode_content("Test"), "Test");
    }

    #[test]
    fn test_wrapped_base64_is_decoded() {
        let encoded = encode_content("line one\nline two");
        let (a, b) = encoded.split_at(8);
        assert_eq!(decode_content(&format!("{a}\n{b}\n")), "line one\nline two");
    }

    #[test]
    fn test_reasons_round_trip() {
        let reasons = vec![
            Reason::new("Regex", -5, "Content contained blacklisted patterns: %s")
                .with_args(["viagra"]),
            Reason::new("AuthenticatedUserScore", 20, "User is authenticated"),
        ];
        assert_eq!(decode_reasons(Some(&encode_reasons(&reasons))), reasons);
    }

    #[test]
    fn test_malformed_reasons_decode_empty() {
        assert!(decode_reasons(None).is_empty());
        assert!(decode_reasons(Some("<entries><e name=")).is_empty());
        assert!(decode_reasons(Some("{\"name\": 1}")).is_empty());
    }

    #[test]
    fn test_request_round_trip_and_corruption() {
        let request = ReplayRequest {
            target: "/ticket/12".to_string(),
            args: vec![
                ("comment".to_string(), "hello".to_string()),
                ("action".to_string(), "leave".to_string()),
            ],
        };
        let stored = encode_request(Some(&request));
        assert_eq!(decode_request(stored.as_deref()), Some(request));
        assert_eq!(encode_request(None), None);
        assert_eq!(decode_request(None), None);
        assert_eq!(decode_request(Some("not json")), None);
    }

    #[test]
    fn test_reason_render() {
        let reason = Reason::new("IPBlacklist", -10, "IP %s blacklisted by %s")
            .with_args(["10.0.0.1", "dnsbl.example"]);
        assert_eq!(
            reason.render(),
            "IPBlacklist (-10): IP 10.0.0.1 blacklisted by dnsbl.example"
        );
    }

    #[test]
    fn test_headers_format_and_parse() {
        let headers = vec![
            ("user-agent".to_string(), "Mozilla/5.0".to_string()),
            ("X_FORWARDED_FOR".to_string(), "10.1.1.1".to_string()),
        ];
        let block = format_headers(&headers);
        assert_eq!(block, "User-Agent: Mozilla/5.0\nX-Forwarded-For: 10.1.1.1");

        let entry = LogEntry {
            id: None,
            time: Utc::now(),
            path: "/".to_string(),
            author: "anonymous".to_string(),
            authenticated: false,
            ip: "127.0.0.1".to_string(),
            headers: format!("{block}\ngarbage line"),
            content: String::new(),
            rejected: false,
            karma: 0,
            reasons: vec![Reason::new("Regex", -3, "bad")],
            request: None,
        };
        assert_eq!(entry.header_pairs().len(), 2);
        assert_eq!(entry.reason_points("Regex"), -3);
        assert_eq!(entry.reason_points("Akismet"), 0);
    }
}
