//! Strategy contract and the submission types every strategy sees.

use crate::content::render_template;
use serde::{Deserialize, Serialize};

/// Request metadata that travels with a submission.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestContext {
    pub path: String,
    pub remote_addr: String,
    /// Logged-in user name; `None` or `"anonymous"` means unauthenticated.
    #[serde(default)]
    pub authname: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub args: Vec<(String, String)>,
}

impl RequestContext {
    pub fn is_authenticated(&self) -> bool {
        matches!(&self.authname, Some(name) if !name.is_empty() && name != "anonymous")
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_attachment(&self) -> bool {
        self.arg("attachment").is_some()
    }
}

/// One changed field: previous content (if any) and the submitted content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    #[serde(default)]
    pub old: Option<String>,
    pub new: String,
}

impl Change {
    pub fn new(new: impl Into<String>) -> Self {
        Self {
            old: None,
            new: new.into(),
        }
    }

    pub fn edit(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: Some(old.into()),
            new: new.into(),
        }
    }
}

/// A content submission awaiting a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub request: RequestContext,
    #[serde(default)]
    pub author: String,
    pub changes: Vec<Change>,
}

/// Opinion returned by a strategy that did not abstain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Karma {
    pub points: i32,
    /// Message template; `%s`/`%d` placeholders are filled from `args`.
    pub message: String,
    pub args: Vec<String>,
}

impl Karma {
    pub fn new(points: i32, message: impl Into<String>) -> Self {
        Self {
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

    pub fn render(&self) -> String {
        render_template(&self.message, &self.args)
    }
}

/// Result of asking a strategy to learn from a corrected label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    NotApplicable,
    Trained,
    Failed,
    /// Configuration the strategy needs is absent (e.g. API key).
    MissingPrecondition,
}

/// A pluggable scorer/trainer.
///
/// `is_external` must be static for the lifetime of the strategy: external
/// strategies talk to the network and are gated, ranked and may be excluded
/// from training. An `Err` from `test` or `train` is isolated to that one
/// strategy and recorded as an error statistic.
pub trait FilterStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn is_external(&self) -> bool;

    fn test(
        &self,
        req: &RequestContext,
        author: &str,
        content: &str,
        ip: &str,
    ) -> anyhow::Result<Option<Karma>>;

    fn train(
        &self,
        req: &RequestContext,
        author: &str,
        content: &str,
        ip: &str,
        spam: bool,
    ) -> anyhow::Result<TrainOutcome>;
}
