//! Terminal actions taken when a submission scores below the threshold.

use crate::api::RequestContext;
use serde::{Deserialize, Serialize};

/// What the caller must do with a rejected submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectAction {
    /// Refuse the submission outright, showing `message`.
    Reject { message: String },
    /// Send the submitter to a human-verification challenge; the original
    /// request is replayed from `return_to` once the challenge is passed.
    Redirect {
        location: String,
        return_to: String,
        message: String,
    },
}

impl RejectAction {
    pub fn message(&self) -> &str {
        match self {
            RejectAction::Reject { message } | RejectAction::Redirect { message, .. } => message,
        }
    }
}

pub trait RejectHandler: Send + Sync {
    fn reject_content(&self, req: &RequestContext, message: &str) -> RejectAction;
}

/// Default handler: hard fail.
#[derive(Debug, Default, Clone)]
pub struct HardReject;

impl RejectHandler for HardReject {
    fn reject_content(&self, _req: &RequestContext, message: &str) -> RejectAction {
        RejectAction::Reject {
            message: message.to_string(),
        }
    }
}

/// Redirects rejected submitters to a challenge page (e.g. a CAPTCHA).
#[derive(Debug, Clone)]
pub struct ChallengeRedirect {
    target: String,
}

impl ChallengeRedirect {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl RejectHandler for ChallengeRedirect {
    fn reject_content(&self, req: &RequestContext, message: &str) -> RejectAction {
        log::debug!(
            "Redirecting rejected submission on {} to challenge {}",
            req.path,
            self.target
        );
        RejectAction::Redirect {
            location: self.target.clone(),
            return_to: req.path.clone(),
            message: message.to_string(),
        }
    }
}

/// Reject handler selection as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type")]
pub enum RejectConfig {
    #[default]
    Reject,
    Challenge {
        target: String,
    },
}

impl RejectConfig {
    pub fn build(&self) -> Box<dyn RejectHandler> {
        match self {
            RejectConfig::Reject => Box::new(HardReject),
            RejectConfig::Challenge { target } => Box::new(ChallengeRedirect::new(target.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_reject_keeps_message() {
        let action = HardReject.reject_content(&RequestContext::default(), "go away");
        assert_eq!(
            action,
            RejectAction::Reject {
                message: "go away".to_string()
            }
        );
    }

    #[test]
    fn test_challenge_redirect() {
        let req = RequestContext {
            path: "/wiki/Start".to_string(),
            ..Default::default()
        };
        let handler = RejectConfig::Challenge {
            target: "/captcha".to_string(),
        }
        .build();
        match handler.reject_content(&req, "suspicious") {
            RejectAction::Redirect {
                location,
                return_to,
                message,
            } => {
                assert_eq!(location, "/captcha");
                assert_eq!(return_to, "/wiki/Start");
                assert_eq!(message, "suspicious");
            }
            other => panic!("Expected redirect, got {other:?}"),
        }
    }
}
