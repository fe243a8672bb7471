//! Strategies bundled with the binary.

use crate::api::{FilterStrategy, Karma, RequestContext, TrainOutcome};
use crate::config::PatternRule;
use regex::Regex;

/// Local strategy scoring content against configured regular expressions.
///
/// Every matching rule adds its karma. The author name is matched together
/// with the content unless the submitter is anonymous.
pub struct PatternStrategy {
    rules: Vec<(Regex, i32)>,
}

impl PatternStrategy {
    pub fn new(rules: &[PatternRule]) -> anyhow::Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = Regex::new(&rule.pattern).map_err(|e| {
                    anyhow::anyhow!("Invalid regex pattern '{}': {}", rule.pattern, e)
                })?;
                Ok((regex, rule.karma))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        log::debug!("Loaded {} content patterns", rules.len());
        Ok(Self { rules })
    }
}

impl FilterStrategy for PatternStrategy {
    fn name(&self) -> &str {
        "Regex"
    }

    fn is_external(&self) -> bool {
        false
    }

    fn test(
        &self,
        _req: &RequestContext,
        author: &str,
        content: &str,
        _ip: &str,
    ) -> anyhow::Result<Option<Karma>> {
        let subject = if author.is_empty() || author == "anonymous" {
            content.to_string()
        } else {
            format!("{author}\n{content}")
        };

        let mut points = 0;
        let mut matched = Vec::new();
        for (regex, karma) in &self.rules {
            if regex.is_match(&subject) {
                log::debug!("Pattern {} found in submission", regex.as_str());
                matched.push(format!("'{}'", regex.as_str()));
                points += karma;
            }
        }

        let message = match points {
            0 => return Ok(None),
            p if p < 0 => "Content contained these blacklisted patterns: %s",
            _ => "Content contained these whitelisted patterns: %s",
        };
        Ok(Some(Karma::new(points, message).with_args([matched.join(", ")])))
    }

    fn train(
        &self,
        _req: &RequestContext,
        _author: &str,
        _content: &str,
        _ip: &str,
        _spam: bool,
    ) -> anyhow::Result<TrainOutcome> {
        Ok(TrainOutcome::NotApplicable)
    }
}
