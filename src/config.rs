use crate::reject::RejectConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub filter: FilterConfig,
    pub reject: RejectConfig,
    pub logging: Option<LoggingConfig>,
    pub patterns: Vec<PatternRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/karma-filter/karma.db".to_string(),
        }
    }
}

/// Scoring thresholds and switches read by the filter system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum score a submission needs to be accepted.
    pub min_karma: i32,
    /// Bonus for authenticated submitters when they are not trusted outright.
    pub authenticated_karma: i32,
    pub attachment_karma: i32,
    /// Accept authenticated submissions without scoring them.
    pub trust_authenticated: bool,
    pub use_external: bool,
    pub train_external: bool,
    /// External strategies are skipped once local karma reaches -skip_external...
    pub skip_external: i32,
    /// ...or +skip_externalham.
    pub skip_externalham: i32,
    pub stop_external: i32,
    pub stop_externalham: i32,
    pub logging_enabled: bool,
    /// Days after which decision log entries are purged.
    pub purge_age: u32,
    /// Take the client address from X-Forwarded-For.
    pub is_forwarded: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_karma: 0,
            authenticated_karma: 20,
            attachment_karma: 0,
            trust_authenticated: false,
            use_external: true,
            train_external: true,
            skip_external: 20,
            skip_externalham: 30,
            stop_external: 50,
            stop_externalham: 50,
            logging_enabled: true,
            purge_age: 7,
            is_forwarded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// A content pattern for the bundled pattern strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternRule {
    pub pattern: String,
    /// Points added when the pattern matches; negative for blacklisted content.
    pub karma: i32,
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
