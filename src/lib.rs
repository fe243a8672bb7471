pub mod api;
pub mod config;
pub mod content;
pub mod database;
pub mod decision_log;
pub mod filter;
pub mod model;
pub mod ranking;
pub mod reject;
pub mod statistics;
pub mod strategies;

pub use api::{Change, FilterStrategy, Karma, RequestContext, Submission, TrainOutcome};
pub use config::{Config, FilterConfig};
pub use database::Database;
pub use decision_log::{DecisionLog, LogFilter};
pub use filter::{FilterSystem, Outcome, TrainingReport, Verdict};
pub use model::{LogEntry, Reason};
pub use ranking::StrategyRanker;
pub use reject::{RejectAction, RejectHandler};
pub use statistics::{StatAction, StatData, StatStatus, Statistics};
