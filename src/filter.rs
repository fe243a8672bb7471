use crate::api::{FilterStrategy, Karma, RequestContext, Submission, TrainOutcome};
use crate::config::{Config, FilterConfig};
use crate::content::{abbreviate, combine_changes};
use crate::database::Database;
use crate::decision_log::DecisionLog;
use crate::model::{format_headers, LogEntry, Reason, ReplayRequest};
use crate::ranking::StrategyRanker;
use crate::reject::{HardReject, RejectAction, RejectHandler};
use crate::statistics::{StatAction, StatData, StatStatus, Statistics};
use crate::strategies::PatternStrategy;

use anyhow::Result;
use chrono::Utc;
use std::time::Instant;

/// Calls slower than this are logged; nothing is cancelled.
const SLOW_CALL_SECS: f64 = 3.0;

const ABBREV_LEN: usize = 60;

pub const AUTHENTICATED_REASON: &str = "AuthenticatedUserScore";
pub const ATTACHMENT_REASON: &str = "AttachmentScore";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Authenticated submitter accepted without scoring.
    Trusted,
    Accepted,
    Rejected(RejectAction),
}

/// Result of evaluating one submission.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub score: i32,
    /// Sorted by strategy name.
    pub reasons: Vec<Reason>,
    pub outcome: Outcome,
    /// Decision log id, when logging is enabled and the insert succeeded.
    pub log_id: Option<i64>,
}

impl Verdict {
    pub fn accepted(&self) -> bool {
        !matches!(self.outcome, Outcome::Rejected(_))
    }

    pub fn rejection(&self) -> Option<&RejectAction> {
        match &self.outcome {
            Outcome::Rejected(action) => Some(action),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    pub trained: Vec<i64>,
    /// Ids with no decision log entry; skipped.
    pub missing: Vec<i64>,
    pub deleted: usize,
}

/// Running state of one evaluation.
#[derive(Default)]
struct Scoring<'s> {
    score: i32,
    reasons: Vec<Reason>,
    rejections: Vec<String>,
    results: Vec<(&'s dyn FilterStrategy, i32, f64)>,
}

impl Scoring<'_> {
    fn add_bonus(&mut self, name: &str, points: i32, message: &str) {
        self.reasons.push(Reason::new(name, points, message));
        self.score += points;
    }
}

fn in_band(score: i32, low: i32, high: i32) -> bool {
    score > -low && score < high
}

/// Status of a strategy's past contribution given the corrected label.
fn contribution_status(points: i32, spam: bool) -> StatStatus {
    if points == 0 {
        StatStatus::None
    } else {
        StatStatus::agreement((points < 0) == spam)
    }
}

fn rejection_message(reasons: &[String]) -> String {
    let mut message = String::from("Submission rejected as potential spam");
    for reason in reasons {
        message.push_str("\n - ");
        message.push_str(reason);
    }
    message
}

/// Rebuild the request a logged submission arrived with.
fn replay_request(entry: &LogEntry) -> RequestContext {
    let headers = entry
        .header_pairs()
        .into_iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("Cookie"))
        .collect();
    let (path, args) = match &entry.request {
        Some(request) => (request.target.clone(), request.args.clone()),
        None => (entry.path.clone(), Vec::new()),
    };
    RequestContext {
        path,
        remote_addr: entry.ip.clone(),
        authname: entry.authenticated.then(|| entry.author.clone()),
        headers,
        args,
    }
}

/// Scores submissions with the registered strategies and re-labels logged
/// decisions.
pub struct FilterSystem {
    config: FilterConfig,
    strategies: Vec<Box<dyn FilterStrategy>>,
    reject_handler: Box<dyn RejectHandler>,
    log: DecisionLog,
    stats: Statistics,
}

impl FilterSystem {
    pub fn new(config: FilterConfig, db: Database) -> Self {
        Self {
            config,
            strategies: Vec::new(),
            reject_handler: Box::new(HardReject),
            log: DecisionLog::new(db.clone()),
            stats: Statistics::new(db),
        }
    }

    /// Open the configured database and register the bundled strategies.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Database::open(&config.database.path)?;
        let mut filter =
            Self::new(config.filter.clone(), db).with_reject_handler(config.reject.build());
        if !config.patterns.is_empty() {
            filter.register(Box::new(PatternStrategy::new(&config.patterns)?));
        }
        Ok(filter)
    }

    pub fn with_reject_handler(mut self, handler: Box<dyn RejectHandler>) -> Self {
        self.reject_handler = handler;
        self
    }

    /// Strategies run in registration order within each pass.
    pub fn register(&mut self, strategy: Box<dyn FilterStrategy>) {
        log::debug!(
            "Registered {} strategy {}",
            if strategy.is_external() { "external" } else { "local" },
            strategy.name()
        );
        self.strategies.push(strategy);
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn decision_log(&self) -> &DecisionLog {
        &self.log
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn ranker(&self) -> StrategyRanker<'_> {
        StrategyRanker::new(&self.stats)
    }

    /// Client address, honouring X-Forwarded-For behind a trusted proxy.
    pub fn remote_ip(&self, req: &RequestContext) -> String {
        if self.config.is_forwarded {
            if let Some(first) = req
                .header("X-Forwarded-For")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                return first.to_string();
            }
        }
        req.remote_addr.clone()
    }

    /// Score a submission and decide whether to accept it.
    ///
    /// Storage problems are logged and never change the verdict.
    pub fn evaluate(&self, submission: &Submission) -> Verdict {
        let start = Instant::now();
        let req = &submission.request;
        let ip = self.remote_ip(req);
        let authenticated = req.is_authenticated();

        if self.config.trust_authenticated && authenticated {
            log::debug!("Trusting authenticated submission on {}", req.path);
            return Verdict {
                score: 0,
                reasons: Vec::new(),
                outcome: Outcome::Trusted,
                log_id: None,
            };
        }

        let mut scoring = Scoring::default();
        if authenticated {
            scoring.add_bonus(
                AUTHENTICATED_REASON,
                self.config.authenticated_karma,
                "User is authenticated",
            );
        }
        if req.is_attachment() && self.config.attachment_karma != 0 {
            scoring.add_bonus(
                ATTACHMENT_REASON,
                self.config.attachment_karma,
                "Attachment weighting",
            );
        }

        let author = if submission.author.is_empty() {
            "anonymous"
        } else {
            submission.author.as_str()
        };
        let content = combine_changes(&submission.changes);
        let abbrev = abbreviate(&content, ABBREV_LEN);
        log::debug!("Testing content {abbrev:?} submitted by \"{author}\" on {}", req.path);

        let mut externals = Vec::new();
        for strategy in &self.strategies {
            if !strategy.is_external() {
                self.run_test(strategy.as_ref(), req, author, &content, &ip, &mut scoring);
            } else if self.config.use_external {
                externals.push(strategy.as_ref());
            }
        }

        let mut reached_external = false;
        if in_band(
            scoring.score,
            self.config.skip_external,
            self.config.skip_externalham,
        ) {
            for strategy in self.ranker().order(externals) {
                if !in_band(
                    scoring.score,
                    self.config.stop_external,
                    self.config.stop_externalham,
                ) {
                    log::debug!(
                        "Score {} is decisive, not asking {} or later external strategies",
                        scoring.score,
                        strategy.name()
                    );
                    break;
                }
                reached_external = true;
                self.run_test(strategy, req, author, &content, &ip, &mut scoring);
            }
        } else if !externals.is_empty() {
            log::debug!(
                "Local score {} is decisive, skipping external strategies",
                scoring.score
            );
        }

        let Scoring {
            score,
            mut reasons,
            mut rejections,
            results,
        } = scoring;
        reasons.sort_by(|a, b| a.strategy.cmp(&b.strategy));
        rejections.sort();

        let rejected = score < self.config.min_karma;
        let label = StatData::label(rejected);
        self.record(
            None,
            if reached_external {
                StatAction::TestExternal
            } else {
                StatAction::TestLocal
            },
            label,
            StatStatus::None,
            start.elapsed().as_secs_f64(),
        );
        for (strategy, points, elapsed) in results {
            let agrees = (points < 0 && rejected) || (points > 0 && !rejected);
            self.record(
                Some(strategy),
                StatAction::Test,
                label,
                StatStatus::agreement(agrees),
                elapsed,
            );
        }

        let mut log_id = None;
        if self.config.logging_enabled {
            let mut entry = LogEntry {
                id: None,
                time: Utc::now(),
                path: req.path.clone(),
                author: author.to_string(),
                authenticated,
                ip: ip.clone(),
                headers: format_headers(&req.headers),
                content,
                rejected,
                karma: score,
                reasons: reasons.clone(),
                request: Some(ReplayRequest::from_request(req)),
            };
            match self.log.insert(&mut entry) {
                Ok(id) => log_id = Some(id),
                Err(e) => log::warn!("Failed to write decision log entry: {e:#}"),
            }
            if let Err(e) = self.log.purge(self.config.purge_age) {
                log::warn!("Failed to purge decision log: {e:#}");
            }
        }

        let outcome = if rejected {
            log::info!(
                "Rejecting submission {abbrev:?} by \"{author}\" ({ip}) because it earned only {score} karma points ({} are required)",
                self.config.min_karma
            );
            Outcome::Rejected(
                self.reject_handler
                    .reject_content(req, &rejection_message(&rejections)),
            )
        } else {
            Outcome::Accepted
        };

        Verdict {
            score,
            reasons,
            outcome,
            log_id,
        }
    }

    fn run_test<'s>(
        &self,
        strategy: &'s dyn FilterStrategy,
        req: &RequestContext,
        author: &str,
        content: &str,
        ip: &str,
        scoring: &mut Scoring<'s>,
    ) {
        let started = Instant::now();
        let result = strategy.test(req, author, content, ip);
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > SLOW_CALL_SECS {
            log::warn!(
                "Test {} took {elapsed:.0} seconds to complete",
                strategy.name()
            );
        }

        match result {
            Ok(Some(karma)) => self.apply(strategy, karma, elapsed, scoring),
            Ok(None) => self.record(
                Some(strategy),
                StatAction::Test,
                StatData::Empty,
                StatStatus::None,
                elapsed,
            ),
            Err(e) => {
                log::error!("Filter strategy {} failed: {e:#}", strategy.name());
                self.record(
                    Some(strategy),
                    StatAction::Test,
                    StatData::Error,
                    StatStatus::None,
                    elapsed,
                );
            }
        }
    }

    fn apply<'s>(
        &self,
        strategy: &'s dyn FilterStrategy,
        karma: Karma,
        elapsed: f64,
        scoring: &mut Scoring<'s>,
    ) {
        let rendered = karma.render();
        log::debug!(
            "Filter strategy {} gave submission {} karma points (reason: {rendered:?})",
            strategy.name(),
            karma.points
        );
        scoring.score += karma.points;
        if karma.points < 0 {
            scoring.rejections.push(rendered);
        }
        if !karma.message.is_empty() {
            scoring.results.push((strategy, karma.points, elapsed));
            scoring.reasons.push(
                Reason::new(strategy.name(), karma.points, karma.message).with_args(karma.args),
            );
        }
    }

    /// Re-label logged submissions as spam or ham and let every strategy
    /// learn from the correction.
    pub fn train(&self, ids: &[i64], spam: bool, delete: bool) -> Result<TrainingReport> {
        let mut report = TrainingReport::default();
        let label = StatData::label(spam);

        for &id in ids {
            let start = Instant::now();
            let Some(entry) = self.log.fetch(id)? else {
                log::debug!("No decision log entry {id}, skipping");
                report.missing.push(id);
                continue;
            };
            log::info!(
                "Marking entry {id} as {}: {:?} submitted by \"{}\"",
                label.as_str(),
                abbreviate(&entry.content, ABBREV_LEN),
                entry.author
            );

            let req = replay_request(&entry);
            let author = if entry.author.is_empty() {
                "anonymous"
            } else {
                entry.author.as_str()
            };
            let train_external = self.config.use_external && self.config.train_external;

            let mut reached_external = false;
            for strategy in &self.strategies {
                let mut action = StatAction::TrainSkip;
                let mut elapsed = 0.0;
                if train_external || !strategy.is_external() {
                    reached_external |= strategy.is_external();
                    let started = Instant::now();
                    let outcome = strategy.train(&req, author, &entry.content, &entry.ip, spam);
                    elapsed = started.elapsed().as_secs_f64();
                    if elapsed > SLOW_CALL_SECS {
                        log::warn!(
                            "Training {} took {elapsed:.0} seconds to complete",
                            strategy.name()
                        );
                    }
                    action = match outcome {
                        Ok(TrainOutcome::Trained) => StatAction::Train,
                        Ok(TrainOutcome::NotApplicable) => StatAction::TrainSkip,
                        Ok(TrainOutcome::Failed) => StatAction::TrainError,
                        Ok(TrainOutcome::MissingPrecondition) => {
                            StatAction::TrainMissingPrecondition
                        }
                        Err(e) => {
                            log::error!("Training {} failed: {e:#}", strategy.name());
                            StatAction::TrainError
                        }
                    };
                }
                let status = contribution_status(entry.reason_points(strategy.name()), spam);
                self.record(Some(strategy.as_ref()), action, label, status, elapsed);
            }

            self.record(
                None,
                if reached_external {
                    StatAction::TrainExternal
                } else {
                    StatAction::TrainLocal
                },
                label,
                StatStatus::agreement(entry.rejected == spam),
                start.elapsed().as_secs_f64(),
            );
            self.log.set_rejected(id, spam)?;
            report.trained.push(id);

            if delete {
                report.deleted += self.delete(&[id], true)?;
            }
        }
        Ok(report)
    }

    /// Remove decision log entries. With `record_stats`, each strategy's
    /// stored contribution is first scored against the entry's label.
    pub fn delete(&self, ids: &[i64], record_stats: bool) -> Result<usize> {
        if !record_stats {
            return self.log.delete(ids);
        }

        let mut removed = 0;
        for &id in ids {
            let Some(entry) = self.log.fetch(id)? else {
                continue;
            };
            let label = StatData::label(entry.rejected);
            for strategy in &self.strategies {
                let status =
                    contribution_status(entry.reason_points(strategy.name()), entry.rejected);
                self.record(Some(strategy.as_ref()), StatAction::Delete, label, status, 0.0);
            }
            self.record(None, StatAction::Delete, label, StatStatus::None, 0.0);
            removed += self.log.delete(&[id])?;
        }
        Ok(removed)
    }

    /// Delete rejected anonymous entries `strategy` was highly confident about.
    pub fn delete_obvious(&self, strategy: &str, threshold: f64) -> Result<usize> {
        let ids = self.log.find_obvious(strategy, threshold)?;
        if ids.is_empty() {
            return Ok(0);
        }
        log::info!("Deleting {} obvious spam entries", ids.len());
        self.delete(&ids, true)
    }

    fn record(
        &self,
        strategy: Option<&dyn FilterStrategy>,
        action: StatAction,
        data: StatData,
        status: StatStatus,
        delay: f64,
    ) {
        let (name, external) = match strategy {
            Some(s) => (s.name(), Some(s.is_external())),
            None => ("", None),
        };
        if let Err(e) = self.stats.record(name, action, data, status, delay, external) {
            log::warn!("Failed to record {action} statistic for {name:?}: {e:#}");
        }
    }
}
