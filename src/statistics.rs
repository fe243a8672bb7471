use crate::database::Database;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// What was being done when a statistic was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatAction {
    /// A single strategy's test call.
    Test,
    /// A whole evaluation that only reached local strategies.
    TestLocal,
    /// A whole evaluation that reached at least one external strategy.
    TestExternal,
    /// A strategy that trained successfully.
    Train,
    TrainSkip,
    TrainError,
    TrainMissingPrecondition,
    /// A whole re-labeling that only trained local strategies.
    TrainLocal,
    TrainExternal,
    Delete,
}

impl StatAction {
    pub fn as_str(self) -> &'static str {
        match self {
            StatAction::Test => "test",
            StatAction::TestLocal => "testint",
            StatAction::TestExternal => "testext",
            StatAction::Train => "train",
            StatAction::TrainSkip => "trainskip",
            StatAction::TrainError => "trainerror",
            StatAction::TrainMissingPrecondition => "traincond",
            StatAction::TrainLocal => "trainint",
            StatAction::TrainExternal => "trainext",
            StatAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "test" => StatAction::Test,
            "testint" => StatAction::TestLocal,
            "testext" => StatAction::TestExternal,
            "train" => StatAction::Train,
            "trainskip" => StatAction::TrainSkip,
            "trainerror" => StatAction::TrainError,
            "traincond" => StatAction::TrainMissingPrecondition,
            "trainint" => StatAction::TrainLocal,
            "trainext" => StatAction::TrainExternal,
            "delete" => StatAction::Delete,
            _ => return None,
        })
    }

    /// Training and deletion both re-attribute a past verdict.
    pub fn is_relabel(self) -> bool {
        matches!(
            self,
            StatAction::Train
                | StatAction::TrainSkip
                | StatAction::TrainError
                | StatAction::TrainMissingPrecondition
                | StatAction::TrainLocal
                | StatAction::TrainExternal
                | StatAction::Delete
        )
    }
}

/// The classification a statistic is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatData {
    None,
    /// The strategy abstained.
    Empty,
    Ham,
    Spam,
    /// The strategy failed.
    Error,
}

impl StatData {
    pub fn as_str(self) -> &'static str {
        match self {
            StatData::None => "",
            StatData::Empty => "empty",
            StatData::Ham => "ham",
            StatData::Spam => "spam",
            StatData::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "" => StatData::None,
            "empty" => StatData::Empty,
            "ham" => StatData::Ham,
            "spam" => StatData::Spam,
            "error" => StatData::Error,
            _ => return None,
        })
    }

    pub fn label(spam: bool) -> Self {
        if spam {
            StatData::Spam
        } else {
            StatData::Ham
        }
    }
}

/// Whether a strategy's verdict agreed with the final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatStatus {
    None,
    Ok,
    Error,
}

impl StatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StatStatus::None => "",
            StatStatus::Ok => "ok",
            StatStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "" => StatStatus::None,
            "ok" => StatStatus::Ok,
            "error" => StatStatus::Error,
            _ => return None,
        })
    }

    pub fn agreement(agrees: bool) -> Self {
        if agrees {
            StatStatus::Ok
        } else {
            StatStatus::Error
        }
    }
}

impl fmt::Display for StatAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aggregated statistics row. An empty `strategy` is the global aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatRow {
    pub strategy: String,
    pub action: StatAction,
    pub data: StatData,
    pub status: StatStatus,
    /// Running mean delay in seconds.
    pub delay: f64,
    pub delay_max: f64,
    pub delay_min: f64,
    pub count: u64,
    pub external: Option<bool>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HamSpam {
    pub ham: u64,
    pub spam: u64,
}

impl HamSpam {
    fn add(&mut self, data: StatData, count: u64) {
        match data {
            StatData::Ham => self.ham += count,
            StatData::Spam => self.spam += count,
            _ => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.ham + self.spam
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdicts {
    pub ok: u64,
    pub error: u64,
}

impl Verdicts {
    fn add(&mut self, status: StatStatus, count: u64) {
        match status {
            StatStatus::Ok => self.ok += count,
            StatStatus::Error => self.error += count,
            StatStatus::None => {}
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StrategySummary {
    pub external: bool,
    pub test_total: u64,
    pub test_empty: u64,
    pub test_errors: u64,
    pub test_ham: Verdicts,
    pub test_spam: Verdicts,
    /// Mean test delay in seconds across all test outcomes.
    pub test_time: f64,
    pub trained: HamSpam,
    pub train_failed: HamSpam,
    pub train_missing_precondition: HamSpam,
    pub train_skipped: HamSpam,
    /// Retroactive correctness of the strategy's original verdicts, by corrected label.
    pub train_ham: Verdicts,
    pub train_spam: Verdicts,
    pub train_total: u64,
    /// Failed plus missing-precondition training calls.
    pub train_errors: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct GlobalSummary {
    pub total: u64,
    pub since: Option<DateTime<Utc>>,
    pub local: u64,
    pub external: u64,
    pub local_time: f64,
    pub external_time: f64,
    pub spam: u64,
    pub ham: u64,
}

/// Weighted merge of a running mean with another group's mean.
fn merge_mean(mean: f64, count: u64, other_mean: f64, other_count: u64) -> f64 {
    let total = (count + other_count) as f64;
    if total == 0.0 {
        return 0.0;
    }
    mean * (count as f64 / total) + other_mean * (other_count as f64 / total)
}

/// Durable per-(strategy, action, data, status) counters.
#[derive(Clone)]
pub struct Statistics {
    db: Database,
}

impl Statistics {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert one sample. Pass an empty `strategy` for global aggregates.
    pub fn record(
        &self,
        strategy: &str,
        action: StatAction,
        data: StatData,
        status: StatStatus,
        delay: f64,
        external: Option<bool>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<(f64, f64, f64, i64)> = tx
                .query_row(
                    "SELECT delay, delay_max, delay_min, count FROM karma_statistics
                     WHERE strategy = ?1 AND action = ?2 AND data = ?3 AND status = ?4",
                    params![strategy, action.as_str(), data.as_str(), status.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            match existing {
                Some((mean, delay_max, delay_min, count)) => {
                    let n = count as f64;
                    let mean = mean * (n / (n + 1.0)) + delay / (n + 1.0);
                    tx.execute(
                        "UPDATE karma_statistics
                         SET delay = ?1, delay_max = ?2, delay_min = ?3, count = ?4
                         WHERE strategy = ?5 AND action = ?6 AND data = ?7 AND status = ?8",
                        params![
                            mean,
                            delay_max.max(delay),
                            delay_min.min(delay),
                            count + 1,
                            strategy,
                            action.as_str(),
                            data.as_str(),
                            status.as_str()
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO karma_statistics
                         (strategy, action, data, status, delay, delay_max, delay_min,
                          count, external, time)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5, 1, ?6, ?7)",
                        params![
                            strategy,
                            action.as_str(),
                            data.as_str(),
                            status.as_str(),
                            delay,
                            external,
                            Utc::now().timestamp()
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        log::debug!(
            "KARMALOG: {} {} {} {} {:.3} {}",
            action,
            data.as_str(),
            status.as_str(),
            strategy,
            delay,
            match external {
                Some(true) => "external",
                _ => "local",
            }
        );
        Ok(())
    }

    /// All stored rows. Rows with unknown tags are skipped.
    pub fn rows(&self) -> Result<Vec<StatRow>> {
        let raw = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT strategy, action, data, status, delay, delay_max, delay_min,
                        count, external, time
                 FROM karma_statistics ORDER BY strategy, action, data, status",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, Option<bool>>(8)?,
                        row.get::<_, i64>(9)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut rows = Vec::with_capacity(raw.len());
        for (strategy, action, data, status, delay, delay_max, delay_min, count, external, time) in raw
        {
            let (Some(action), Some(data), Some(status)) = (
                StatAction::parse(&action),
                StatData::parse(&data),
                StatStatus::parse(&status),
            ) else {
                log::warn!("Skipping unknown statistics row: {strategy} {action} {data} {status}");
                continue;
            };
            rows.push(StatRow {
                strategy,
                action,
                data,
                status,
                delay,
                delay_max,
                delay_min,
                count: count.max(0) as u64,
                external,
                time: DateTime::from_timestamp(time, 0).unwrap_or_default(),
            });
        }
        Ok(rows)
    }

    /// Per-strategy summaries plus the global summary.
    pub fn summary(&self) -> Result<(BTreeMap<String, StrategySummary>, GlobalSummary)> {
        Ok(Self::summarize(&self.rows()?))
    }

    pub fn summarize(rows: &[StatRow]) -> (BTreeMap<String, StrategySummary>, GlobalSummary) {
        let mut strategies: BTreeMap<String, StrategySummary> = BTreeMap::new();
        let mut overall = GlobalSummary::default();

        for row in rows {
            if row.strategy.is_empty() {
                if overall.since.map_or(true, |since| row.time < since) {
                    overall.since = Some(row.time);
                }
                match row.action {
                    StatAction::TestLocal => {
                        overall.local_time =
                            merge_mean(overall.local_time, overall.local, row.delay, row.count);
                        overall.local += row.count;
                    }
                    StatAction::TestExternal => {
                        overall.external_time = merge_mean(
                            overall.external_time,
                            overall.external,
                            row.delay,
                            row.count,
                        );
                        overall.external += row.count;
                    }
                    _ => continue,
                }
                overall.total += row.count;
                if row.data == StatData::Spam {
                    overall.spam += row.count;
                } else {
                    overall.ham += row.count;
                }
                continue;
            }

            let summary = strategies.entry(row.strategy.clone()).or_default();
            summary.external = row.external.unwrap_or(false);

            match row.action {
                StatAction::Test => {
                    match row.data {
                        StatData::Empty => summary.test_empty += row.count,
                        StatData::Error => summary.test_errors += row.count,
                        StatData::Ham => summary.test_ham.add(row.status, row.count),
                        StatData::Spam => summary.test_spam.add(row.status, row.count),
                        StatData::None => {}
                    }
                    summary.test_time =
                        merge_mean(summary.test_time, summary.test_total, row.delay, row.count);
                    summary.test_total += row.count;
                }
                action if action.is_relabel() => {
                    match action {
                        StatAction::Train => summary.trained.add(row.data, row.count),
                        StatAction::TrainError => summary.train_failed.add(row.data, row.count),
                        StatAction::TrainMissingPrecondition => {
                            summary.train_missing_precondition.add(row.data, row.count)
                        }
                        StatAction::TrainSkip => summary.train_skipped.add(row.data, row.count),
                        _ => {}
                    }
                    if row.status != StatStatus::None {
                        match row.data {
                            StatData::Ham => summary.train_ham.add(row.status, row.count),
                            StatData::Spam => summary.train_spam.add(row.status, row.count),
                            _ => {}
                        }
                        summary.train_total += row.count;
                    }
                    if matches!(
                        action,
                        StatAction::TrainError | StatAction::TrainMissingPrecondition
                    ) {
                        summary.train_errors += row.count;
                    }
                }
                _ => {}
            }
        }

        (strategies, overall)
    }

    /// Look up a single row.
    pub fn get(
        &self,
        strategy: &str,
        action: StatAction,
        data: StatData,
        status: StatStatus,
    ) -> Result<Option<StatRow>> {
        Ok(self.rows()?.into_iter().find(|r| {
            r.strategy == strategy && r.action == action && r.data == data && r.status == status
        }))
    }

    pub fn clear(&self, strategy: &str) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM karma_statistics WHERE strategy = ?1",
                params![strategy],
            )?)
        })
    }

    pub fn clear_all(&self) -> Result<usize> {
        self.db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM karma_statistics", [])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stats() -> Statistics {
        Statistics::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_tags_round_trip() {
        for action in [
            StatAction::Test,
            StatAction::TestLocal,
            StatAction::TestExternal,
            StatAction::Train,
            StatAction::TrainSkip,
            StatAction::TrainError,
            StatAction::TrainMissingPrecondition,
            StatAction::TrainLocal,
            StatAction::TrainExternal,
            StatAction::Delete,
        ] {
            assert_eq!(StatAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(StatAction::parse("bogus"), None);
        assert_eq!(StatData::parse("ham"), Some(StatData::Ham));
        assert_eq!(StatStatus::parse(""), Some(StatStatus::None));
    }

    #[test]
    fn test_running_aggregates() {
        let stats = stats();
        for delay in [0.5, 1.5, 1.0] {
            stats
                .record("Akismet", StatAction::Test, StatData::Spam, StatStatus::Ok, delay, Some(true))
                .unwrap();
        }

        let row = stats
            .get("Akismet", StatAction::Test, StatData::Spam, StatStatus::Ok)
            .unwrap()
            .unwrap();
        assert_eq!(row.count, 3);
        assert!((row.delay - 1.0).abs() < 1e-9);
        assert_eq!(row.delay_max, 1.5);
        assert_eq!(row.delay_min, 0.5);
        assert_eq!(row.external, Some(true));
    }

    #[test]
    fn test_keys_are_independent() {
        let stats = stats();
        stats
            .record("Regex", StatAction::Test, StatData::Spam, StatStatus::Ok, 0.1, Some(false))
            .unwrap();
        stats
            .record("Regex", StatAction::Test, StatData::Spam, StatStatus::Error, 0.1, Some(false))
            .unwrap();
        stats
            .record("", StatAction::TestLocal, StatData::Spam, StatStatus::None, 0.2, None)
            .unwrap();
        assert_eq!(stats.rows().unwrap().len(), 3);
    }

    #[test]
    fn test_clear() {
        let stats = stats();
        stats
            .record("Regex", StatAction::Test, StatData::Empty, StatStatus::None, 0.0, Some(false))
            .unwrap();
        stats
            .record("Akismet", StatAction::Test, StatData::Empty, StatStatus::None, 0.0, Some(true))
            .unwrap();

        assert_eq!(stats.clear("Regex").unwrap(), 1);
        let rows = stats.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].strategy, "Akismet");

        stats.clear_all().unwrap();
        assert!(stats.rows().unwrap().is_empty());
    }

    #[test]
    fn test_summary() {
        let stats = stats();
        let record = |strategy: &str,
                      action: StatAction,
                      data: StatData,
                      status: StatStatus,
                      delay: f64,
                      external: Option<bool>| {
            stats
                .record(strategy, action, data, status, delay, external)
                .unwrap()
        };

        record("Akismet", StatAction::Test, StatData::Spam, StatStatus::Ok, 1.0, Some(true));
        record("Akismet", StatAction::Test, StatData::Ham, StatStatus::Error, 3.0, Some(true));
        record("Akismet", StatAction::Test, StatData::Empty, StatStatus::None, 2.0, Some(true));
        record("Akismet", StatAction::Test, StatData::Error, StatStatus::None, 2.0, Some(true));
        record("Akismet", StatAction::Train, StatData::Spam, StatStatus::Ok, 0.5, Some(true));
        record("Akismet", StatAction::TrainError, StatData::Ham, StatStatus::Error, 0.5, Some(true));
        record("Akismet", StatAction::TrainMissingPrecondition, StatData::Ham, StatStatus::None, 0.0, Some(true));
        record("Akismet", StatAction::Delete, StatData::Spam, StatStatus::Ok, 0.0, Some(true));
        record("", StatAction::TestLocal, StatData::Ham, StatStatus::None, 0.2, None);
        record("", StatAction::TestLocal, StatData::Ham, StatStatus::None, 0.4, None);
        record("", StatAction::TestExternal, StatData::Spam, StatStatus::None, 1.0, None);
        record("", StatAction::TrainLocal, StatData::Spam, StatStatus::Ok, 0.1, None);

        let (strategies, overall) = stats.summary().unwrap();
        let akismet = &strategies["Akismet"];
        assert!(akismet.external);
        assert_eq!(akismet.test_total, 4);
        assert_eq!(akismet.test_empty, 1);
        assert_eq!(akismet.test_errors, 1);
        assert_eq!(akismet.test_spam, Verdicts { ok: 1, error: 0 });
        assert_eq!(akismet.test_ham, Verdicts { ok: 0, error: 1 });
        assert!((akismet.test_time - 2.0).abs() < 1e-9);
        assert_eq!(akismet.trained, HamSpam { ham: 0, spam: 1 });
        assert_eq!(akismet.train_failed, HamSpam { ham: 1, spam: 0 });
        assert_eq!(akismet.train_missing_precondition, HamSpam { ham: 1, spam: 0 });
        assert_eq!(akismet.train_spam, Verdicts { ok: 2, error: 0 });
        assert_eq!(akismet.train_ham, Verdicts { ok: 0, error: 1 });
        assert_eq!(akismet.train_total, 3);
        assert_eq!(akismet.train_errors, 2);

        assert_eq!(overall.total, 3);
        assert_eq!(overall.local, 2);
        assert_eq!(overall.external, 1);
        assert_eq!(overall.ham, 2);
        assert_eq!(overall.spam, 1);
        assert!(overall.since.is_some());
        // One row per key: the local mean is kept by the running average.
        assert!((overall.local_time - 0.3).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_mean_is_order_independent(delays in prop::collection::vec(0.0f64..10.0, 1..30)) {
            let expected = delays.iter().sum::<f64>() / delays.len() as f64;

            let forward = stats();
            for d in &delays {
                forward.record("S", StatAction::Test, StatData::Ham, StatStatus::Ok, *d, Some(true)).unwrap();
            }
            let backward = stats();
            for d in delays.iter().rev() {
                backward.record("S", StatAction::Test, StatData::Ham, StatStatus::Ok, *d, Some(true)).unwrap();
            }

            for store in [forward, backward] {
                let row = store.get("S", StatAction::Test, StatData::Ham, StatStatus::Ok).unwrap().unwrap();
                prop_assert_eq!(row.count, delays.len() as u64);
                prop_assert!((row.delay - expected).abs() < 1e-9);
            }
        }
    }
}
