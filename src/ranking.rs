//! Performance ranking of external strategies.
//!
//! The score only decides the order in which external strategies are asked;
//! fast, reliable strategies that actually answer go first so the stop band
//! is most likely to be reached before the slow ones are called.

use crate::api::FilterStrategy;
use crate::statistics::{StatAction, StatData, StatRow, StatStatus, Statistics};
use serde::Serialize;
use std::collections::HashMap;

/// Sub-scores making up a strategy's performance score (0-100).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Performance {
    /// 10 if the strategy ever classified something as ham.
    pub ham: i64,
    /// Up to 40 for a low worst-case latency (slowest call ever seen).
    pub speed: i64,
    /// Up to 25 for a low error rate when re-labeled.
    pub reliability: i64,
    /// Up to 25 for rarely abstaining.
    pub answer_rate: i64,
}

impl Performance {
    pub fn total(&self) -> i64 {
        self.ham + self.speed + self.reliability + self.answer_rate
    }
}

#[derive(Default)]
struct Tally {
    relabel_count: u64,
    relabel_errors: u64,
    max_delay: f64,
    reported_ham: bool,
    empty: u64,
    tests: u64,
}

/// Compute the performance breakdown of every external strategy found in `rows`.
pub fn performance(rows: &[StatRow]) -> HashMap<String, Performance> {
    let mut tallies: HashMap<&str, Tally> = HashMap::new();

    for row in rows
        .iter()
        .filter(|r| r.external == Some(true) && !r.strategy.is_empty())
    {
        let tally = tallies.entry(row.strategy.as_str()).or_default();
        if row.action.is_relabel() {
            if row.status == StatStatus::Error {
                tally.relabel_errors += row.count;
            }
            if row.status != StatStatus::None {
                tally.relabel_count += row.count;
            }
        } else if row.action == StatAction::Test {
            tally.max_delay = tally.max_delay.max(row.delay_max);
            match row.data {
                StatData::Empty => tally.empty += row.count,
                StatData::Ham => tally.reported_ham = true,
                _ => {}
            }
            tally.tests += row.count;
        }
    }

    tallies
        .into_iter()
        .map(|(name, t)| {
            let reliability = if t.relabel_count > 0 {
                25 - (1000.0 * t.relabel_errors as f64 / t.relabel_count as f64) as i64
            } else {
                15
            };
            let answer_rate = if t.tests > 0 {
                25 - (25.0 * t.empty as f64 / t.tests as f64) as i64
            } else {
                15
            };
            let perf = Performance {
                ham: if t.reported_ham { 10 } else { 0 },
                speed: (40 - (t.max_delay * 20.0) as i64).max(0),
                reliability: reliability.max(0),
                answer_rate: answer_rate.max(0),
            };
            (name.to_string(), perf)
        })
        .collect()
}

/// Orders strategies by their recorded performance.
pub struct StrategyRanker<'a> {
    stats: &'a Statistics,
}

impl<'a> StrategyRanker<'a> {
    pub fn new(stats: &'a Statistics) -> Self {
        Self { stats }
    }

    /// Total score per strategy name.
    pub fn scores(&self) -> anyhow::Result<HashMap<String, i64>> {
        Ok(performance(&self.stats.rows()?)
            .into_iter()
            .map(|(name, perf)| (name, perf.total()))
            .collect())
    }

    /// Sort `candidates` best-first. Strategies without statistics score 0;
    /// ties keep their registration order.
    pub fn order<'s>(&self, candidates: Vec<&'s dyn FilterStrategy>) -> Vec<&'s dyn FilterStrategy> {
        match self.scores() {
            Ok(scores) => order_by_score(&scores, candidates),
            Err(e) => {
                log::warn!("Failed to read statistics for ranking, keeping registration order: {e}");
                candidates
            }
        }
    }
}

pub fn order_by_score<'s>(
    scores: &HashMap<String, i64>,
    mut candidates: Vec<&'s dyn FilterStrategy>,
) -> Vec<&'s dyn FilterStrategy> {
    candidates.sort_by_key(|s| std::cmp::Reverse(scores.get(s.name()).copied().unwrap_or(0)));
    candidates
}
