use chrono::{Duration, Utc};
use karma_filter::api::Change;
use karma_filter::config::PatternRule;
use karma_filter::reject::RejectConfig;
use karma_filter::{
    Config, FilterStrategy, FilterSystem, Karma, LogEntry, LogFilter, Outcome, RejectAction,
    RequestContext, StatAction, StatData, StatStatus, Submission, TrainOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.database.path = dir
        .path()
        .join("db")
        .join("karma.db")
        .to_string_lossy()
        .into_owned();
    config.patterns = vec![
        PatternRule {
            pattern: "(?i)casino".to_string(),
            karma: -10,
        },
        PatternRule {
            pattern: "(?i)bug report".to_string(),
            karma: 2,
        },
    ];
    config
}

fn submission(author: &str, content: &str) -> Submission {
    Submission {
        request: RequestContext {
            path: "/ticket/7".to_string(),
            remote_addr: "192.0.2.10".to_string(),
            headers: vec![("User-Agent".to_string(), "Mozilla/5.0".to_string())],
            args: vec![("comment".to_string(), content.to_string())],
            ..Default::default()
        },
        author: author.to_string(),
        changes: vec![Change::new(content)],
    }
}

/// External strategy that always reports ham.
struct Remote {
    calls: Arc<AtomicUsize>,
}

impl FilterStrategy for Remote {
    fn name(&self) -> &str {
        "Remote"
    }

    fn is_external(&self) -> bool {
        true
    }

    fn test(&self, _: &RequestContext, _: &str, _: &str, _: &str) -> anyhow::Result<Option<Karma>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Karma::new(1, "Remote service says ham")))
    }

    fn train(
        &self,
        _: &RequestContext,
        _: &str,
        _: &str,
        _: &str,
        _: bool,
    ) -> anyhow::Result<TrainOutcome> {
        Ok(TrainOutcome::Trained)
    }
}

#[test]
fn test_configured_patterns_reject_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);

    let id = {
        let filter = FilterSystem::from_config(&config).unwrap();
        let verdict = filter.evaluate(&submission("visitor", "Best online casino bonus"));
        assert!(!verdict.accepted());
        assert_eq!(verdict.score, -10);
        assert_eq!(
            verdict.reasons[0].render(),
            "Regex (-10): Content contained these blacklisted patterns: '(?i)casino'"
        );
        verdict.log_id.unwrap()
    };

    // Reopen from disk.
    let filter = FilterSystem::from_config(&config).unwrap();
    let entry = filter.decision_log().fetch(id).unwrap().unwrap();
    assert!(entry.rejected);
    assert_eq!(entry.karma, -10);
    assert_eq!(entry.author, "visitor");
    assert_eq!(entry.ip, "192.0.2.10");
    assert_eq!(entry.headers, "User-Agent: Mozilla/5.0");
    assert_eq!(entry.content, "Best online casino bonus");
    assert_eq!(entry.request.unwrap().target, "/ticket/7");

    let row = filter
        .statistics()
        .get("Regex", StatAction::Test, StatData::Spam, StatStatus::Ok)
        .unwrap()
        .unwrap();
    assert_eq!(row.count, 1);
    assert_eq!(row.external, Some(false));
}

#[test]
fn test_accept_then_train_as_spam() {
    let dir = tempfile::tempdir().unwrap();
    let filter = FilterSystem::from_config(&config_in(&dir)).unwrap();

    let verdict = filter.evaluate(&submission("", "Here is my bug report"));
    assert_eq!(verdict.outcome, Outcome::Accepted);
    assert_eq!(verdict.score, 2);
    let id = verdict.log_id.unwrap();
    assert_eq!(
        filter.decision_log().fetch(id).unwrap().unwrap().author,
        "anonymous"
    );

    let report = filter.train(&[id, 9999], true, false).unwrap();
    assert_eq!(report.trained, vec![id]);
    assert_eq!(report.missing, vec![9999]);
    assert_eq!(filter.decision_log().count().unwrap(), 1);
    assert!(filter.decision_log().fetch(id).unwrap().unwrap().rejected);

    let rejected = filter
        .decision_log()
        .select(
            &LogFilter {
                rejected: Some(true),
                ..Default::default()
            },
            None,
            0,
        )
        .unwrap();
    assert_eq!(rejected.len(), 1);

    // The pattern strategy cannot learn; its ham verdict was wrong.
    let row = filter
        .statistics()
        .get("Regex", StatAction::TrainSkip, StatData::Spam, StatStatus::Error)
        .unwrap()
        .unwrap();
    assert_eq!(row.count, 1);
}

#[test]
fn test_challenge_handler_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    config.reject = RejectConfig::Challenge {
        target: "/captcha".to_string(),
    };
    let filter = FilterSystem::from_config(&config).unwrap();

    let verdict = filter.evaluate(&submission("visitor", "casino"));
    match verdict.rejection() {
        Some(RejectAction::Redirect {
            location, message, ..
        }) => {
            assert_eq!(location, "/captcha");
            assert!(message.contains("blacklisted patterns"));
        }
        other => panic!("Expected redirect, got {other:?}"),
    }
}

#[test]
fn test_external_strategy_gated_by_local_score() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = config_in(&dir);
    config.filter.skip_external = 5;
    let mut filter = FilterSystem::from_config(&config).unwrap();
    filter.register(Box::new(Remote {
        calls: calls.clone(),
    }));

    // Local score -10 is outside (-5, 30).
    filter.evaluate(&submission("visitor", "casino"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let verdict = filter.evaluate(&submission("visitor", "hello there"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(verdict.score, 1);

    let scores = filter.ranker().scores().unwrap();
    assert!(scores["Remote"] > 0);
    assert!(!scores.contains_key("Regex"));
}

#[test]
fn test_purge_retention() {
    let dir = tempfile::tempdir().unwrap();
    let filter = FilterSystem::from_config(&config_in(&dir)).unwrap();
    let log = filter.decision_log();

    let make = |days: i64| {
        let mut entry = LogEntry {
            id: None,
            time: Utc::now() - Duration::days(days),
            path: "/wiki/Start".to_string(),
            author: "anonymous".to_string(),
            authenticated: false,
            ip: "192.0.2.1".to_string(),
            headers: String::new(),
            content: format!("{days} days old"),
            rejected: false,
            karma: 0,
            reasons: Vec::new(),
            request: None,
        };
        log.insert(&mut entry).unwrap()
    };
    let old = make(7);
    let recent = make(1);

    assert_eq!(log.purge(4).unwrap(), 1);
    assert_eq!(log.fetch(old).unwrap(), None);
    assert!(log.fetch(recent).unwrap().is_some());
}
