use clap::{Arg, ArgAction, Command};
use karma_filter::content::abbreviate;
use karma_filter::ranking::performance;
use karma_filter::{Config, FilterSystem, LogFilter, Outcome, Submission};
use log::LevelFilter;
use std::process;

fn main() {
    let matches = Command::new("karma-filter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Karma based spam filtering for user submitted content")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/karma-filter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-submission")
                .long("test-submission")
                .value_name("FILE")
                .help("Evaluate a JSON submission with the configured strategies")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("N")
                .help("List the newest N decision log entries")
                .num_args(0..=1)
                .default_missing_value("20")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("train-spam")
                .long("train-spam")
                .value_name("ID")
                .help("Re-label decision log entries as spam")
                .num_args(1..)
                .value_parser(clap::value_parser!(i64))
                .conflicts_with("train-ham"),
        )
        .arg(
            Arg::new("train-ham")
                .long("train-ham")
                .value_name("ID")
                .help("Re-label decision log entries as ham")
                .num_args(1..)
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("delete")
                .long("delete")
                .help("Delete entries after training")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("purge")
                .long("purge")
                .help("Remove decision log entries older than the configured purge age")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show strategy statistics and ranking scores")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-reset")
                .long("stats-reset")
                .value_name("STRATEGY")
                .help("Reset statistics for one strategy, or all of them")
                .num_args(0..=1)
                .default_missing_value(""),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/karma-filter.yaml");

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let (config, found) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config
            .logging
            .as_ref()
            .and_then(|l| l.level.parse().ok())
            .unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    let filter = match FilterSystem::from_config(&config) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Error initializing filter: {e:#}");
            process::exit(1);
        }
    };

    let result = if let Some(file) = matches.get_one::<String>("test-submission") {
        test_submission(&filter, file)
    } else if let Some(limit) = matches.get_one::<usize>("log") {
        list_log(&filter, *limit)
    } else if let Some(ids) = matches.get_many::<i64>("train-spam") {
        train(&filter, &ids.copied().collect::<Vec<_>>(), true, matches.get_flag("delete"))
    } else if let Some(ids) = matches.get_many::<i64>("train-ham") {
        train(&filter, &ids.copied().collect::<Vec<_>>(), false, matches.get_flag("delete"))
    } else if matches.get_flag("purge") {
        filter
            .decision_log()
            .purge(filter.config().purge_age)
            .map(|removed| println!("Purged {removed} decision log entries"))
    } else if let Some(strategy) = matches.get_one::<String>("stats-reset") {
        reset_stats(&filter, strategy)
    } else if matches.get_flag("stats") {
        show_stats(&filter)
    } else {
        println!("Nothing to do. See --help for available commands.");
        Ok(())
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<(Config, bool)> {
    if std::path::Path::new(path).exists() {
        Ok((Config::from_file(path)?, true))
    } else {
        Ok((Config::default(), false))
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn test_submission(filter: &FilterSystem, file: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read submission: {file}"))?;
    let submission: Submission = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse submission: {file}"))?;

    let verdict = filter.evaluate(&submission);
    println!("Score: {}", verdict.score);
    if !verdict.reasons.is_empty() {
        println!("Reasons:");
        for reason in &verdict.reasons {
            println!("  {}", reason.render());
        }
    }
    match &verdict.outcome {
        Outcome::Trusted => println!("Verdict: ACCEPT (trusted user)"),
        Outcome::Accepted => println!("Verdict: ACCEPT"),
        Outcome::Rejected(action) => {
            println!("Verdict: REJECT");
            println!("{}", action.message());
        }
    }
    if let Some(id) = verdict.log_id {
        println!("Logged as entry {id}");
    }
    Ok(())
}

fn list_log(filter: &FilterSystem, limit: usize) -> anyhow::Result<()> {
    let log = filter.decision_log();
    let entries = log.select(&LogFilter::default(), Some(limit), 0)?;
    println!("Showing {} of {} entries", entries.len(), log.count()?);
    for entry in entries {
        println!(
            "{:>6} {} {:<6} {:>5} {:<20} {:<15} {}",
            entry.id.unwrap_or_default(),
            entry.time.format("%Y-%m-%d %H:%M:%S"),
            if entry.rejected { "SPAM" } else { "ham" },
            entry.karma,
            truncate_string(&entry.author, 20),
            entry.ip,
            abbreviate(&entry.content, 40)
        );
        for reason in entry.rendered_reasons() {
            println!("         {reason}");
        }
    }
    Ok(())
}

fn train(filter: &FilterSystem, ids: &[i64], spam: bool, delete: bool) -> anyhow::Result<()> {
    let report = filter.train(ids, spam, delete)?;
    println!(
        "Marked {} entries as {}",
        report.trained.len(),
        if spam { "spam" } else { "ham" }
    );
    if report.deleted > 0 {
        println!("Deleted {} entries", report.deleted);
    }
    if !report.missing.is_empty() {
        println!("Skipped unknown entries: {:?}", report.missing);
    }
    Ok(())
}

fn reset_stats(filter: &FilterSystem, strategy: &str) -> anyhow::Result<()> {
    let stats = filter.statistics();
    let removed = if strategy.is_empty() {
        stats.clear_all()?
    } else {
        stats.clear(strategy)?
    };
    println!("Removed {removed} statistics rows");
    Ok(())
}

fn show_stats(filter: &FilterSystem) -> anyhow::Result<()> {
    let rows = filter.statistics().rows()?;
    let (strategies, global) = karma_filter::Statistics::summarize(&rows);
    let scores = performance(&rows);

    println!("Karma Filter Statistics");
    println!("=======================================");
    println!("Evaluations: {} ({} spam, {} ham)", global.total, global.spam, global.ham);
    if let Some(since) = global.since {
        println!("Since: {}", since.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "  local only: {} (avg {:.3}s), with external: {} (avg {:.3}s)",
        global.local, global.local_time, global.external, global.external_time
    );
    println!();

    if strategies.is_empty() {
        println!("No strategy statistics recorded yet");
        return Ok(());
    }

    println!(
        "{:<24} {:>4} {:>7} {:>6} {:>6} {:>8} {:>7} {:>6} {:>6}",
        "Strategy", "Ext", "Tests", "Empty", "Errors", "Avg(s)", "Trained", "TrErr", "Score"
    );
    for (name, summary) in &strategies {
        let score = scores
            .get(name)
            .map(|p| p.total().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:>4} {:>7} {:>6} {:>6} {:>8.3} {:>7} {:>6} {:>6}",
            truncate_string(name, 24),
            if summary.external { "yes" } else { "no" },
            summary.test_total,
            summary.test_empty,
            summary.test_errors,
            summary.test_time,
            summary.trained.total(),
            summary.train_errors,
            score
        );
    }
    Ok(())
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
