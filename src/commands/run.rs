use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::commands::CommandReport;
use crate::digest::config::{ConfigOverrides, config_error, load_config, slack_token, unknown_env_keys};
use crate::digest::history::TimeWindow;
use crate::digest::name_cache::NameCache;
use crate::digest::normalize::DisplayZone;
use crate::digest::orchestrator::{RunPlan, Services, run_channels};
use crate::digest::paths::resolve_paths;
use crate::digest::summarize::{RemoteSummarizer, Summarizer};
use crate::digest::warn::{self, Warning};
use crate::logging;
use crate::slack::client::SlackClient;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
    pub refresh_names: bool,
    pub dry_run: bool,
    pub verbose: bool,
}

pub fn run(opts: &RunOptions) -> Result<CommandReport> {
    let cfg = load_config(opts.config_path.as_deref(), &opts.overrides)?;
    let paths = resolve_paths(&cfg.output)?;
    logging::init(opts.verbose, &paths.logs_dir);

    for key in unknown_env_keys() {
        warn::emit(Warning {
            code: "UNKNOWN_ENV",
            stage: "config",
            reason: "not-recognized",
            err: &key,
            ..Warning::default()
        });
    }

    let zone = DisplayZone::parse(&cfg.summary.timezone)
        .ok_or_else(|| config_error(format!("unknown timezone `{}`", cfg.summary.timezone)))?;
    let summarizer = if opts.dry_run {
        None
    } else {
        Some(RemoteSummarizer::from_config(&cfg.llm)?)
    };

    let slack = SlackClient::new(&cfg.slack, slack_token()?)?;
    let identity = slack.auth_test()?;
    info!(user = %identity.user, team = %identity.team, "slack token verified");

    let names = if opts.refresh_names {
        let cache = NameCache::empty(&paths.cache_file);
        cache
            .clear()
            .with_context(|| format!("failed to reset {}", paths.cache_file.display()))?;
        cache
    } else {
        NameCache::load(&paths.cache_file)
    };
    if names.is_empty() {
        info!(path = %paths.cache_file.display(), "name cache empty; names will be fetched");
    }

    let window = TimeWindow::ending_at(Utc::now(), cfg.summary.window_days);
    let run_report = run_channels(
        &RunPlan {
            channels: &cfg.slack.channels,
            window,
            zone,
            workers: cfg.run.workers,
            dry_run: opts.dry_run,
            paths: &paths,
        },
        &Services {
            history: &slack,
            lookup: &slack,
            names: &names,
            summarizer: summarizer.as_ref().map(|s| s as &dyn Summarizer),
        },
    )?;

    let mut report = CommandReport::new("run");
    report.detail(format!("workspace={} user={}", identity.team, identity.user));
    report.detail(format!("window={} ({} days)", window.label(), window.days()));
    report.detail(format!("cached_names={}", names.len()));
    if let Some(summarizer) = &summarizer {
        report.detail(format!("model={}", summarizer.describe()));
    } else {
        report.detail("dry_run=true");
    }
    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!("output_dir={}", paths.output_dir.display()));
    for outcome in &run_report.outcomes {
        if outcome.is_failure() {
            report.issue(outcome.summary_line());
        } else {
            report.detail(outcome.summary_line());
        }
    }
    if !run_report.all_ok() {
        info!(failed = run_report.failed_count(), "run finished with channel failures");
    }
    report.run = Some(run_report);
    Ok(report)
}
