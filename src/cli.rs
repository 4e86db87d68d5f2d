use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::commands;
use crate::commands::CommandReport;
use crate::commands::run::RunOptions;
use crate::digest::config::ConfigOverrides;

#[derive(Debug, Parser)]
#[command(
    name = "slack-digest",
    version,
    about = "Summarize recent Slack channel history into markdown files"
)]
pub struct Cli {
    /// Config file (TOML). Defaults to DIGEST_CONFIG_PATH, ./config/digest.toml,
    /// then ~/.slack-digest/config.toml.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Channel id to summarize; repeat for several. Replaces the configured list.
    #[arg(long = "channel", value_name = "ID")]
    channels: Vec<String>,

    /// Days of history to summarize, ending now.
    #[arg(long, value_name = "N")]
    days: Option<u64>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Channels processed concurrently.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Discard cached user and channel names before running.
    #[arg(long)]
    refresh_names: bool,

    /// Fetch and normalize only; no model call, no files written.
    #[arg(long)]
    dry_run: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            config_path: self.config.clone(),
            overrides: ConfigOverrides {
                channels: self.channels.clone(),
                window_days: self.days,
                output_dir: self.output_dir.clone(),
                workers: self.workers,
            },
            refresh_names: self.refresh_names,
            dry_run: self.dry_run,
            verbose: self.verbose,
        }
    }
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

/// Returns whether every channel succeeded or was skipped.
pub fn run() -> Result<bool> {
    let cli = Cli::parse();
    let report = commands::run::run(&cli.run_options())?;
    print_report(&report, cli.json)?;
    Ok(report.ok)
}
