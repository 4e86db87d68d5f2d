use crate::digest::audit;
use crate::digest::config::ChannelSpec;
use crate::digest::history::{HistorySource, TimeWindow, message_count, thread_gap_count};
use crate::digest::name_cache::{NameCache, NameLookup};
use crate::digest::normalize::{DisplayZone, Normalizer};
use crate::digest::output::{SummaryMeta, write_summary};
use crate::digest::paths::DigestPaths;
use crate::digest::summarize::{SummaryRequest, Summarizer};
use crate::digest::warn::{self, Warning};
use crate::error::FailureKind;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{error, info};

/// Remote collaborators shared by every channel task.
pub struct Services<'a> {
    pub history: &'a (dyn HistorySource + Sync),
    pub lookup: &'a (dyn NameLookup + Sync),
    pub names: &'a NameCache,
    /// Absent in dry runs.
    pub summarizer: Option<&'a dyn Summarizer>,
}

pub struct RunPlan<'a> {
    pub channels: &'a [ChannelSpec],
    pub window: TimeWindow,
    pub zone: DisplayZone,
    pub workers: usize,
    pub dry_run: bool,
    pub paths: &'a DigestPaths,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelStatus {
    Succeeded {
        path: PathBuf,
        message_count: usize,
        thread_gaps: usize,
    },
    DryRun {
        message_count: usize,
        thread_gaps: usize,
    },
    Skipped {
        reason: String,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl ChannelStatus {
    fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::DryRun { .. } => "dry_run",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Succeeded {
                path,
                message_count,
                thread_gaps,
            } => format!(
                "{message_count} messages, {thread_gaps} thread gaps -> {}",
                path.display()
            ),
            Self::DryRun {
                message_count,
                thread_gaps,
            } => format!("{message_count} messages, {thread_gaps} thread gaps (dry run)"),
            Self::Skipped { reason } => reason.clone(),
            Self::Failed { kind, message } => format!("{}: {message}", kind.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelOutcome {
    pub channel_id: String,
    pub channel_name: String,
    #[serde(flatten)]
    pub status: ChannelStatus,
}

impl ChannelOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, ChannelStatus::Failed { .. })
    }

    pub fn summary_line(&self) -> String {
        format!(
            "#{} ({}): {} {}",
            self.channel_name,
            self.channel_id,
            self.status.label(),
            self.status.describe()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub window: TimeWindow,
    pub dry_run: bool,
    pub outcomes: Vec<ChannelOutcome>,
}

impl RunReport {
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    pub fn all_ok(&self) -> bool {
        self.failed_count() == 0
    }
}

fn record_audit(paths: &DigestPaths, outcome: &ChannelOutcome, summary: Option<&str>) {
    if let Err(err) = audit::append_event(
        paths,
        &outcome.channel_id,
        outcome.status.label(),
        &outcome.status.describe(),
        summary,
    ) {
        warn::emit(Warning {
            code: "AUDIT_WRITE",
            stage: "audit",
            channel: &outcome.channel_id,
            err: &format!("{err:#}"),
            ..Warning::default()
        });
    }
}

/// Fetch, normalize, summarize and write one channel. Returns the summary
/// text alongside the status so the caller can audit it.
fn process_channel(
    spec: &ChannelSpec,
    channel_name: &str,
    plan: &RunPlan<'_>,
    services: &Services<'_>,
) -> Result<(ChannelStatus, Option<String>)> {
    let threads = services.history.fetch_history(&spec.id, &plan.window)?;
    if threads.is_empty() {
        return Ok((
            ChannelStatus::Skipped {
                reason: "no messages in window".to_string(),
            },
            None,
        ));
    }
    let count = message_count(&threads);
    let gaps = thread_gap_count(&threads);
    let messages =
        Normalizer::new(services.names, services.lookup, plan.zone).flatten(&threads);

    if plan.dry_run {
        return Ok((
            ChannelStatus::DryRun {
                message_count: count,
                thread_gaps: gaps,
            },
            None,
        ));
    }

    let summarizer = services
        .summarizer
        .context("no summarizer configured for a non-dry run")?;
    let summary = summarizer.summarize(&SummaryRequest {
        channel_id: &spec.id,
        channel_name,
        window: &plan.window,
        messages: &messages,
    })?;
    let model = summarizer.describe();
    let path = write_summary(
        &plan.paths.output_dir,
        &spec.id,
        &plan.window,
        &summary,
        &SummaryMeta {
            channel_name,
            generated_at: Utc::now(),
            message_count: count,
            model: &model,
            zone: plan.zone,
        },
    )?;
    Ok((
        ChannelStatus::Succeeded {
            path,
            message_count: count,
            thread_gaps: gaps,
        },
        Some(summary),
    ))
}

/// Run one channel to an outcome. Only run-level failures come back as `Err`.
fn run_one(
    spec: &ChannelSpec,
    plan: &RunPlan<'_>,
    services: &Services<'_>,
) -> Result<ChannelOutcome> {
    let started = Instant::now();
    let channel_name = spec
        .name
        .clone()
        .unwrap_or_else(|| services.names.resolve_channel(&spec.id, services.lookup));
    info!(channel = %spec.id, name = %channel_name, "processing channel");

    let (status, summary) = match process_channel(spec, &channel_name, plan, services) {
        Ok(done) => done,
        Err(err) => {
            let kind = FailureKind::classify(&err);
            let status = ChannelStatus::Failed {
                kind,
                message: format!("{err:#}"),
            };
            let outcome = ChannelOutcome {
                channel_id: spec.id.clone(),
                channel_name,
                status,
            };
            record_audit(plan.paths, &outcome, None);
            if kind.is_fatal() {
                error!(channel = %spec.id, kind = kind.as_str(), "aborting run: {err:#}");
                return Err(err.context(format!("channel {}", spec.id)));
            }
            warn::emit(Warning {
                code: "CHANNEL_FAILED",
                stage: "channel",
                channel: &spec.id,
                reason: kind.as_str(),
                err: &format!("{err:#}"),
                ..Warning::default()
            });
            return Ok(outcome);
        }
    };

    let outcome = ChannelOutcome {
        channel_id: spec.id.clone(),
        channel_name,
        status,
    };
    info!(
        channel = %spec.id,
        status = outcome.status.label(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "{}",
        outcome.status.describe()
    );
    record_audit(plan.paths, &outcome, summary.as_deref());
    Ok(outcome)
}

fn run_parallel(
    plan: &RunPlan<'_>,
    services: &Services<'_>,
    workers: usize,
) -> Result<Vec<ChannelOutcome>> {
    let total = plan.channels.len();
    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let slots: Mutex<Vec<Option<ChannelOutcome>>> = Mutex::new(vec![None; total]);
    let fatal: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(spec) = plan.channels.get(idx) else {
                        break;
                    };
                    match run_one(spec, plan, services) {
                        Ok(outcome) => {
                            let mut slots = slots.lock().unwrap_or_else(|p| p.into_inner());
                            slots[idx] = Some(outcome);
                        }
                        Err(err) => {
                            stop.store(true, Ordering::SeqCst);
                            let mut fatal = fatal.lock().unwrap_or_else(|p| p.into_inner());
                            fatal.get_or_insert(err);
                            break;
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = fatal.into_inner().unwrap_or_else(|p| p.into_inner()) {
        return Err(err);
    }
    Ok(slots
        .into_inner()
        .unwrap_or_else(|p| p.into_inner())
        .into_iter()
        .flatten()
        .collect())
}

/// One pass over every configured channel. Channel-level failures are
/// recorded in the report; configuration and authentication failures abort.
pub fn run_channels(plan: &RunPlan<'_>, services: &Services<'_>) -> Result<RunReport> {
    let workers = plan.workers.clamp(1, plan.channels.len().max(1));
    info!(
        channels = plan.channels.len(),
        workers,
        window = %plan.window.label(),
        dry_run = plan.dry_run,
        "starting digest run"
    );

    let outcomes = if workers == 1 {
        plan.channels
            .iter()
            .map(|spec| run_one(spec, plan, services))
            .collect::<Result<Vec<_>>>()?
    } else {
        run_parallel(plan, services, workers)?
    };

    Ok(RunReport {
        window: plan.window,
        dry_run: plan.dry_run,
        outcomes,
    })
}
