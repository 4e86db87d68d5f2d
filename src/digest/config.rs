use crate::digest::history::MAX_WINDOW_DAYS;
use crate::digest::normalize::DisplayZone;
use crate::error::DigestError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

include!(concat!(env!("OUT_DIR"), "/digest_env_allowlist.rs"));

pub const DEFAULT_SLACK_BASE_URL: &str = "https://slack.com/api";
const MAX_WORKERS: usize = 16;
const MAX_PAGE_SIZE: u32 = 999;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ChannelEntry")]
pub struct ChannelSpec {
    pub id: String,
    pub name: Option<String>,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ChannelEntry {
    Id(String),
    Named {
        id: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl From<ChannelEntry> for ChannelSpec {
    fn from(entry: ChannelEntry) -> Self {
        match entry {
            ChannelEntry::Id(id) => ChannelSpec {
                id: id.trim().to_string(),
                name: None,
            },
            ChannelEntry::Named { id, name } => ChannelSpec {
                id: id.trim().to_string(),
                name: name
                    .map(|n| n.trim().trim_start_matches('#').to_string())
                    .filter(|n| !n.is_empty()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub channels: Vec<ChannelSpec>,
    pub base_url: String,
    pub page_size: u32,
    pub max_retries: usize,
    pub transport_retries: usize,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            base_url: DEFAULT_SLACK_BASE_URL.to_string(),
            page_size: 200,
            max_retries: 5,
            transport_retries: 3,
            retry_base_delay_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub window_days: u64,
    pub timezone: String,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            timezone: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub request_timeout_secs: u64,
    pub transport_retries: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            base_url: None,
            max_tokens: 4000,
            temperature: 0.7,
            request_timeout_secs: 120,
            transport_retries: 2,
            retry_base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub cache_file: PathBuf,
    pub logs_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("summaries"),
            cache_file: PathBuf::from("cache/name_cache.json"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DigestConfig {
    pub slack: SlackConfig,
    pub summary: SummaryConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDigestConfig {
    slack: Option<SlackConfig>,
    summary: Option<SummaryConfig>,
    llm: Option<LlmConfig>,
    output: Option<OutputConfig>,
    run: Option<RunConfig>,
}

/// Command-line values that win over both the file and the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub channels: Vec<String>,
    pub window_days: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub workers: Option<usize>,
}

pub(crate) fn env_non_empty(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn env_number<T: FromStr>(var: &str, fallback: T) -> Result<T> {
    parse_env_number(var, env::var(var).ok().as_deref(), fallback)
}

fn parse_env_number<T: FromStr>(var: &str, raw: Option<&str>, fallback: T) -> Result<T> {
    match raw.map(str::trim) {
        None | Some("") => Ok(fallback),
        Some(v) => v
            .parse::<T>()
            .map_err(|_| config_error(format!("invalid {var} `{v}`: expected a non-negative integer"))),
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    env_non_empty(var).unwrap_or_else(|| fallback.to_string())
}

fn env_or_path(var: &str, fallback: &Path) -> PathBuf {
    env_non_empty(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| fallback.to_path_buf())
}

fn env_csv(var: &str) -> Option<Vec<String>> {
    let raw = env::var(var).ok()?;
    let out = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    if out.is_empty() { None } else { Some(out) }
}

pub(crate) fn config_error(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(DigestError::Config(msg.into()))
}

fn validate(cfg: &DigestConfig) -> Result<()> {
    if cfg.slack.channels.is_empty() {
        return Err(config_error(
            "no channels configured: set [slack].channels, DIGEST_CHANNELS, or --channel",
        ));
    }
    for channel in &cfg.slack.channels {
        if channel.id.is_empty() || channel.id.chars().any(char::is_whitespace) {
            return Err(config_error(format!(
                "invalid channel id `{}`",
                channel.id
            )));
        }
    }
    if !cfg.slack.base_url.starts_with("http://") && !cfg.slack.base_url.starts_with("https://") {
        return Err(config_error("slack base url must start with http:// or https://"));
    }
    if cfg.slack.page_size == 0 || cfg.slack.page_size > MAX_PAGE_SIZE {
        return Err(config_error(format!(
            "invalid slack page size: require 1..={MAX_PAGE_SIZE}"
        )));
    }
    if cfg.slack.request_timeout_secs == 0 {
        return Err(config_error("invalid slack request timeout: must be >= 1 second"));
    }
    if cfg.summary.window_days == 0 || cfg.summary.window_days > MAX_WINDOW_DAYS {
        return Err(config_error(format!(
            "invalid summary window: require 1..={MAX_WINDOW_DAYS} days"
        )));
    }
    if DisplayZone::parse(&cfg.summary.timezone).is_none() {
        return Err(config_error(format!(
            "unknown timezone `{}`: use `local`, `UTC`, or an IANA name",
            cfg.summary.timezone
        )));
    }
    if cfg.llm.max_tokens == 0 {
        return Err(config_error("invalid llm max_tokens: must be >= 1"));
    }
    if !(0.0..=2.0).contains(&cfg.llm.temperature) {
        return Err(config_error("invalid llm temperature: require 0.0 <= t <= 2.0"));
    }
    if cfg.llm.request_timeout_secs == 0 {
        return Err(config_error("invalid llm request timeout: must be >= 1 second"));
    }
    if cfg.run.workers == 0 || cfg.run.workers > MAX_WORKERS {
        return Err(config_error(format!(
            "invalid worker count: require 1..={MAX_WORKERS}"
        )));
    }
    Ok(())
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(custom) = env_non_empty("DIGEST_CONFIG_PATH") {
        return Some(PathBuf::from(custom));
    }

    let local = PathBuf::from("config").join("digest.toml");
    if local.exists() {
        return Some(local);
    }
    let home = dirs::home_dir()?;
    Some(home.join(".slack-digest").join("config.toml"))
}

fn merge_file_config(base: &mut DigestConfig, explicit: Option<&Path>) -> Result<()> {
    let Some(path) = resolve_config_path(explicit) else {
        return Ok(());
    };
    if !path.exists() {
        if explicit.is_some() {
            return Err(config_error(format!(
                "config file not found at {}",
                path.display()
            )));
        }
        return Ok(());
    }

    let raw = fs::read_to_string(&path)
        .map_err(|err| config_error(format!("failed to read {}: {err}", path.display())))?;
    let parsed: PartialDigestConfig = toml::from_str(&raw)
        .map_err(|err| config_error(format!("failed to parse {}: {err}", path.display())))?;
    if let Some(slack) = parsed.slack {
        base.slack = slack;
    }
    if let Some(summary) = parsed.summary {
        base.summary = summary;
    }
    if let Some(llm) = parsed.llm {
        base.llm = llm;
    }
    if let Some(output) = parsed.output {
        base.output = output;
    }
    if let Some(run) = parsed.run {
        base.run = run;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut DigestConfig) -> Result<()> {
    if let Some(ids) = env_csv("DIGEST_CHANNELS") {
        cfg.slack.channels = ids.into_iter().map(ChannelSpec::new).collect();
    }
    cfg.slack.base_url = env_or_string("DIGEST_SLACK_BASE_URL", &cfg.slack.base_url);
    cfg.slack.page_size = env_number("DIGEST_PAGE_SIZE", cfg.slack.page_size)?;
    cfg.slack.max_retries = env_number("DIGEST_MAX_RETRIES", cfg.slack.max_retries)?;
    cfg.slack.transport_retries =
        env_number("DIGEST_TRANSPORT_RETRIES", cfg.slack.transport_retries)?;
    cfg.slack.retry_base_delay_ms =
        env_number("DIGEST_RETRY_BASE_DELAY_MS", cfg.slack.retry_base_delay_ms)?;

    cfg.summary.window_days = env_number("DIGEST_WINDOW_DAYS", cfg.summary.window_days)?;
    cfg.summary.timezone = env_or_string("DIGEST_TIMEZONE", &cfg.summary.timezone);

    if let Some(provider) = env_non_empty("DIGEST_LLM_PROVIDER") {
        cfg.llm.provider = Some(provider);
    }
    if let Some(model) = env_non_empty("DIGEST_LLM_MODEL") {
        cfg.llm.model = Some(model);
    }
    if let Some(base_url) = env_non_empty("DIGEST_LLM_BASE_URL") {
        cfg.llm.base_url = Some(base_url);
    }
    cfg.llm.max_tokens = env_number("DIGEST_LLM_MAX_TOKENS", cfg.llm.max_tokens)?;

    cfg.output.dir = env_or_path("DIGEST_OUTPUT_DIR", &cfg.output.dir);
    cfg.output.cache_file = env_or_path("DIGEST_CACHE_FILE", &cfg.output.cache_file);
    cfg.output.logs_dir = env_or_path("DIGEST_LOGS_DIR", &cfg.output.logs_dir);
    cfg.run.workers = env_number("DIGEST_WORKERS", cfg.run.workers)?;
    Ok(())
}

fn apply_overrides(cfg: &mut DigestConfig, overrides: &ConfigOverrides) {
    if !overrides.channels.is_empty() {
        let mut picked = Vec::with_capacity(overrides.channels.len());
        for id in &overrides.channels {
            let known = cfg.slack.channels.iter().find(|c| &c.id == id).cloned();
            picked.push(known.unwrap_or_else(|| ChannelSpec::new(id.trim())));
        }
        cfg.slack.channels = picked;
    }
    if let Some(days) = overrides.window_days {
        cfg.summary.window_days = days;
    }
    if let Some(dir) = &overrides.output_dir {
        cfg.output.dir = dir.clone();
    }
    if let Some(workers) = overrides.workers {
        cfg.run.workers = workers;
    }
}

pub fn load_config(explicit_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<DigestConfig> {
    let mut cfg = DigestConfig::default();
    merge_file_config(&mut cfg, explicit_path)?;
    apply_env_overrides(&mut cfg)?;
    apply_overrides(&mut cfg, overrides);
    validate(&cfg)?;
    Ok(cfg)
}

pub fn slack_token() -> Result<String> {
    env_non_empty("SLACK_TOKEN")
        .ok_or_else(|| config_error("SLACK_TOKEN is required and cannot be empty"))
}

/// `DIGEST_*` variables set in the environment that nothing reads.
pub fn unknown_env_keys() -> Vec<String> {
    let mut out = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("DIGEST_"))
        .filter(|key| !GENERATED_DIGEST_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect::<Vec<_>>();
    out.sort();
    out
}
