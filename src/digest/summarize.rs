use crate::digest::config::{LlmConfig, config_error, env_non_empty};
use crate::digest::history::TimeWindow;
use crate::digest::normalize::{FlatMessage, Position};
use crate::digest::util::truncate_with_ellipsis;
use crate::digest::warn::{self, Warning};
use crate::error::DigestError;
use crate::slack::client::{backoff_delay, is_retryable_transport_error};
use anyhow::Result;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub const SECTION_HEADINGS: [&str; 3] = [
    "## Archived Tasks",
    "## Conversations & Resolutions",
    "## Open Issues",
];
const REPLY_PREFIX: &str = "  ↳ ";
const GAP_MARKER: &str = "[replies unavailable]";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY_CHARS: usize = 300;

pub struct SummaryRequest<'a> {
    pub channel_id: &'a str,
    pub channel_name: &'a str,
    pub window: &'a TimeWindow,
    pub messages: &'a [FlatMessage],
}

pub trait Summarizer: Send + Sync {
    fn summarize(&self, request: &SummaryRequest<'_>) -> Result<String>;

    /// `provider:model`, recorded in the summary header.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Gemini,
    OpenAiCompatible,
}

impl LlmProvider {
    pub fn label(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Gemini => "gemini",
            LlmProvider::OpenAiCompatible => "openai-compatible",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o",
            LlmProvider::Anthropic => "claude-3-5-haiku-latest",
            LlmProvider::Gemini => "gemini-2.5-flash",
            LlmProvider::OpenAiCompatible => "deepseek-chat",
        }
    }

    fn default_base_url(self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenAi => Some("https://api.openai.com"),
            LlmProvider::Anthropic => Some("https://api.anthropic.com"),
            LlmProvider::Gemini => Some("https://generativelanguage.googleapis.com"),
            LlmProvider::OpenAiCompatible => None,
        }
    }

    fn key_vars(self) -> &'static [&'static str] {
        match self {
            LlmProvider::OpenAi => &["OPENAI_API_KEY", "AI_API_KEY"],
            LlmProvider::Anthropic => &["ANTHROPIC_API_KEY", "AI_API_KEY"],
            LlmProvider::Gemini => &["GEMINI_API_KEY", "AI_API_KEY"],
            LlmProvider::OpenAiCompatible => &["AI_API_KEY", "DEEPSEEK_API_KEY", "OPENAI_API_KEY"],
        }
    }
}

fn parse_provider_alias(raw: &str) -> Option<LlmProvider> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "openai" => Some(LlmProvider::OpenAi),
        "anthropic" | "claude" => Some(LlmProvider::Anthropic),
        "gemini" | "google" => Some(LlmProvider::Gemini),
        "openai-compatible" | "compatible" | "deepseek" => Some(LlmProvider::OpenAiCompatible),
        _ => None,
    }
}

fn parse_prefixed_model(raw: &str) -> (Option<LlmProvider>, String) {
    let trimmed = raw.trim();
    if let Some((prefix, model)) = trimmed.split_once(':')
        && let Some(provider) = parse_provider_alias(prefix)
    {
        return (Some(provider), model.trim().to_string());
    }
    (None, trimmed.to_string())
}

fn infer_provider_from_model(model: &str) -> Option<LlmProvider> {
    let lower = model.trim().to_ascii_lowercase();
    if lower.starts_with("deepseek-") {
        return Some(LlmProvider::OpenAiCompatible);
    }
    if lower.starts_with("claude-") {
        return Some(LlmProvider::Anthropic);
    }
    if lower.starts_with("gemini-") {
        return Some(LlmProvider::Gemini);
    }
    if lower.starts_with("gpt-")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("o4")
    {
        return Some(LlmProvider::OpenAi);
    }
    None
}

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn first_available_provider(env: EnvLookup<'_>) -> Option<LlmProvider> {
    if env("AI_BASE_URL").is_some() && env("AI_API_KEY").is_some() {
        return Some(LlmProvider::OpenAiCompatible);
    }
    if env("OPENAI_API_KEY").is_some() {
        return Some(LlmProvider::OpenAi);
    }
    if env("ANTHROPIC_API_KEY").is_some() {
        return Some(LlmProvider::Anthropic);
    }
    if env("GEMINI_API_KEY").is_some() {
        return Some(LlmProvider::Gemini);
    }
    None
}

fn resolve_api_key(provider: LlmProvider, env: EnvLookup<'_>) -> Option<String> {
    provider.key_vars().iter().find_map(|var| env(var))
}

/// Fully resolved endpoint for one language-model provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
}

impl ModelTarget {
    pub fn describe(&self) -> String {
        format!("{}:{}", self.provider.label(), self.model)
    }
}

pub fn resolve_model_target(cfg: &LlmConfig) -> Result<ModelTarget> {
    resolve_model_target_with(cfg, &env_non_empty)
}

fn resolve_model_target_with(cfg: &LlmConfig, env: EnvLookup<'_>) -> Result<ModelTarget> {
    let explicit = match cfg.provider.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(raw) => Some(parse_provider_alias(raw).ok_or_else(|| {
            config_error(format!(
                "unknown llm provider `{raw}`: use openai, anthropic, gemini, or openai-compatible"
            ))
        })?),
        None => None,
    };
    let (prefixed, mut model) = cfg
        .model
        .as_deref()
        .map(parse_prefixed_model)
        .unwrap_or((None, String::new()));

    let provider = explicit
        .or(prefixed)
        .or_else(|| infer_provider_from_model(&model))
        .or_else(|| first_available_provider(env))
        .ok_or_else(|| {
            config_error(
                "no language model configured: set OPENAI_API_KEY, ANTHROPIC_API_KEY, \
                 GEMINI_API_KEY, or AI_API_KEY",
            )
        })?;
    if model.is_empty() {
        model = provider.default_model().to_string();
    }

    let base_url = cfg
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| match provider {
            LlmProvider::OpenAiCompatible => env("AI_BASE_URL").or_else(|| {
                model
                    .to_ascii_lowercase()
                    .starts_with("deepseek-")
                    .then(|| "https://api.deepseek.com".to_string())
            }),
            _ => provider.default_base_url().map(ToOwned::to_owned),
        })
        .ok_or_else(|| {
            config_error("openai-compatible provider requires llm.base_url or AI_BASE_URL")
        })?;

    let api_key = resolve_api_key(provider, env).ok_or_else(|| {
        config_error(format!(
            "missing API key for {}: set {}",
            provider.label(),
            provider.key_vars().join(" or ")
        ))
    })?;

    Ok(ModelTarget {
        provider,
        model,
        api_key,
        base_url,
    })
}

/// One line per message, replies indented under their parent.
pub fn render_transcript(messages: &[FlatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        let indent = match msg.position {
            Position::TopLevel => "",
            Position::Reply { .. } => REPLY_PREFIX,
        };
        let text = msg.text.trim().replace('\n', "\n    ");
        out.push_str(&format!(
            "{indent}{} ({}): {}\n",
            msg.author, msg.timestamp, text
        ));
        if msg.replies_missing {
            out.push_str(&format!("{REPLY_PREFIX}{GAP_MARKER}\n"));
        }
    }
    out
}

pub fn build_prompt(request: &SummaryRequest<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are a Slack channel summarizer. Analyze the conversation log from #{} ({}) \
         below and write a Markdown summary with exactly these three sections, in this order:\n\n",
        request.channel_name,
        request.window.label()
    ));
    prompt.push_str(&format!(
        "{}\nTasks that were completed or closed during the period.\n\n",
        SECTION_HEADINGS[0]
    ));
    prompt.push_str(&format!(
        "{}\nImportant discussions and the decisions or resolutions reached.\n\n",
        SECTION_HEADINGS[1]
    ));
    prompt.push_str(&format!(
        "{}\nQuestions, problems, or follow-ups that still need attention.\n\n",
        SECTION_HEADINGS[2]
    ));
    prompt.push_str("Rules:\n");
    prompt.push_str(
        "- Always include all three headings. Write \"- None\" under a section with nothing to report.\n",
    );
    prompt.push_str("- Use bullet points and name the users involved in every item.\n");
    prompt.push_str("- Include timestamps for important events.\n");
    prompt.push_str(&format!(
        "- Lines starting with \"{}\" are thread replies to the message above them; \
         \"{GAP_MARKER}\" means a thread could not be loaded.\n",
        REPLY_PREFIX.trim()
    ));
    prompt.push_str("- Report only what the log supports.\n\n");
    prompt.push_str("Conversation log:\n\n");
    prompt.push_str(&render_transcript(request.messages));
    prompt
}

fn collect_text_parts(parts: &[Value]) -> Option<String> {
    let chunks = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>();
    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n"))
    }
}

fn extract_chat_text(json: &Value) -> Option<String> {
    let first = json.get("choices").and_then(Value::as_array)?.first()?;
    match first.get("message")?.get("content")? {
        Value::String(s) => Some(s.to_string()),
        Value::Array(parts) => collect_text_parts(parts),
        _ => None,
    }
}

fn extract_anthropic_text(json: &Value) -> Option<String> {
    collect_text_parts(json.get("content").and_then(Value::as_array)?)
}

fn extract_gemini_text(json: &Value) -> Option<String> {
    let parts = json
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("content"))
        .and_then(|v| v.get("parts"))
        .and_then(Value::as_array)?;
    collect_text_parts(parts)
}

fn summarization_error(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(DigestError::Summarization(msg.into()))
}

pub struct RemoteSummarizer {
    http: Client,
    target: ModelTarget,
    max_tokens: u32,
    temperature: f64,
    transport_retries: usize,
    retry_base_delay_ms: u64,
}

impl RemoteSummarizer {
    pub fn new(target: ModelTarget, cfg: &LlmConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            target,
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            transport_retries: cfg.transport_retries,
            retry_base_delay_ms: cfg.retry_base_delay_ms,
        })
    }

    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        Self::new(resolve_model_target(cfg)?, cfg)
    }

    fn request(&self, prompt: &str) -> RequestBuilder {
        let base = self.target.base_url.trim_end_matches('/');
        match self.target.provider {
            LlmProvider::OpenAi | LlmProvider::OpenAiCompatible => self
                .http
                .post(format!("{base}/v1/chat/completions"))
                .bearer_auth(&self.target.api_key)
                .json(&json!({
                    "model": self.target.model,
                    "messages": [{"role": "user", "content": prompt}],
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature
                })),
            LlmProvider::Anthropic => self
                .http
                .post(format!("{base}/v1/messages"))
                .header("x-api-key", &self.target.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": self.target.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "messages": [{"role": "user", "content": prompt}]
                })),
            LlmProvider::Gemini => self
                .http
                .post(format!(
                    "{base}/v1beta/models/{}:generateContent",
                    self.target.model
                ))
                .header("x-goog-api-key", &self.target.api_key)
                .json(&json!({
                    "contents": [{"parts": [{"text": prompt}]}],
                    "generationConfig": {
                        "maxOutputTokens": self.max_tokens,
                        "temperature": self.temperature
                    }
                })),
        }
    }

    /// Sleeps before the next attempt, or returns false once retries are spent.
    fn backoff(&self, failures: usize, reason: &str) -> bool {
        if failures > self.transport_retries {
            return false;
        }
        let delay = backoff_delay(self.retry_base_delay_ms, failures);
        warn::emit(Warning {
            code: "TRANSPORT_RETRY",
            stage: self.target.provider.label(),
            retry: &format!("{failures}/{}", self.transport_retries),
            reason: &format!("backoff={}ms", delay.as_millis()),
            err: reason,
            ..Warning::default()
        });
        thread::sleep(delay);
        true
    }

    fn send(&self, prompt: &str) -> Result<Value> {
        let label = self.target.provider.label();
        let mut failures = 0usize;
        loop {
            let response = match self.request(prompt).send() {
                Ok(response) => response,
                Err(err) if is_retryable_transport_error(&err) => {
                    failures += 1;
                    if self.backoff(failures, &err.to_string()) {
                        continue;
                    }
                    return Err(summarization_error(format!(
                        "{label} request failed after {failures} attempts: {err}"
                    )));
                }
                Err(err) => {
                    return Err(summarization_error(format!("{label} request failed: {err}")));
                }
            };
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(anyhow::Error::new(DigestError::Auth {
                    service: label,
                    reason: format!("credentials rejected with status {status}"),
                }));
            }
            let body = response
                .text()
                .map_err(|err| summarization_error(format!("{label} response unreadable: {err}")))?;
            if !status.is_success() {
                let transient =
                    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                if transient {
                    failures += 1;
                    if self.backoff(failures, &format!("http {}", status.as_u16())) {
                        continue;
                    }
                }
                return Err(summarization_error(format!(
                    "{label} call failed with status {status}: {}",
                    truncate_with_ellipsis(body.trim(), MAX_ERROR_BODY_CHARS)
                )));
            }
            return serde_json::from_str(&body)
                .map_err(|err| summarization_error(format!("{label} returned invalid JSON: {err}")));
        }
    }
}

impl Summarizer for RemoteSummarizer {
    fn summarize(&self, request: &SummaryRequest<'_>) -> Result<String> {
        let prompt = build_prompt(request);
        info!(
            channel = request.channel_id,
            messages = request.messages.len(),
            model = %self.describe(),
            "requesting summary"
        );
        debug!(prompt_chars = prompt.chars().count(), "prompt built");

        let json = self.send(&prompt)?;
        let text = match self.target.provider {
            LlmProvider::OpenAi | LlmProvider::OpenAiCompatible => extract_chat_text(&json),
            LlmProvider::Anthropic => extract_anthropic_text(&json),
            LlmProvider::Gemini => extract_gemini_text(&json),
        };
        let text = text.map(|t| t.trim().to_string()).unwrap_or_default();
        if text.is_empty() {
            return Err(summarization_error(format!(
                "{} response missing text content",
                self.target.provider.label()
            )));
        }
        Ok(text)
    }

    fn describe(&self) -> String {
        self.target.describe()
    }
}
