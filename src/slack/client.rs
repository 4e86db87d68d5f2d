use crate::digest::config::SlackConfig;
use crate::digest::history::{
    HistorySource, Page, Pages, RawMessage, ThreadedMessage, TimeWindow, collect_threads,
};
use crate::digest::name_cache::NameLookup;
use crate::digest::util::truncate_with_ellipsis;
use crate::digest::warn::{self, Warning};
use crate::error::DigestError;
use crate::slack::types::{
    AuthTestResponse, ChannelInfoResponse, MessagePage, SlackTs, UserInfoResponse,
};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::thread;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "slack";
const RETRY_ATTEMPT_HEADER: &str = "x-digest-retry-attempt";
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;
const MAX_RETRY_AFTER_SECS: u64 = 300;
const AUTH_ERRORS: [&str; 5] = [
    "invalid_auth",
    "not_authed",
    "token_revoked",
    "token_expired",
    "account_inactive",
];

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_rate_limit_retries: usize,
    pub transport_retries: usize,
    pub base_delay_ms: u64,
}

impl From<&SlackConfig> for RetryPolicy {
    fn from(cfg: &SlackConfig) -> Self {
        Self {
            max_rate_limit_retries: cfg.max_retries,
            transport_retries: cfg.transport_retries,
            base_delay_ms: cfg.retry_base_delay_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub user: String,
    pub team: String,
}

pub struct SlackClient {
    http: Client,
    base_url: String,
    token: String,
    page_size: u32,
    policy: RetryPolicy,
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub(crate) fn backoff_delay(base_delay_ms: u64, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6) as u32;
    let scale = 2_u64.pow(exponent);
    Duration::from_millis(base_delay_ms.max(1).saturating_mul(scale))
}

pub(crate) fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

fn api_error(operation: &str, reason: impl Into<String>) -> DigestError {
    DigestError::Api {
        service: SERVICE,
        operation: operation.to_string(),
        reason: reason.into(),
    }
}

fn transport_error(operation: &str, reason: impl Into<String>) -> DigestError {
    DigestError::Transport {
        service: SERVICE,
        operation: operation.to_string(),
        reason: reason.into(),
    }
}

impl SlackClient {
    pub fn new(cfg: &SlackConfig, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build slack http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            page_size: cfg.page_size,
            policy: RetryPolicy::from(cfg),
        })
    }

    fn wait_rate_limited(&self, operation: &str, attempts: usize, delay_secs: u64) -> Result<()> {
        if attempts > self.policy.max_rate_limit_retries {
            return Err(DigestError::RateLimited {
                service: SERVICE,
                operation: operation.to_string(),
                attempts,
            }
            .into());
        }
        let delay_secs = delay_secs.min(MAX_RETRY_AFTER_SECS);
        warn::emit(Warning {
            code: "RATE_LIMITED",
            stage: operation,
            retry: &format!("{attempts}/{}", self.policy.max_rate_limit_retries),
            reason: &format!("retry_after={delay_secs}s"),
            ..Warning::default()
        });
        thread::sleep(Duration::from_secs(delay_secs));
        Ok(())
    }

    fn wait_transport(&self, operation: &str, failures: usize, reason: &str) -> Result<()> {
        if failures > self.policy.transport_retries {
            return Err(transport_error(operation, reason).into());
        }
        let delay = backoff_delay(self.policy.base_delay_ms, failures);
        warn::emit(Warning {
            code: "TRANSPORT_RETRY",
            stage: operation,
            retry: &format!("{failures}/{}", self.policy.transport_retries),
            reason: &format!("backoff={}ms", delay.as_millis()),
            err: reason,
            ..Warning::default()
        });
        thread::sleep(delay);
        Ok(())
    }

    /// Call a Web API method, retrying rate limits and transient failures.
    fn call<T: DeserializeOwned>(&self, operation: &str, params: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, operation);
        let mut attempt = 0usize;
        let mut rate_limited = 0usize;
        let mut transport_failures = 0usize;

        loop {
            debug!(operation, attempt, "slack request");
            let sent = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .header(RETRY_ATTEMPT_HEADER, attempt.to_string())
                .query(params)
                .send();
            attempt += 1;

            let response = match sent {
                Ok(response) => response,
                Err(err) if is_retryable_transport_error(&err) => {
                    transport_failures += 1;
                    self.wait_transport(operation, transport_failures, &err.to_string())?;
                    continue;
                }
                Err(err) => return Err(transport_error(operation, err.to_string()).into()),
            };

            let status = response.status();
            let retry_after = parse_retry_after(response.headers());
            if status == StatusCode::TOO_MANY_REQUESTS {
                rate_limited += 1;
                self.wait_rate_limited(
                    operation,
                    rate_limited,
                    retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
                )?;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(DigestError::Auth {
                    service: SERVICE,
                    reason: format!("{operation} returned http {}", status.as_u16()),
                }
                .into());
            }
            if status.is_server_error() {
                transport_failures += 1;
                self.wait_transport(
                    operation,
                    transport_failures,
                    &format!("http {}", status.as_u16()),
                )?;
                continue;
            }
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(api_error(
                    operation,
                    format!(
                        "http {}: {}",
                        status.as_u16(),
                        truncate_with_ellipsis(&body, 400)
                    ),
                )
                .into());
            }

            let body: Value = match response.json() {
                Ok(body) => body,
                Err(err) if err.is_decode() => {
                    return Err(api_error(operation, format!("invalid json: {err}")).into());
                }
                Err(err) => {
                    transport_failures += 1;
                    self.wait_transport(operation, transport_failures, &err.to_string())?;
                    continue;
                }
            };

            if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                let code = body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown_error")
                    .to_string();
                if code == "ratelimited" {
                    rate_limited += 1;
                    self.wait_rate_limited(
                        operation,
                        rate_limited,
                        retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
                    )?;
                    continue;
                }
                if AUTH_ERRORS.contains(&code.as_str()) {
                    return Err(DigestError::Auth {
                        service: SERVICE,
                        reason: code,
                    }
                    .into());
                }
                return Err(api_error(operation, code).into());
            }

            return serde_json::from_value::<T>(body)
                .map_err(|err| api_error(operation, format!("unexpected response shape: {err}")))
                .map_err(anyhow::Error::new);
        }
    }

    pub fn auth_test(&self) -> Result<AuthIdentity> {
        let resp: AuthTestResponse = self.call("auth.test", &[])?;
        Ok(AuthIdentity {
            user: resp
                .user
                .or(resp.user_id)
                .unwrap_or_else(|| "unknown".to_string()),
            team: resp.team.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn message_page(
        &self,
        operation: &str,
        mut params: Vec<(&'static str, String)>,
        cursor: Option<&str>,
    ) -> Result<Page<RawMessage>> {
        params.push(("limit", self.page_size.to_string()));
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let page: MessagePage<RawMessage> = self.call(operation, &params)?;
        let next_cursor = page.next_cursor();
        Ok(Page {
            items: page.messages,
            next_cursor,
        })
    }

    /// Top-level messages in the window, one `conversations.history` call per item.
    pub fn history_pages(
        &self,
        channel: &str,
        window: &TimeWindow,
    ) -> impl Iterator<Item = Result<Vec<RawMessage>>> {
        let base = vec![
            ("channel", channel.to_string()),
            ("oldest", window.oldest_ts().to_string()),
            ("latest", window.latest_ts().to_string()),
            ("inclusive", "true".to_string()),
        ];
        Pages::new(move |cursor: Option<&str>| {
            self.message_page("conversations.history", base.clone(), cursor)
        })
    }

    /// Replies of one thread; Slack echoes the parent as the first message.
    pub fn reply_pages(
        &self,
        channel: &str,
        thread_ts: &SlackTs,
        window: &TimeWindow,
    ) -> impl Iterator<Item = Result<Vec<RawMessage>>> {
        let base = vec![
            ("channel", channel.to_string()),
            ("ts", thread_ts.to_string()),
            ("oldest", window.oldest_ts().to_string()),
            ("latest", window.latest_ts().to_string()),
            ("inclusive", "true".to_string()),
        ];
        Pages::new(move |cursor: Option<&str>| {
            self.message_page("conversations.replies", base.clone(), cursor)
        })
    }

    pub fn fetch_replies(
        &self,
        channel: &str,
        thread_ts: &SlackTs,
        window: &TimeWindow,
    ) -> Result<Vec<RawMessage>> {
        let mut out = Vec::new();
        for page in self.reply_pages(channel, thread_ts, window) {
            out.extend(page?);
        }
        Ok(out)
    }
}

impl HistorySource for SlackClient {
    fn fetch_history(&self, channel: &str, window: &TimeWindow) -> Result<Vec<ThreadedMessage>> {
        collect_threads(channel, self.history_pages(channel, window), |parent| {
            self.fetch_replies(channel, &parent.ts, window)
        })
    }
}

impl NameLookup for SlackClient {
    fn lookup_user(&self, id: &str) -> Result<String> {
        let resp: UserInfoResponse = self.call("users.info", &[("user", id.to_string())])?;
        Ok(resp.user.display_name())
    }

    fn lookup_channel(&self, id: &str) -> Result<String> {
        let resp: ChannelInfoResponse =
            self.call("conversations.info", &[("channel", id.to_string())])?;
        Ok(resp
            .channel
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(resp.channel.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use chrono::{TimeZone, Utc};
    use httpmock::prelude::*;
    use serde_json::json;

    fn test_client(base_url: &str) -> SlackClient {
        let cfg = SlackConfig {
            base_url: base_url.to_string(),
            max_retries: 3,
            transport_retries: 1,
            retry_base_delay_ms: 1,
            request_timeout_secs: 5,
            ..SlackConfig::default()
        };
        SlackClient::new(&cfg, "xoxp-test").expect("client")
    }

    fn window() -> TimeWindow {
        let until = Utc
            .with_ymd_and_hms(2024, 3, 15, 0, 0, 0)
            .single()
            .expect("time");
        TimeWindow::ending_at(until, 14)
    }

    #[test]
    fn history_retries_rate_limits_then_returns_all_messages() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/conversations.history")
                .header(RETRY_ATTEMPT_HEADER, "0");
            then.status(429).header("retry-after", "0").body("slow down");
        });
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/conversations.history")
                .header(RETRY_ATTEMPT_HEADER, "1");
            then.status(200)
                .header("retry-after", "0")
                .json_body(json!({"ok": false, "error": "ratelimited"}));
        });
        let third = server.mock(|when, then| {
            when.method(GET)
                .path("/conversations.history")
                .header(RETRY_ATTEMPT_HEADER, "2")
                .query_param("channel", "C1");
            then.status(200).json_body(json!({
                "ok": true,
                "messages": [
                    {"type": "message", "user": "U2", "text": "b", "ts": "1710000200.000000"},
                    {"type": "message", "user": "U1", "text": "a", "ts": "1710000100.000000"}
                ],
                "has_more": false
            }));
        });

        let client = test_client(&server.base_url());
        let threads = client.fetch_history("C1", &window()).expect("history");

        assert_eq!(first.hits(), 1);
        assert_eq!(second.hits(), 1);
        assert_eq!(third.hits(), 1);
        let texts: Vec<&str> = threads.iter().map(|t| t.parent.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn rate_limit_beyond_bound_surfaces_failure() {
        let server = MockServer::start();
        let limited = server.mock(|when, then| {
            when.method(GET).path("/conversations.history");
            then.status(429).header("retry-after", "0");
        });

        let client = test_client(&server.base_url());
        let err = client
            .fetch_history("C1", &window())
            .expect_err("should give up");
        assert_eq!(FailureKind::classify(&err), FailureKind::RateLimit);
        // initial attempt plus three retries
        assert_eq!(limited.hits(), 4);
    }

    #[test]
    fn thread_replies_are_fetched_for_parents_only() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/conversations.history");
            then.status(200).json_body(json!({
                "ok": true,
                "messages": [
                    {"type": "message", "user": "U1", "text": "plain", "ts": "1710000300.000000"},
                    {"type": "message", "user": "U1", "text": "question", "ts": "1710000100.000000",
                     "thread_ts": "1710000100.000000", "reply_count": 2}
                ],
                "has_more": false
            }));
        });
        let replies = server.mock(|when, then| {
            when.method(GET)
                .path("/conversations.replies")
                .query_param("ts", "1710000100.000000");
            then.status(200).json_body(json!({
                "ok": true,
                "messages": [
                    {"type": "message", "user": "U1", "text": "question", "ts": "1710000100.000000",
                     "thread_ts": "1710000100.000000", "reply_count": 2},
                    {"type": "message", "user": "U2", "text": "answer", "ts": "1710000150.000000",
                     "thread_ts": "1710000100.000000"},
                    {"type": "message", "user": "U1", "text": "thanks", "ts": "1710000160.000000",
                     "thread_ts": "1710000100.000000"}
                ],
                "has_more": false
            }));
        });

        let client = test_client(&server.base_url());
        let threads = client.fetch_history("C1", &window()).expect("history");

        assert_eq!(replies.hits(), 1);
        assert_eq!(threads.len(), 2);
        let texts: Vec<&str> = threads[0].replies.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["answer", "thanks"]);
        assert!(threads[1].replies.is_empty());
    }

    #[test]
    fn invalid_auth_is_an_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/auth.test");
            then.status(200)
                .json_body(json!({"ok": false, "error": "invalid_auth"}));
        });

        let client = test_client(&server.base_url());
        let err = client.auth_test().expect_err("should reject");
        assert_eq!(FailureKind::classify(&err), FailureKind::Auth);
    }

    #[test]
    fn channel_not_found_is_an_api_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/conversations.history");
            then.status(200)
                .json_body(json!({"ok": false, "error": "channel_not_found"}));
        });

        let client = test_client(&server.base_url());
        let err = client
            .fetch_history("CXX", &window())
            .expect_err("missing channel");
        assert_eq!(FailureKind::classify(&err), FailureKind::Api);
        assert!(format!("{err:#}").contains("channel_not_found"));
    }

    #[test]
    fn server_errors_are_retried_as_transport_failures() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method(GET).path("/users.info");
            then.status(503);
        });

        let client = test_client(&server.base_url());
        let err = client.lookup_user("U1").expect_err("should fail");
        assert_eq!(FailureKind::classify(&err), FailureKind::Transport);
        assert_eq!(failing.hits(), 2);
    }

    #[test]
    fn user_and_channel_lookups_read_names() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/users.info").query_param("user", "U1");
            then.status(200).json_body(json!({
                "ok": true,
                "user": {"id": "U1", "name": "ada", "profile": {"display_name": "Ada L"}}
            }));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/conversations.info")
                .query_param("channel", "C1");
            then.status(200).json_body(json!({
                "ok": true,
                "channel": {"id": "C1", "name": "eng-ops"}
            }));
        });

        let client = test_client(&server.base_url());
        assert_eq!(client.lookup_user("U1").expect("user"), "Ada L");
        assert_eq!(client.lookup_channel("C1").expect("channel"), "eng-ops");
    }
}
