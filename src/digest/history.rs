use crate::digest::warn::{self, Warning};
use crate::error::FailureKind;
use crate::slack::types::SlackTs;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_WINDOW_DAYS: u64 = 36_500;

/// Summary window `[since, until]` in UTC; both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl TimeWindow {
    pub fn ending_at(until: DateTime<Utc>, days: u64) -> Self {
        let days = days.min(MAX_WINDOW_DAYS) as i64;
        Self {
            since: until - Duration::days(days),
            until,
        }
    }

    pub fn oldest_ts(&self) -> SlackTs {
        SlackTs::from_datetime(self.since)
    }

    pub fn latest_ts(&self) -> SlackTs {
        SlackTs::from_datetime(self.until)
    }

    pub fn days(&self) -> i64 {
        (self.until - self.since).num_days()
    }

    pub fn label(&self) -> String {
        format!(
            "{} to {}",
            self.since.format("%Y-%m-%d"),
            self.until.format("%Y-%m-%d")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: String,
    pub ts: SlackTs,
    #[serde(default)]
    pub thread_ts: Option<SlackTs>,
    #[serde(default)]
    pub reply_count: Option<u32>,
}

impl RawMessage {
    /// Plain human messages; joins, topic changes and bot posts carry a subtype.
    pub fn is_conversational(&self) -> bool {
        self.kind.as_deref().is_none_or(|k| k == "message") && self.subtype.is_none()
    }

    pub fn is_thread_parent(&self) -> bool {
        self.reply_count.unwrap_or(0) > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadedMessage {
    pub parent: RawMessage,
    pub replies: Vec<RawMessage>,
    pub replies_missing: bool,
}

impl ThreadedMessage {
    pub fn message_count(&self) -> usize {
        1 + self.replies.len()
    }
}

pub fn message_count(threads: &[ThreadedMessage]) -> usize {
    threads.iter().map(ThreadedMessage::message_count).sum()
}

pub fn thread_gap_count(threads: &[ThreadedMessage]) -> usize {
    threads.iter().filter(|t| t.replies_missing).count()
}

pub trait HistorySource {
    fn fetch_history(&self, channel: &str, window: &TimeWindow) -> Result<Vec<ThreadedMessage>>;
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Lazily walks a cursor-paginated endpoint, one request per `next()`.
pub struct Pages<T, F>
where
    F: FnMut(Option<&str>) -> Result<Page<T>>,
{
    fetch: F,
    cursor: Option<String>,
    done: bool,
}

impl<T, F> Pages<T, F>
where
    F: FnMut(Option<&str>) -> Result<Page<T>>,
{
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            cursor: None,
            done: false,
        }
    }
}

impl<T, F> Iterator for Pages<T, F>
where
    F: FnMut(Option<&str>) -> Result<Page<T>>,
{
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match (self.fetch)(self.cursor.as_deref()) {
            Ok(page) => {
                self.cursor = page.next_cursor.filter(|c| !c.trim().is_empty());
                self.done = self.cursor.is_none();
                Some(Ok(page.items))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Collect top-level pages, attach each thread's replies, and order both
/// levels by timestamp. A thread whose replies fail with a non-fatal error
/// keeps its parent and is flagged `replies_missing`.
pub fn collect_threads<P, R>(
    channel: &str,
    pages: P,
    mut fetch_replies: R,
) -> Result<Vec<ThreadedMessage>>
where
    P: IntoIterator<Item = Result<Vec<RawMessage>>>,
    R: FnMut(&RawMessage) -> Result<Vec<RawMessage>>,
{
    let mut parents = Vec::new();
    for page in pages {
        parents.extend(page?.into_iter().filter(RawMessage::is_conversational));
    }
    parents.sort_by(|a, b| a.ts.cmp(&b.ts));
    parents.dedup_by(|a, b| a.ts == b.ts);

    let mut threads = Vec::with_capacity(parents.len());
    for parent in parents {
        if !parent.is_thread_parent() {
            threads.push(ThreadedMessage {
                parent,
                replies: Vec::new(),
                replies_missing: false,
            });
            continue;
        }

        match fetch_replies(&parent) {
            Ok(replies) => {
                let mut replies = replies
                    .into_iter()
                    .filter(|r| r.ts != parent.ts && r.is_conversational())
                    .collect::<Vec<_>>();
                replies.sort_by(|a, b| a.ts.cmp(&b.ts));
                replies.dedup_by(|a, b| a.ts == b.ts);
                threads.push(ThreadedMessage {
                    parent,
                    replies,
                    replies_missing: false,
                });
            }
            Err(err) => {
                let kind = FailureKind::classify(&err);
                if kind.is_fatal() {
                    return Err(err);
                }
                warn::emit(Warning {
                    code: "THREAD_GAP",
                    stage: "replies",
                    channel,
                    reason: kind.as_str(),
                    err: &format!("thread {}: {err:#}", parent.ts),
                    ..Warning::default()
                });
                threads.push(ThreadedMessage {
                    parent,
                    replies: Vec::new(),
                    replies_missing: true,
                });
            }
        }
    }
    Ok(threads)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::RawMessage;

    pub fn msg(user: &str, ts: &str, text: &str) -> RawMessage {
        RawMessage {
            kind: Some("message".to_string()),
            subtype: None,
            user: Some(user.to_string()),
            username: None,
            bot_id: None,
            text: text.to_string(),
            ts: ts.parse().expect("valid ts"),
            thread_ts: None,
            reply_count: None,
        }
    }

    pub fn parent(user: &str, ts: &str, text: &str, replies: u32) -> RawMessage {
        let mut m = msg(user, ts, text);
        m.thread_ts = Some(m.ts.clone());
        m.reply_count = Some(replies);
        m
    }

    pub fn reply(user: &str, ts: &str, thread: &str, text: &str) -> RawMessage {
        let mut m = msg(user, ts, text);
        m.thread_ts = Some(thread.parse().expect("valid thread ts"));
        m
    }
}
