use crate::digest::history::{RawMessage, ThreadedMessage};
use crate::digest::name_cache::{NameCache, NameLookup};
use crate::slack::types::SlackTs;
use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use serde::Serialize;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Zone that rendered timestamps are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayZone {
    Local,
    Named(Tz),
}

impl DisplayZone {
    /// Accepts `local` or any IANA zone name (`UTC`, `Europe/Berlin`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("local") {
            return Some(Self::Local);
        }
        raw.parse::<Tz>().ok().map(Self::Named)
    }

    pub fn format(&self, ts: &SlackTs) -> String {
        let Some(at) = DateTime::<Utc>::from_timestamp(ts.secs(), ts.micros() * 1_000) else {
            return ts.as_str().to_string();
        };
        self.format_datetime(at, TIMESTAMP_FORMAT)
    }

    pub fn format_datetime(&self, at: DateTime<Utc>, fmt: &str) -> String {
        match self {
            Self::Local => at.with_timezone(&Local).format(fmt).to_string(),
            Self::Named(tz) => at.with_timezone(tz).format(fmt).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "position", rename_all = "snake_case")]
pub enum Position {
    TopLevel,
    Reply { parent_ts: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatMessage {
    pub author: String,
    pub timestamp: String,
    pub text: String,
    #[serde(flatten)]
    pub position: Position,
    /// Set on a thread parent whose replies could not be fetched.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replies_missing: bool,
}

/// Turns threaded history into the transcript order: each parent followed
/// immediately by its replies, with ids rewritten to display names.
pub struct Normalizer<'a> {
    names: &'a NameCache,
    lookup: &'a dyn NameLookup,
    zone: DisplayZone,
}

impl<'a> Normalizer<'a> {
    pub fn new(names: &'a NameCache, lookup: &'a dyn NameLookup, zone: DisplayZone) -> Self {
        Self {
            names,
            lookup,
            zone,
        }
    }

    pub fn flatten(&self, threads: &[ThreadedMessage]) -> Vec<FlatMessage> {
        let total = threads.iter().map(ThreadedMessage::message_count).sum();
        let mut out = Vec::with_capacity(total);
        for thread in threads {
            let mut top = self.render(&thread.parent, Position::TopLevel);
            top.replies_missing = thread.replies_missing;
            out.push(top);
            for reply in &thread.replies {
                out.push(self.render(
                    reply,
                    Position::Reply {
                        parent_ts: thread.parent.ts.to_string(),
                    },
                ));
            }
        }
        out
    }

    fn render(&self, msg: &RawMessage, position: Position) -> FlatMessage {
        FlatMessage {
            author: self.author(msg),
            timestamp: self.zone.format(&msg.ts),
            text: self.expand_mentions(&msg.text),
            position,
            replies_missing: false,
        }
    }

    fn author(&self, msg: &RawMessage) -> String {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
        };
        if let Some(user) = non_empty(&msg.user) {
            return self.names.resolve_user(&user, self.lookup);
        }
        if let Some(username) = non_empty(&msg.username) {
            return username;
        }
        if let Some(bot) = non_empty(&msg.bot_id) {
            return format!("bot:{bot}");
        }
        "unknown".to_string()
    }

    /// Rewrites `<@U..>` and `<#C..>` references. Links and other `<..>`
    /// tokens pass through untouched.
    fn expand_mentions(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find('<') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('>') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let token = &after[..end];
            out.push_str(&self.expand_token(token));
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn expand_token(&self, token: &str) -> String {
        let (target, label) = match token.split_once('|') {
            Some((target, label)) => (target, Some(label).filter(|l| !l.is_empty())),
            None => (token, None),
        };
        if let Some(id) = target.strip_prefix('@') {
            let name = match label {
                Some(label) => label.trim_start_matches('@').to_string(),
                None => self.names.resolve_user(id, self.lookup),
            };
            return format!("@{name}");
        }
        if let Some(id) = target.strip_prefix('#') {
            let name = match label {
                Some(label) => label.trim_start_matches('#').to_string(),
                None => self.names.resolve_channel(id, self.lookup),
            };
            return format!("#{name}");
        }
        if let Some(special) = target.strip_prefix('!') {
            let word = special.split('^').next().unwrap_or(special);
            let name = label.map_or(word, |l| l.trim_start_matches('@'));
            return format!("@{name}");
        }
        format!("<{token}>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::history::fixtures::{msg, parent, reply};
    use crate::digest::name_cache::fakes::FakeDirectory;
    use tempfile::tempdir;

    fn sample_threads() -> Vec<ThreadedMessage> {
        vec![
            ThreadedMessage {
                parent: msg("U1", "1700000000.000100", "morning"),
                replies: Vec::new(),
                replies_missing: false,
            },
            ThreadedMessage {
                parent: parent("U2", "1700000100.000000", "deploy failed <@U1>", 2),
                replies: vec![
                    reply("U1", "1700000160.000000", "1700000100.000000", "looking"),
                    reply("U2", "1700000220.000000", "1700000100.000000", "fixed"),
                ],
                replies_missing: false,
            },
            ThreadedMessage {
                parent: parent("U1", "1700000300.000000", "who owns billing?", 4),
                replies: Vec::new(),
                replies_missing: true,
            },
        ]
    }

    fn directory() -> FakeDirectory {
        FakeDirectory::with_users(&[("U1", "alice"), ("U2", "bob")])
    }

    #[test]
    fn display_zone_parses_local_utc_and_iana() {
        assert_eq!(DisplayZone::parse("local"), Some(DisplayZone::Local));
        assert_eq!(DisplayZone::parse("UTC"), Some(DisplayZone::Named(Tz::UTC)));
        assert!(DisplayZone::parse("Europe/Berlin").is_some());
        assert_eq!(DisplayZone::parse("Mars/Olympus"), None);
    }

    #[test]
    fn formats_timestamp_in_zone() {
        let ts: SlackTs = "1700000000.000100".parse().expect("ts");
        let utc = DisplayZone::parse("UTC").expect("utc");
        assert_eq!(utc.format(&ts), "2023-11-14 22:13:20");
        let tokyo = DisplayZone::parse("Asia/Tokyo").expect("tokyo");
        assert_eq!(tokyo.format(&ts), "2023-11-15 07:13:20");
    }

    #[test]
    fn flatten_emits_parent_then_replies() {
        let tmp = tempdir().expect("tempdir");
        let cache = NameCache::load(tmp.path().join("names.json"));
        let dir = directory();
        let zone = DisplayZone::parse("UTC").expect("utc");
        let flat = Normalizer::new(&cache, &dir, zone).flatten(&sample_threads());

        assert_eq!(flat.len(), 3 + 2);
        let texts: Vec<&str> = flat.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["morning", "deploy failed @alice", "looking", "fixed", "who owns billing?"]
        );
        assert_eq!(flat[1].author, "bob");
        assert_eq!(
            flat[2].position,
            Position::Reply {
                parent_ts: "1700000100.000000".to_string()
            }
        );
        assert!(flat[4].replies_missing);
        assert!(!flat[0].replies_missing);
        assert_eq!(dir.call_count(), 2);
    }

    #[test]
    fn flatten_is_deterministic() {
        let tmp = tempdir().expect("tempdir");
        let cache = NameCache::load(tmp.path().join("names.json"));
        let dir = directory();
        let zone = DisplayZone::parse("UTC").expect("utc");
        let normalizer = Normalizer::new(&cache, &dir, zone);
        assert_eq!(
            normalizer.flatten(&sample_threads()),
            normalizer.flatten(&sample_threads())
        );
    }

    #[test]
    fn author_falls_back_through_username_and_bot() {
        let tmp = tempdir().expect("tempdir");
        let cache = NameCache::load(tmp.path().join("names.json"));
        let dir = directory();
        let normalizer = Normalizer::new(&cache, &dir, DisplayZone::Local);

        let mut hook = msg("", "1.0", "build green");
        hook.user = None;
        hook.username = Some("ci-bot".to_string());
        assert_eq!(normalizer.author(&hook), "ci-bot");

        hook.username = None;
        hook.bot_id = Some("B42".to_string());
        assert_eq!(normalizer.author(&hook), "bot:B42");

        hook.bot_id = None;
        assert_eq!(normalizer.author(&hook), "unknown");

        let stranger = msg("U999", "2.0", "hi");
        assert_eq!(normalizer.author(&stranger), "U999");
    }

    #[test]
    fn mentions_expand_and_links_survive() {
        let tmp = tempdir().expect("tempdir");
        let cache = NameCache::load(tmp.path().join("names.json"));
        let mut dir = directory();
        dir.channels.insert("C9".to_string(), "ops".to_string());
        let normalizer = Normalizer::new(&cache, &dir, DisplayZone::Local);

        assert_eq!(
            normalizer.expand_mentions("<@U2> see <#C9> and <#C7|random>, <!here>"),
            "@bob see #ops and #random, @here"
        );
        assert_eq!(
            normalizer.expand_mentions("docs at <https://example.com|example> 1 < 2"),
            "docs at <https://example.com|example> 1 < 2"
        );
    }

    #[test]
    fn labels_that_carry_their_sigil_are_not_doubled() {
        let tmp = tempdir().expect("tempdir");
        let cache = NameCache::load(tmp.path().join("names.json"));
        let dir = directory();
        let normalizer = Normalizer::new(&cache, &dir, DisplayZone::Local);

        assert_eq!(
            normalizer.expand_mentions("ping <!subteam^S1|@eng> and <!channel>"),
            "ping @eng and @channel"
        );
        assert_eq!(normalizer.expand_mentions("<#C7|#random>"), "#random");
        assert_eq!(dir.call_count(), 0);
    }
}
