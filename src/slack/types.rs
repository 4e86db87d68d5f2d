use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Slack message timestamp (`"1700000000.000100"`), ordered numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlackTs {
    raw: String,
    secs: i64,
    micros: u32,
}

impl SlackTs {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp();
        let micros = at.timestamp_subsec_micros();
        Self {
            raw: format!("{secs}.{micros:06}"),
            secs,
            micros,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn micros(&self) -> u32 {
        self.micros
    }

    fn key(&self) -> (i64, u32) {
        (self.secs, self.micros)
    }
}

impl FromStr for SlackTs {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        let secs = whole
            .parse::<i64>()
            .map_err(|_| format!("invalid slack timestamp `{raw}`"))?;
        if frac.len() > 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid slack timestamp `{raw}`"));
        }
        let micros = if frac.is_empty() {
            0
        } else {
            format!("{frac:0<6}")
                .parse::<u32>()
                .map_err(|_| format!("invalid slack timestamp `{raw}`"))?
        };
        Ok(Self {
            raw: trimmed.to_string(),
            secs,
            micros,
        })
    }
}

impl TryFrom<String> for SlackTs {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<SlackTs> for String {
    fn from(ts: SlackTs) -> Self {
        ts.raw
    }
}

impl fmt::Display for SlackTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for SlackTs {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for SlackTs {}

impl Hash for SlackTs {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for SlackTs {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlackTs {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Shape shared by `conversations.history` and `conversations.replies`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePage<T> {
    #[serde(default = "Vec::new")]
    pub messages: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

impl<T> MessagePage<T> {
    pub fn next_cursor(&self) -> Option<String> {
        if !self.has_more {
            return None;
        }
        self.response_metadata
            .as_ref()
            .and_then(|meta| meta.next_cursor.as_deref())
            .map(str::trim)
            .filter(|cursor| !cursor.is_empty())
            .map(ToOwned::to_owned)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub profile: Option<WireProfile>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl WireUser {
    pub fn display_name(&self) -> String {
        let profile = self.profile.as_ref();
        non_empty(profile.and_then(|p| p.display_name.as_deref()))
            .or_else(|| non_empty(profile.and_then(|p| p.real_name.as_deref())))
            .or_else(|| non_empty(self.real_name.as_deref()))
            .or_else(|| non_empty(self.name.as_deref()))
            .unwrap_or(self.id.as_str())
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfoResponse {
    pub user: WireUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireChannel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfoResponse {
    pub channel: WireChannel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthTestResponse {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn slack_ts_orders_numerically_not_lexically() {
        let a: SlackTs = "999.5".parse().expect("a");
        let b: SlackTs = "1000.000001".parse().expect("b");
        assert!(a < b);
        let c: SlackTs = "1000.1".parse().expect("c");
        let d: SlackTs = "1000.100000".parse().expect("d");
        assert_eq!(c, d);
        assert_eq!(c.micros(), 100_000);
    }

    #[test]
    fn slack_ts_rejects_garbage() {
        assert!("abc".parse::<SlackTs>().is_err());
        assert!("1.1234567".parse::<SlackTs>().is_err());
    }

    #[test]
    fn slack_ts_from_datetime_uses_micro_precision() {
        let at = Utc
            .timestamp_opt(1_700_000_000, 42_000)
            .single()
            .expect("valid time");
        assert_eq!(SlackTs::from_datetime(at).as_str(), "1700000000.000042");
    }

    #[test]
    fn next_cursor_requires_has_more_and_non_empty_cursor() {
        let done: MessagePage<serde_json::Value> = serde_json::from_value(json!({
            "messages": [],
            "has_more": false,
            "response_metadata": {"next_cursor": "abc"}
        }))
        .expect("page");
        assert_eq!(done.next_cursor(), None);

        let empty: MessagePage<serde_json::Value> = serde_json::from_value(json!({
            "messages": [],
            "has_more": true,
            "response_metadata": {"next_cursor": ""}
        }))
        .expect("page");
        assert_eq!(empty.next_cursor(), None);

        let more: MessagePage<serde_json::Value> = serde_json::from_value(json!({
            "messages": [],
            "has_more": true,
            "response_metadata": {"next_cursor": "dXNlcjpVMDYx"}
        }))
        .expect("page");
        assert_eq!(more.next_cursor().as_deref(), Some("dXNlcjpVMDYx"));
    }

    #[test]
    fn user_display_name_prefers_profile_display_name() {
        let user: WireUser = serde_json::from_value(json!({
            "id": "U1",
            "name": "jdoe",
            "real_name": "Jane Doe",
            "profile": {"display_name": "", "real_name": "Jane P. Doe"}
        }))
        .expect("user");
        assert_eq!(user.display_name(), "Jane P. Doe");

        let bare: WireUser = serde_json::from_value(json!({"id": "U2"})).expect("user");
        assert_eq!(bare.display_name(), "U2");
    }
}
