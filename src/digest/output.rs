use crate::digest::history::TimeWindow;
use crate::digest::normalize::DisplayZone;
use crate::digest::util::write_atomic;
use crate::error::DigestError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SummaryMeta<'a> {
    pub channel_name: &'a str,
    pub generated_at: DateTime<Utc>,
    pub message_count: usize,
    pub model: &'a str,
    pub zone: DisplayZone,
}

pub fn summary_file_name(channel_id: &str, window: &TimeWindow) -> String {
    format!(
        "{}_{}-{}.md",
        channel_id,
        window.since.format("%Y%m%d"),
        window.until.format("%Y%m%d")
    )
}

pub fn render_summary_file(
    channel_id: &str,
    window: &TimeWindow,
    summary: &str,
    meta: &SummaryMeta<'_>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Summary for #{}\n\n", meta.channel_name));
    out.push_str(&format!(
        "- Generated: {}\n",
        meta.zone
            .format_datetime(meta.generated_at, "%Y-%m-%d %H:%M:%S %Z")
    ));
    out.push_str(&format!("- Channel ID: {channel_id}\n"));
    out.push_str(&format!("- Time Range: {}\n", window.label()));
    out.push_str(&format!("- Message Count: {}\n", meta.message_count));
    out.push_str(&format!("- Model: {}\n", meta.model));
    out.push_str("\n---\n\n");
    out.push_str(summary.trim());
    out.push('\n');
    out
}

/// Write one channel's summary into `dir`, replacing any previous file for
/// the same channel and window atomically.
pub fn write_summary(
    dir: &Path,
    channel_id: &str,
    window: &TimeWindow,
    summary: &str,
    meta: &SummaryMeta<'_>,
) -> Result<PathBuf> {
    let path = dir.join(summary_file_name(channel_id, window));
    let body = render_summary_file(channel_id, window, summary, meta);
    write_atomic(&path, &body).map_err(|err| {
        anyhow::Error::new(DigestError::Write {
            path: path.display().to_string(),
            reason: format!("{err:#}"),
        })
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::tempdir;

    fn window() -> TimeWindow {
        let until = Utc
            .with_ymd_and_hms(2024, 3, 15, 8, 30, 0)
            .single()
            .expect("time");
        TimeWindow::ending_at(until, 14)
    }

    fn meta() -> SummaryMeta<'static> {
        SummaryMeta {
            channel_name: "eng",
            generated_at: Utc
                .with_ymd_and_hms(2024, 3, 15, 8, 30, 0)
                .single()
                .expect("time"),
            message_count: 5,
            model: "openai:gpt-4o",
            zone: DisplayZone::parse("UTC").expect("utc"),
        }
    }

    #[test]
    fn file_name_uses_channel_and_window_dates() {
        assert_eq!(summary_file_name("C123", &window()), "C123_20240301-20240315.md");
    }

    #[test]
    fn writes_header_then_summary() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("summaries");
        let path = write_summary(&dir, "C123", &window(), "\n## Open Issues\n- None\n", &meta())
            .expect("write");
        assert_eq!(path, dir.join("C123_20240301-20240315.md"));

        let body = fs::read_to_string(&path).expect("read");
        let expected = "# Summary for #eng\n\n\
            - Generated: 2024-03-15 08:30:00 UTC\n\
            - Channel ID: C123\n\
            - Time Range: 2024-03-01 to 2024-03-15\n\
            - Message Count: 5\n\
            - Model: openai:gpt-4o\n\
            \n---\n\n\
            ## Open Issues\n- None\n";
        assert_eq!(body, expected);
    }

    #[test]
    fn rerun_replaces_previous_summary() {
        let tmp = tempdir().expect("tempdir");
        write_summary(tmp.path(), "C1", &window(), "old", &meta()).expect("first");
        let path = write_summary(tmp.path(), "C1", &window(), "new", &meta()).expect("second");
        let body = fs::read_to_string(path).expect("read");
        assert!(body.ends_with("---\n\nnew\n"));
        assert_eq!(fs::read_dir(tmp.path()).expect("dir").count(), 1);
    }

    #[test]
    fn unwritable_destination_is_write_failure() {
        let tmp = tempdir().expect("tempdir");
        let blocker = tmp.path().join("summaries");
        fs::write(&blocker, "not a directory").expect("blocker");
        let err = write_summary(&blocker, "C1", &window(), "text", &meta()).expect_err("must fail");
        assert_eq!(FailureKind::classify(&err), FailureKind::Write);
    }
}
