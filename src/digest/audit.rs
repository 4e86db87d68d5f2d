use crate::digest::paths::DigestPaths;
use crate::digest::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub channel: String,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_sha256: Option<String>,
}

pub fn audit_log_path(paths: &DigestPaths) -> PathBuf {
    paths.logs_dir.join("audit.log")
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn append_event(
    paths: &DigestPaths,
    channel: &str,
    status: &str,
    message: &str,
    summary: Option<&str>,
) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        channel: channel.to_string(),
        status: status.to_string(),
        message: message.to_string(),
        summary_sha256: summary.map(sha256_hex),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = audit_log_path(paths);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_event_writes_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let paths = DigestPaths::under(tmp.path());

        append_event(&paths, "C1", "ok", "wrote summary", Some("hello")).expect("first");
        append_event(&paths, "C2", "failed", "summarization", None).expect("second");

        let raw = fs::read_to_string(audit_log_path(&paths)).expect("read audit");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["channel"], "C1");
        assert_eq!(first["summary_sha256"], sha256_hex("hello"));
        assert!(!lines[1].contains("summary_sha256"));
    }
}
