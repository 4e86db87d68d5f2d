fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Warning<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub channel: &'a str,
    pub retry: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

pub fn render(w: &Warning<'_>) -> String {
    format!(
        "DIGEST_WARN code={} stage={} channel={} retry={} reason={} err={}",
        sanitize_value(w.code),
        sanitize_value(w.stage),
        sanitize_value(w.channel),
        sanitize_value(w.retry),
        sanitize_value(w.reason),
        sanitize_value(w.err),
    )
}

pub fn emit(w: Warning<'_>) {
    tracing::warn!(target: "slack_digest::warn", "{}", render(&w));
}

#[cfg(test)]
mod tests {
    use super::{Warning, render, sanitize_value};

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
    }

    #[test]
    fn sanitize_value_falls_back_for_empty() {
        assert_eq!(sanitize_value("   "), "na");
    }

    #[test]
    fn render_fills_missing_fields_with_na() {
        let line = render(&Warning {
            code: "RATE_LIMITED",
            stage: "history",
            retry: "2/5",
            ..Warning::default()
        });
        assert_eq!(
            line,
            "DIGEST_WARN code=RATE_LIMITED stage=history channel=na retry=2/5 reason=na err=na"
        );
    }
}
