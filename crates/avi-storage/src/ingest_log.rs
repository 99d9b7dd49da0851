use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Human-readable, append-only trail of ingestion attempts. Kept apart from
/// the manifest so operators can `tail` it.
#[derive(Debug)]
pub struct IngestLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IngestLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `<rfc3339 timestamp> key=value ...` as one line.
    pub async fn append(&self, fields: &[(&str, String)]) -> Result<()> {
        let line = format!(
            "{} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            format_log_fields(fields)
        );

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening ingest log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to ingest log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing ingest log {}", self.path.display()))?;
        Ok(())
    }
}

/// `key=value` pairs separated by spaces. Values containing whitespace,
/// quotes, `=` or control characters are double-quoted and escaped, so an
/// attempt is always exactly one line.
pub fn format_log_fields(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| {
            let needs_quotes = value.is_empty()
                || value
                    .chars()
                    .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '=');
            if needs_quotes {
                format!("{key}=\"{}\"", escape(value))
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:04x}}}", u32::from(c))),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fields_are_quoted_only_when_needed() {
        let line = format_log_fields(&[
            ("source", "tsa".to_string()),
            ("outcome", "rejected".to_string()),
            ("summary", "rejected: blocking failures [range:travelers]".to_string()),
            ("path", String::new()),
        ]);
        assert_eq!(
            line,
            "source=tsa outcome=rejected summary=\"rejected: blocking failures [range:travelers]\" path=\"\""
        );
    }

    #[test]
    fn control_characters_cannot_break_the_line() {
        let line = format_log_fields(&[
            ("error", "upstream said:\r\nbad \"gateway\"\tC:\\tmp\u{7}".to_string()),
            ("source", "otp".to_string()),
        ]);
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert_eq!(
            line,
            r#"error="upstream said:\r\nbad \"gateway\"\tC:\\tmp\u{0007}" source=otp"#
        );
    }

    #[tokio::test]
    async fn multi_line_values_stay_on_one_log_line() {
        let dir = tempdir().expect("tempdir");
        let log = IngestLog::new(dir.path().join("ingest.log"));
        log.append(&[("error", "first\nsecond".to_string())]).await.unwrap();
        log.append(&[("source", "tsa".to_string())]).await.unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(r#"error="first\nsecond""#));
    }

    #[tokio::test]
    async fn appends_one_line_per_call() {
        let dir = tempdir().expect("tempdir");
        let log = IngestLog::new(dir.path().join("logs").join("ingest.log"));
        log.append(&[("source", "otp".to_string())]).await.unwrap();
        log.append(&[("source", "metar".to_string())]).await.unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("source=otp"));
        assert!(lines[1].ends_with("source=metar"));
    }
}
