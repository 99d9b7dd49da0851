use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use avi_core::{ManifestEntry, RequestParams, SourceId};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only JSON Lines record of every ingestion attempt.
///
/// Entries are never rewritten. Appends go through a single async mutex so
/// concurrent callers within one process keep line order intact; separate
/// processes writing the same file are not coordinated.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, entry: &ManifestEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serializing manifest entry")?;
        line.push('\n');

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
            .with_context(|| format!("opening manifest {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to manifest {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing manifest {}", self.path.display()))?;
        Ok(())
    }

    /// All entries, oldest first. A torn final line from an interrupted
    /// append is skipped; corruption anywhere else is an error.
    pub async fn entries(&self) -> Result<Vec<ManifestEntry>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking manifest {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading manifest {}", self.path.display()))?;
        let complete = text.ends_with('\n');
        let lines = text.lines().collect::<Vec<_>>();

        let mut entries = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ManifestEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) if idx + 1 == lines.len() && !complete => {
                    warn!(path = %self.path.display(), error = %err, "skipping torn manifest tail");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("parsing manifest {} line {}", self.path.display(), idx + 1)
                    })
                }
            }
        }
        Ok(entries)
    }

    pub async fn history(&self, source_id: Option<SourceId>) -> Result<Vec<ManifestEntry>> {
        let entries = self.entries().await?;
        Ok(match source_id {
            Some(source_id) => entries
                .into_iter()
                .filter(|e| e.source_id == source_id)
                .collect(),
            None => entries,
        })
    }

    /// Most recent accepted entry for exactly these (normalized) params.
    pub async fn latest_success(&self, params: &RequestParams) -> Result<Option<ManifestEntry>> {
        let wanted = params.normalized();
        Ok(self
            .entries()
            .await?
            .into_iter()
            .rev()
            .find(|e| e.accepted && e.request_params.normalized() == wanted))
    }

    pub async fn has_succeeded(&self, params: &RequestParams) -> Result<bool> {
        Ok(self.latest_success(params).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avi_core::DateRange;
    use chrono::{NaiveDate, TimeZone, Utc};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn params(source_id: SourceId, stations: &[&str]) -> RequestParams {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 5).unwrap(),
        )
        .unwrap();
        RequestParams::new(source_id, range, stations.iter().copied())
    }

    fn entry(params: &RequestParams, accepted: bool) -> ManifestEntry {
        ManifestEntry {
            attempt_id: Uuid::new_v4(),
            source_id: params.source_id,
            request_params: params.clone(),
            request_fingerprint: params.fingerprint(),
            attempted_at: Utc.with_ymd_and_hms(2023, 1, 6, 12, 0, 0).single().unwrap(),
            accepted,
            row_count: 5,
            dropped_rows: 0,
            returned_range: Some(params.range),
            output_path: accepted.then(|| "tsa/ingest_date=2023-01-06/tsa.parquet".to_string()),
            output_sha256: None,
            derived_outputs: Vec::new(),
            validation_summary: if accepted { "accepted" } else { "rejected" }.to_string(),
            report: None,
            failure: None,
        }
    }

    #[tokio::test]
    async fn missing_manifest_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = ManifestStore::new(dir.path().join("manifest.jsonl"));
        assert!(store.entries().await.unwrap().is_empty());
        assert!(!store.has_succeeded(&params(SourceId::Tsa, &[])).await.unwrap());
    }

    #[tokio::test]
    async fn records_append_and_preserve_order() {
        let dir = tempdir().expect("tempdir");
        let store = ManifestStore::new(dir.path().join("nested").join("manifest.jsonl"));
        let p = params(SourceId::Tsa, &[]);
        let first = entry(&p, false);
        let second = entry(&p, true);
        store.record(&first).await.unwrap();
        store.record(&second).await.unwrap();

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attempt_id, first.attempt_id);
        assert_eq!(entries[1].attempt_id, second.attempt_id);
    }

    #[tokio::test]
    async fn idempotency_matches_exact_normalized_params_only() {
        let dir = tempdir().expect("tempdir");
        let store = ManifestStore::new(dir.path().join("manifest.jsonl"));
        let jfk = params(SourceId::Metar, &["KJFK"]);
        store.record(&entry(&params(SourceId::Metar, &["KLAX"]), true)).await.unwrap();
        store.record(&entry(&jfk, false)).await.unwrap();
        assert!(!store.has_succeeded(&jfk).await.unwrap());

        store.record(&entry(&jfk, true)).await.unwrap();
        assert!(store.has_succeeded(&params(SourceId::Metar, &["kjfk"])).await.unwrap());
        assert!(!store.has_succeeded(&params(SourceId::Otp, &["KJFK"])).await.unwrap());
        assert_eq!(store.history(Some(SourceId::Metar)).await.unwrap().len(), 3);
        assert!(store.history(Some(SourceId::Tsa)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn torn_tail_is_skipped_but_interior_corruption_fails() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("manifest.jsonl");
        let store = ManifestStore::new(&path);
        store.record(&entry(&params(SourceId::Tsa, &[]), true)).await.unwrap();

        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"attempt_id\":");
        std::fs::write(&path, &text).unwrap();
        assert_eq!(store.entries().await.unwrap().len(), 1);

        text.push('\n');
        std::fs::write(&path, &text).unwrap();
        assert!(store.entries().await.is_err());
    }
}
