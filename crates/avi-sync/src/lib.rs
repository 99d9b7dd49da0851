//! Ingestion pipeline: idempotency check, cached fetch, normalization,
//! validation, persistence and provenance, one request at a time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use avi_adapters::{connector_for_source, ConnectorError, NormalizeError, SourceConnector};
use avi_core::{
    DateRange, FailureKind, FailureRecord, ManifestEntry, NormalizedTable, RawBatch,
    RequestParams, SourceId, ValidationReport,
};
use avi_storage::{HttpFetcher, IngestLog, ManifestStore, ParquetWriter, WriteError, WrittenDataset};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod cache;
pub mod config;
pub mod validate;

pub use cache::FetchCache;
pub use config::{IngestConfig, SourceSettings, ValidationSettings};
pub use validate::{RuleSet, ValidationRule};

pub const CRATE_NAME: &str = "avi-sync";

/// Source of "now" for attempt timestamps and the output partition date.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub source_id: SourceId,
    pub range: DateRange,
    pub stations: Vec<String>,
    /// Re-run even if an identical request already succeeded.
    pub force: bool,
}

impl IngestRequest {
    pub fn new(source_id: SourceId, range: DateRange) -> Self {
        Self {
            source_id,
            range,
            stations: Vec::new(),
            force: false,
        }
    }

    pub fn with_stations<I, S>(mut self, stations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stations = stations.into_iter().map(Into::into).collect();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Ingested {
        entry: ManifestEntry,
        report: ValidationReport,
        output: WrittenDataset,
        /// Daily rollups written next to `output`.
        derived: Vec<WrittenDataset>,
    },
    Rejected {
        entry: ManifestEntry,
        report: ValidationReport,
    },
    /// An identical request already succeeded; `entry` is that earlier record.
    AlreadyIngested { entry: ManifestEntry },
}

impl IngestOutcome {
    pub fn entry(&self) -> &ManifestEntry {
        match self {
            IngestOutcome::Ingested { entry, .. }
            | IngestOutcome::Rejected { entry, .. }
            | IngestOutcome::AlreadyIngested { entry } => entry,
        }
    }

    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            IngestOutcome::Ingested { report, .. } | IngestOutcome::Rejected { report, .. } => {
                Some(report)
            }
            IngestOutcome::AlreadyIngested { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Ingested { .. } => "ingested",
            IngestOutcome::Rejected { .. } => "rejected",
            IngestOutcome::AlreadyIngested { .. } => "skipped",
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid ingest request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("manifest: {0:#}")]
    Manifest(anyhow::Error),
}

impl IngestError {
    /// Category recorded on the manifest; `None` for errors raised before an
    /// attempt exists or while recording one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            IngestError::Connector(ConnectorError::UpstreamUnavailable(_)) => {
                Some(FailureKind::UpstreamUnavailable)
            }
            IngestError::Connector(ConnectorError::UpstreamRateLimited(_)) => {
                Some(FailureKind::UpstreamRateLimited)
            }
            IngestError::Connector(ConnectorError::UpstreamSchemaChanged(_))
            | IngestError::Normalize(NormalizeError::MissingColumn { .. }) => {
                Some(FailureKind::UpstreamSchemaChanged)
            }
            IngestError::Normalize(NormalizeError::MalformedRecord { .. }) => {
                Some(FailureKind::MalformedRecord)
            }
            IngestError::Write(_) => Some(FailureKind::WriteFailure),
            IngestError::InvalidRequest(_) | IngestError::Manifest(_) => None,
        }
    }
}

/// Fetch, normalize and validate results for one request, with no writes.
#[derive(Debug, Clone)]
pub struct StagedIngest {
    pub batch: Arc<RawBatch>,
    pub table: NormalizedTable,
    pub report: ValidationReport,
}

pub struct IngestPipeline {
    config: IngestConfig,
    http: HttpFetcher,
    connectors: BTreeMap<SourceId, Box<dyn SourceConnector>>,
    cache: FetchCache,
    writer: ParquetWriter,
    manifest: ManifestStore,
    log: IngestLog,
    clock: Box<dyn Clock>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let connectors = SourceId::ALL
            .into_iter()
            .map(|id| (id, connector_for_source(id, &config.connector_settings(id))))
            .collect();
        Ok(Self {
            http,
            connectors,
            cache: FetchCache::new(),
            writer: ParquetWriter::new(config.processed_dir()),
            manifest: ManifestStore::new(config.manifest_path()),
            log: IngestLog::new(config.ingest_log_path()),
            clock: Box::new(SystemClock),
            config,
        })
    }

    /// Replaces the connector registered for the connector's own source.
    pub fn with_connector(mut self, connector: Box<dyn SourceConnector>) -> Self {
        self.connectors.insert(connector.source_id(), connector);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn writer(&self) -> &ParquetWriter {
        &self.writer
    }

    /// Request params with stations normalized; configured default stations
    /// apply when the request names none.
    pub fn request_params(&self, request: &IngestRequest) -> Result<RequestParams, IngestError> {
        let stations = if request.stations.is_empty() {
            self.config.source(request.source_id).default_stations
        } else {
            request.stations.clone()
        };
        let params = RequestParams::new(request.source_id, request.range, stations);
        if request.source_id == SourceId::Metar && params.stations.is_empty() {
            return Err(IngestError::InvalidRequest(
                "metar ingestion needs at least one station".to_string(),
            ));
        }
        Ok(params)
    }

    pub async fn trigger_ingest(&self, request: IngestRequest) -> Result<IngestOutcome, IngestError> {
        let params = self.request_params(&request)?;
        let attempt_id = Uuid::new_v4();
        let span = info_span!("ingest", source = %params.source_id, %attempt_id);
        self.run_attempt(attempt_id, params, request.force)
            .instrument(span)
            .await
    }

    /// Fetch (through the session cache), normalize and validate.
    pub async fn stage(&self, params: &RequestParams) -> Result<StagedIngest, IngestError> {
        let connector = self.connectors.get(&params.source_id).ok_or_else(|| {
            IngestError::InvalidRequest(format!("no connector registered for {}", params.source_id))
        })?;
        let settings = self.config.source(params.source_id);

        let batch = self
            .cache
            .get_or_fetch(params, || connector.fetch(&self.http, params))
            .await?;
        if batch.is_partial() {
            warn!(
                requested = %batch.requested_range,
                returned = ?batch.returned_range,
                "upstream returned a partial range"
            );
        }

        let table = connector.normalize(&batch, settings.malformed_rows)?;
        if !table.dropped_rows.is_empty() {
            warn!(dropped = table.dropped_rows.len(), "dropped malformed rows");
        }
        let report = RuleSet::for_source(&connector.schema(), &settings.validation).validate(&table);
        Ok(StagedIngest {
            batch,
            table,
            report,
        })
    }

    async fn run_attempt(
        &self,
        attempt_id: Uuid,
        params: RequestParams,
        force: bool,
    ) -> Result<IngestOutcome, IngestError> {
        if !force {
            if let Some(previous) = self
                .manifest
                .latest_success(&params)
                .await
                .map_err(IngestError::Manifest)?
            {
                info!(previous_attempt = %previous.attempt_id, "request already ingested; skipping");
                self.log_attempt(&[
                    ("attempt", attempt_id.to_string()),
                    ("source", params.source_id.to_string()),
                    ("range", params.range.to_string()),
                    ("stations", params.stations.join(",")),
                    ("outcome", "skipped".to_string()),
                    ("previous_attempt", previous.attempt_id.to_string()),
                ])
                .await;
                return Ok(IngestOutcome::AlreadyIngested { entry: previous });
            }
        }

        let attempted_at = self.clock.now();
        let staged = match self.stage(&params).await {
            Ok(staged) => staged,
            Err(err) => {
                self.record_failure(attempt_id, &params, attempted_at, None, &err)
                    .await?;
                return Err(err);
            }
        };
        let StagedIngest { table, report, .. } = staged;

        if !report.accepted {
            let entry = self.entry(attempt_id, &params, attempted_at, &table, &report);
            self.manifest
                .record(&entry)
                .await
                .map_err(IngestError::Manifest)?;
            warn!(summary = %entry.validation_summary, "dataset rejected");
            self.log_entry(&entry, "rejected").await;
            return Ok(IngestOutcome::Rejected { entry, report });
        }

        let (output, derived) = match self.write_outputs(&params, &table, attempted_at.date_naive()) {
            Ok(written) => written,
            Err(err) => {
                let err = IngestError::Write(err);
                self.record_failure(attempt_id, &params, attempted_at, Some((&table, &report)), &err)
                    .await?;
                return Err(err);
            }
        };

        let mut entry = self.entry(attempt_id, &params, attempted_at, &table, &report);
        entry.output_path = Some(processed_path(&output.relative_path));
        entry.output_sha256 = Some(output.sha256.clone());
        entry.derived_outputs = derived.iter().map(|d| processed_path(&d.relative_path)).collect();
        self.manifest
            .record(&entry)
            .await
            .map_err(IngestError::Manifest)?;
        info!(rows = output.rows, path = %output.absolute_path.display(), "dataset ingested");
        self.log_entry(&entry, "ingested").await;
        Ok(IngestOutcome::Ingested {
            entry,
            report,
            output,
            derived,
        })
    }

    /// Main table, then the connector's daily rollup. If the rollup cannot be
    /// written the main file is removed again.
    fn write_outputs(
        &self,
        params: &RequestParams,
        table: &NormalizedTable,
        ingest_date: NaiveDate,
    ) -> Result<(WrittenDataset, Vec<WrittenDataset>), WriteError> {
        let output = self.writer.write(table, ingest_date)?;
        let summary = self
            .connectors
            .get(&params.source_id)
            .and_then(|connector| connector.daily_summary(table, params));
        let Some(summary) = summary else {
            return Ok((output, Vec::new()));
        };
        match self.writer.write_named(&summary.table, ingest_date, summary.name) {
            Ok(daily) => {
                info!(name = summary.name, rows = daily.rows, "daily rollup written");
                Ok((output, vec![daily]))
            }
            Err(err) => {
                if let Err(cleanup) = self.writer.discard(&output) {
                    warn!(error = %cleanup, "could not remove output after rollup failure");
                }
                Err(err)
            }
        }
    }

    fn entry(
        &self,
        attempt_id: Uuid,
        params: &RequestParams,
        attempted_at: DateTime<Utc>,
        table: &NormalizedTable,
        report: &ValidationReport,
    ) -> ManifestEntry {
        ManifestEntry {
            attempt_id,
            source_id: params.source_id,
            request_params: params.clone(),
            request_fingerprint: params.fingerprint(),
            attempted_at,
            accepted: report.accepted,
            row_count: table.row_count(),
            dropped_rows: table.dropped_rows.len(),
            returned_range: table.returned_range,
            output_path: None,
            output_sha256: None,
            derived_outputs: Vec::new(),
            validation_summary: report.summary(),
            report: Some(report.clone()),
            failure: None,
        }
    }

    async fn record_failure(
        &self,
        attempt_id: Uuid,
        params: &RequestParams,
        attempted_at: DateTime<Utc>,
        validated: Option<(&NormalizedTable, &ValidationReport)>,
        err: &IngestError,
    ) -> Result<(), IngestError> {
        let Some(kind) = err.failure_kind() else {
            return Ok(());
        };
        warn!(error = %err, ?kind, "ingestion attempt failed");

        let mut entry = match validated {
            Some((table, report)) => {
                let mut entry = self.entry(attempt_id, params, attempted_at, table, report);
                entry.validation_summary = format!("{}; write failed", entry.validation_summary);
                entry
            }
            None => ManifestEntry {
                attempt_id,
                source_id: params.source_id,
                request_params: params.clone(),
                request_fingerprint: params.fingerprint(),
                attempted_at,
                accepted: false,
                row_count: 0,
                dropped_rows: 0,
                returned_range: None,
                output_path: None,
                output_sha256: None,
                derived_outputs: Vec::new(),
                validation_summary: "not validated".to_string(),
                report: None,
                failure: None,
            },
        };
        entry.accepted = false;
        entry.failure = Some(FailureRecord {
            kind,
            message: err.to_string(),
        });
        self.manifest
            .record(&entry)
            .await
            .map_err(IngestError::Manifest)?;
        self.log_entry(&entry, "failed").await;
        Ok(())
    }

    async fn log_entry(&self, entry: &ManifestEntry, outcome: &str) {
        let mut fields = vec![
            ("attempt", entry.attempt_id.to_string()),
            ("source", entry.source_id.to_string()),
            ("range", entry.request_params.range.to_string()),
            ("stations", entry.request_params.stations.join(",")),
            ("outcome", outcome.to_string()),
            ("rows", entry.row_count.to_string()),
            ("dropped", entry.dropped_rows.to_string()),
            ("summary", entry.validation_summary.clone()),
        ];
        if let Some(path) = &entry.output_path {
            fields.push(("path", path.clone()));
        }
        if let Some(failure) = &entry.failure {
            fields.push(("error", failure.message.clone()));
        }
        self.log_attempt(&fields).await;
    }

    /// The log sink is best effort; the manifest is the record of truth.
    async fn log_attempt(&self, fields: &[(&str, String)]) {
        if let Err(err) = self.log.append(fields).await {
            warn!(error = %err, path = %self.log.path().display(), "could not append to ingest log");
        }
    }
}

/// Manifest form of a writer-relative path.
fn processed_path(relative: &Path) -> String {
    PathBuf::from("processed").join(relative).display().to_string()
}

pub async fn run_ingest_from_env(request: IngestRequest) -> Result<IngestOutcome> {
    let config = IngestConfig::from_env()?;
    let pipeline = IngestPipeline::new(config)?;
    Ok(pipeline.trigger_ingest(request).await?)
}
