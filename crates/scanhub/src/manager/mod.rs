use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::db::Store;
use crate::gmp::{Engine, EngineError, ProbeSet};
use crate::metrics::Metrics;
use crate::models::{self, gvm_status, ScanRecord, ScanType};
use crate::report;
use crate::selector::{self, SelectError};

// consecutive poll failures tolerated on top of the engine client's own retries
const POLL_FAILURE_BUDGET: u32 = 5;
const CALLBACK_ATTEMPTS: u32 = 3;
const CALLBACK_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SubmitScan {
    pub target: String,
    pub scan_type: ScanType,
    pub ports: Option<Vec<u16>>,
    pub probe_name: Option<String>,
    pub external_target_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(String),
    #[error("unknown probe '{0}'")]
    ProbeNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<SelectError> for SubmitError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoProbes => SubmitError::Invalid("no probes configured".to_string()),
            SelectError::ProbeNotFound(p) => SubmitError::ProbeNotFound(p),
        }
    }
}

/// Owns every scan from submission to its terminal state. Each live scan gets
/// exactly one worker task; the store row is that worker's to write until
/// `completed_at` is set.
pub struct ScanManager {
    store: Store,
    probes: Arc<ProbeSet>,
    config: Arc<AppConfig>,
    metrics: Arc<Metrics>,
    history: Mutex<VecDeque<String>>,
    http: reqwest::Client,
}

impl ScanManager {
    pub fn new(
        store: Store,
        probes: Arc<ProbeSet>,
        config: Arc<AppConfig>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.source.timeout))
            .build()
            .context("failed to build callback http client")?;
        Ok(Self {
            store,
            probes,
            config,
            metrics,
            history: Mutex::new(VecDeque::new()),
            http,
        })
    }

    pub async fn submit(self: &Arc<Self>, request: SubmitScan) -> Result<ScanRecord, SubmitError> {
        let target = request.target.trim().to_string();
        models::validate_target(&target).map_err(SubmitError::Invalid)?;
        models::validate_ports(request.scan_type, request.ports.as_deref())
            .map_err(SubmitError::Invalid)?;

        let counts = self.store.active_counts().await?;
        let names = self.probes.names();
        let max_consecutive = self.config.scan.max_consecutive_same_probe;
        let probe_name = {
            let mut history = self.history.lock().await;
            let chosen = selector::select_probe(
                &names,
                &counts,
                &history,
                max_consecutive,
                request.probe_name.as_deref(),
            )?;
            history.push_back(chosen.clone());
            while history.len() > max_consecutive {
                history.pop_front();
            }
            chosen
        };

        let record = ScanRecord::new(
            target,
            request.scan_type,
            request.ports,
            probe_name.clone(),
            request.external_target_id,
        );
        self.store.insert_scan(&record).await?;

        self.metrics
            .scans_submitted
            .with_label_values(&[record.scan_type.as_str()])
            .inc();
        self.metrics
            .probe_scans_routed
            .with_label_values(&[&probe_name])
            .inc();
        info!(
            scan_id = %record.scan_id,
            target = %record.target,
            scan_type = %record.scan_type,
            probe = %probe_name,
            "scan created"
        );

        let manager = Arc::clone(self);
        let scan_id = record.scan_id.clone();
        tokio::spawn(async move { manager.run_scan(scan_id).await });

        Ok(record)
    }

    /// Re-adopts every unfinished scan after a restart. Stored engine ids tell
    /// the worker which stages already succeeded.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<usize> {
        let pending = self.store.pending_scans().await?;
        let count = pending.len();
        for record in pending {
            info!(
                scan_id = %record.scan_id,
                gvm_status = %record.gvm_status,
                probe = %record.probe_name,
                "re-adopting unfinished scan"
            );
            let manager = Arc::clone(self);
            let scan_id = record.scan_id;
            tokio::spawn(async move { manager.run_scan(scan_id).await });
        }
        if count > 0 {
            info!(count, "recovered unfinished scans");
        }
        Ok(count)
    }

    pub async fn run_scan(self: Arc<Self>, scan_id: String) {
        let mut record = match self.store.get_scan(&scan_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                error!(scan_id = %scan_id, error = %e, "failed to load scan");
                return;
            }
        };
        if record.completed_at.is_some() {
            return;
        }

        let probe = record.probe_name.clone();
        self.metrics.scans_active.inc();
        self.metrics.probe_scans_active.with_label_values(&[&probe]).inc();
        info!(scan_id = %scan_id, target = %record.target, probe = %probe, "scan executing");

        if let Err(e) = self.drive_scan(&mut record).await {
            error!(scan_id = %scan_id, error = %e, "scan failed");
            self.metrics.scans_failed.inc();
            if matches!(
                e.downcast_ref::<EngineError>(),
                Some(EngineError::Unavailable(_)) | Some(EngineError::Timeout(_))
            ) {
                self.metrics
                    .gvm_connection_errors
                    .with_label_values(&[&probe])
                    .inc();
            }
            if let Err(store_err) = self
                .store
                .finalize_scan(&scan_id, Utc::now(), Some(&e.to_string()))
                .await
            {
                error!(scan_id = %scan_id, error = %store_err, "failed to finalize scan");
            }
        }

        self.metrics.scans_active.dec();
        self.metrics.probe_scans_active.with_label_values(&[&probe]).dec();

        match self.store.get_scan(&scan_id).await {
            Ok(Some(finished)) if finished.completed_at.is_some() => {
                self.send_callback(&finished).await;
            }
            Ok(_) => {}
            Err(e) => error!(scan_id = %scan_id, error = %e, "failed to reload finished scan"),
        }
    }

    async fn drive_scan(&self, record: &mut ScanRecord) -> anyhow::Result<()> {
        let engine = self
            .probes
            .get(&record.probe_name)
            .map(|p| p.engine.clone())
            .with_context(|| format!("probe '{}' is not configured", record.probe_name))?;
        let resource_name = format!("scan-{}", record.scan_id);

        if record.engine_target_id.is_none() {
            let id = engine
                .create_target(&resource_name, &record.target, record.ports.as_deref())
                .await?;
            self.store.set_engine_target_id(&record.scan_id, &id).await?;
            record.engine_target_id = Some(id);
        }
        let target_id = record
            .engine_target_id
            .clone()
            .context("scan has no engine target id")?;

        if record.engine_task_id.is_none() {
            let id = engine.create_task(&resource_name, &target_id).await?;
            self.store.set_engine_task_id(&record.scan_id, &id).await?;
            debug!(scan_id = %record.scan_id, target_id = %target_id, task_id = %id, "engine resources created");
            record.engine_task_id = Some(id);
        }
        let task_id = record
            .engine_task_id
            .clone()
            .context("scan has no engine task id")?;

        if record.engine_report_id.is_none() {
            let report_id = engine.start_task(&task_id).await?;
            let started_at = Utc::now();
            self.store
                .mark_started(&record.scan_id, &report_id, started_at)
                .await?;
            record.engine_report_id = Some(report_id);
            record.started_at = Some(started_at);
            info!(scan_id = %record.scan_id, task_id = %task_id, "scan started");
        }
        let started_at = record.started_at.unwrap_or_else(Utc::now);

        let poll_interval = Duration::from_secs(self.config.scan.poll_interval);
        let max_duration = self.config.scan.max_duration as i64;
        let mut failures: u32 = 0;
        let final_status = loop {
            let elapsed = (Utc::now() - started_at).num_seconds();
            if elapsed > max_duration {
                warn!(scan_id = %record.scan_id, elapsed, max_duration, "scan exceeded wall-clock cap");
                if let Err(e) = engine.stop_task(&task_id).await {
                    warn!(scan_id = %record.scan_id, error = %e, "stop after timeout failed");
                }
                anyhow::bail!("Scan timed out after {elapsed}s (max: {max_duration}s)");
            }

            match engine.get_task(&task_id).await {
                Ok(status) => {
                    failures = 0;
                    self.store
                        .update_scan_status(&record.scan_id, &status.status, status.progress)
                        .await?;
                    debug!(
                        scan_id = %record.scan_id,
                        gvm_status = %status.status,
                        gvm_progress = status.progress,
                        "scan poll"
                    );
                    if gvm_status::is_terminal(&status.status) {
                        break status.status;
                    }
                }
                Err(e) if e.is_transient() && failures < POLL_FAILURE_BUDGET => {
                    failures += 1;
                    warn!(
                        scan_id = %record.scan_id,
                        error = %e,
                        failures,
                        "poll failed, will retry"
                    );
                }
                Err(e) => return Err(e.into()),
            }

            sleep(poll_interval).await;
        };

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_seconds().max(0);
        self.metrics.scan_duration.observe(duration as f64);
        self.metrics
            .scans_completed
            .with_label_values(&[&final_status])
            .inc();

        if final_status == gvm_status::DONE {
            let report_id = record
                .engine_report_id
                .clone()
                .context("scan has no engine report id")?;
            let report_xml = engine.get_report(&report_id).await?;
            let summary = report::parse_summary(&report_xml);
            let wrote = self
                .store
                .write_report(&record.scan_id, &report_xml, &summary, completed_at)
                .await?;
            if wrote {
                info!(
                    scan_id = %record.scan_id,
                    hosts = summary.hosts_scanned,
                    high = summary.vulns_high,
                    medium = summary.vulns_medium,
                    low = summary.vulns_low,
                    "report collected"
                );
            } else {
                debug!(scan_id = %record.scan_id, "report already recorded by an earlier worker");
            }
            if self.config.scan.cleanup_after_report {
                self.cleanup_engine_resources(engine.as_ref(), record).await;
            }
        } else {
            let error = gvm_status::is_failure(&final_status)
                .then(|| format!("Scan ended with status: {final_status}"));
            self.store
                .finalize_scan(&record.scan_id, completed_at, error.as_deref())
                .await?;
        }

        Ok(())
    }

    async fn cleanup_engine_resources(&self, engine: &dyn Engine, record: &ScanRecord) {
        if let Some(task_id) = &record.engine_task_id {
            if let Err(e) = engine.delete_task(task_id).await {
                warn!(scan_id = %record.scan_id, error = %e, "task cleanup failed");
            }
        }
        if let Some(target_id) = &record.engine_target_id {
            if let Err(e) = engine.delete_target(target_id).await {
                warn!(scan_id = %record.scan_id, error = %e, "target cleanup failed");
            }
        }
    }

    /// Reports a finished scheduler-originated scan back to the inventory.
    /// Best-effort: delivery failures are logged and never revisit the scan.
    async fn send_callback(&self, record: &ScanRecord) {
        let Some(url) = &self.config.source.callback_url else {
            return;
        };
        if record.external_target_id.is_none() {
            return;
        }

        let payload = callback_payload(record);
        for attempt in 1..=CALLBACK_ATTEMPTS {
            let mut request = self.http.post(url).json(&payload);
            if let Some(token) = &self.config.source.auth_token {
                request = request.header(AUTHORIZATION, token);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(scan_id = %record.scan_id, status = %response.status(), "callback sent");
                    return;
                }
                Ok(response) => {
                    warn!(scan_id = %record.scan_id, status = %response.status(), attempt, "callback rejected");
                }
                Err(e) => {
                    warn!(scan_id = %record.scan_id, error = %e, attempt, "callback failed");
                }
            }
            if attempt < CALLBACK_ATTEMPTS {
                sleep(CALLBACK_RETRY_DELAY).await;
            }
        }
        error!(scan_id = %record.scan_id, "callback delivery gave up");
    }
}

fn callback_payload(record: &ScanRecord) -> serde_json::Value {
    let duration_seconds = match (record.started_at, record.completed_at) {
        (Some(started), Some(completed)) => (completed - started).num_seconds().max(0),
        _ => 0,
    };
    serde_json::json!({
        "external_target_id": record.external_target_id,
        "scan_id": record.scan_id,
        "probe_name": record.probe_name,
        "host": record.target,
        "gvm_status": record.gvm_status,
        "completed_at": record.completed_at,
        "summary": record.summary,
        "duration_seconds": duration_seconds,
    })
}
