use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::models::{Criticality, ScanRecord, ScanSummary, ScanType, SyncTarget, TargetRecord};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The only durable state in the system: one WAL-journaled SQLite file.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!(path = db_path, "database initialized");
        Ok(Self { pool })
    }

    // =========================================================================
    // Scans
    // =========================================================================

    pub async fn insert_scan(&self, record: &ScanRecord) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO scans (scan_id, probe_name, target, scan_type, ports, gvm_status,
                                gvm_progress, created_at, external_target_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.scan_id)
        .bind(&record.probe_name)
        .bind(&record.target)
        .bind(record.scan_type.as_str())
        .bind(ports_to_json(record.ports.as_deref()))
        .bind(&record.gvm_status)
        .bind(record.gvm_progress)
        .bind(record.created_at)
        .bind(&record.external_target_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_scan(&self, scan_id: &str) -> sqlx::Result<Option<ScanRecord>> {
        let row = sqlx::query("SELECT * FROM scans WHERE scan_id = ?")
            .bind(scan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    pub async fn list_scans(&self) -> sqlx::Result<Vec<ScanRecord>> {
        let rows = sqlx::query("SELECT * FROM scans ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(scan_from_row).collect()
    }

    /// Unfinished scans, oldest first, for restart re-adoption.
    pub async fn pending_scans(&self) -> sqlx::Result<Vec<ScanRecord>> {
        let rows =
            sqlx::query("SELECT * FROM scans WHERE completed_at IS NULL ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(scan_from_row).collect()
    }

    pub async fn active_counts(&self) -> sqlx::Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT probe_name, COUNT(*) AS cnt FROM scans
             WHERE completed_at IS NULL GROUP BY probe_name",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = HashMap::new();
        for row in rows {
            counts.insert(row.try_get("probe_name")?, row.try_get("cnt")?);
        }
        Ok(counts)
    }

    pub async fn set_engine_target_id(&self, scan_id: &str, id: &str) -> sqlx::Result<()> {
        sqlx::query("UPDATE scans SET engine_target_id = ? WHERE scan_id = ?")
            .bind(id)
            .bind(scan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_engine_task_id(&self, scan_id: &str, id: &str) -> sqlx::Result<()> {
        sqlx::query("UPDATE scans SET engine_task_id = ? WHERE scan_id = ?")
            .bind(id)
            .bind(scan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_started(
        &self,
        scan_id: &str,
        report_id: &str,
        started_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE scans SET engine_report_id = ?, started_at = ? WHERE scan_id = ?")
            .bind(report_id)
            .bind(started_at)
            .bind(scan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_scan_status(
        &self,
        scan_id: &str,
        status: &str,
        progress: i64,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE scans SET gvm_status = ?, gvm_progress = ? WHERE scan_id = ?")
            .bind(status)
            .bind(progress)
            .bind(scan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the report at terminal success. The `report_xml IS NULL` guard
    /// makes the write at-most-once when racing workers adopt the same scan.
    pub async fn write_report(
        &self,
        scan_id: &str,
        report_xml: &str,
        summary: &ScanSummary,
        completed_at: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE scans SET report_xml = ?, summary = ?, completed_at = ?
             WHERE scan_id = ? AND report_xml IS NULL",
        )
        .bind(report_xml)
        .bind(serde_json::to_string(summary).ok())
        .bind(completed_at)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finalize_scan(
        &self,
        scan_id: &str,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE scans SET completed_at = ?, error = COALESCE(?, error)
             WHERE scan_id = ? AND completed_at IS NULL",
        )
        .bind(completed_at)
        .bind(error)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Targets
    // =========================================================================

    /// Applies one upstream snapshot: upserts every received target and
    /// soft-deletes local rows missing from the snapshot. One transaction so a
    /// failed batch leaves the table untouched.
    pub async fn apply_sync(&self, received: &[SyncTarget]) -> sqlx::Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for target in received {
            sqlx::query(
                "INSERT INTO targets (external_id, host, ports, scan_type, criticality,
                                      criticality_weight, scan_frequency_hours, enabled, tags,
                                      next_scan_at, synced_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(external_id) DO UPDATE SET
                     host = excluded.host,
                     ports = excluded.ports,
                     scan_type = excluded.scan_type,
                     criticality = excluded.criticality,
                     criticality_weight = excluded.criticality_weight,
                     scan_frequency_hours = excluded.scan_frequency_hours,
                     enabled = excluded.enabled,
                     tags = excluded.tags,
                     synced_at = excluded.synced_at",
            )
            .bind(&target.id)
            .bind(&target.host)
            .bind(ports_to_json(target.ports.as_deref()))
            .bind(target.scan_type.as_str())
            .bind(target.criticality.as_str())
            .bind(target.criticality.weight())
            .bind(target.scan_frequency_hours)
            .bind(target.enabled)
            .bind(tags_to_json(target.tags.as_ref()))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let received_ids: HashSet<&str> = received.iter().map(|t| t.id.as_str()).collect();
        if received_ids.is_empty() {
            sqlx::query("UPDATE targets SET enabled = 0 WHERE enabled = 1")
                .execute(&mut *tx)
                .await?;
        } else {
            let placeholders = vec!["?"; received_ids.len()].join(", ");
            let sql = format!(
                "UPDATE targets SET enabled = 0 WHERE external_id NOT IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for id in &received_ids {
                query = query.bind(*id);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await
    }

    /// Targets ready to scan, most critical first. Targets with a scan still
    /// in flight are held back so a slow scan cannot pile up duplicates.
    pub async fn due_targets(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<TargetRecord>> {
        let rows = sqlx::query(
            "SELECT t.* FROM targets t
             WHERE t.enabled = 1 AND t.next_scan_at <= ?
               AND NOT EXISTS (
                   SELECT 1 FROM scans s
                   WHERE s.external_target_id = t.external_id AND s.completed_at IS NULL
               )
             ORDER BY t.criticality_weight DESC, t.next_scan_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(target_from_row).collect()
    }

    pub async fn update_target_schedule(
        &self,
        external_id: &str,
        scan_id: &str,
        last_scan_at: DateTime<Utc>,
        next_scan_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE targets SET last_scan_at = ?, next_scan_at = ?, last_scan_id = ?
             WHERE external_id = ?",
        )
        .bind(last_scan_at)
        .bind(next_scan_at)
        .bind(scan_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_targets(&self) -> sqlx::Result<Vec<TargetRecord>> {
        let rows =
            sqlx::query("SELECT * FROM targets ORDER BY criticality_weight DESC, host ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(target_from_row).collect()
    }

    pub async fn get_target(&self, external_id: &str) -> sqlx::Result<Option<TargetRecord>> {
        let row = sqlx::query("SELECT * FROM targets WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(target_from_row).transpose()
    }
}

fn ports_to_json(ports: Option<&[u16]>) -> Option<String> {
    ports.and_then(|p| serde_json::to_string(p).ok())
}

fn tags_to_json(
    tags: Option<&std::collections::BTreeMap<String, serde_json::Value>>,
) -> Option<String> {
    tags.and_then(|t| serde_json::to_string(t).ok())
}

fn scan_from_row(row: &SqliteRow) -> sqlx::Result<ScanRecord> {
    let scan_type: String = row.try_get("scan_type")?;
    let ports: Option<String> = row.try_get("ports")?;
    let summary: Option<String> = row.try_get("summary")?;
    Ok(ScanRecord {
        scan_id: row.try_get("scan_id")?,
        probe_name: row.try_get("probe_name")?,
        target: row.try_get("target")?,
        scan_type: ScanType::parse(&scan_type),
        ports: ports.and_then(|p| serde_json::from_str(&p).ok()),
        engine_target_id: row.try_get("engine_target_id")?,
        engine_task_id: row.try_get("engine_task_id")?,
        engine_report_id: row.try_get("engine_report_id")?,
        gvm_status: row.try_get("gvm_status")?,
        gvm_progress: row.try_get("gvm_progress")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        report_xml: row.try_get("report_xml")?,
        summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.try_get("error")?,
        external_target_id: row.try_get("external_target_id")?,
    })
}

fn target_from_row(row: &SqliteRow) -> sqlx::Result<TargetRecord> {
    let scan_type: String = row.try_get("scan_type")?;
    let criticality: String = row.try_get("criticality")?;
    let ports: Option<String> = row.try_get("ports")?;
    let tags: Option<String> = row.try_get("tags")?;
    Ok(TargetRecord {
        external_id: row.try_get("external_id")?,
        host: row.try_get("host")?,
        ports: ports.and_then(|p| serde_json::from_str(&p).ok()),
        scan_type: ScanType::parse(&scan_type),
        criticality: Criticality::parse(&criticality),
        criticality_weight: row.try_get("criticality_weight")?,
        scan_frequency_hours: row.try_get("scan_frequency_hours")?,
        enabled: row.try_get("enabled")?,
        tags: tags.and_then(|t| serde_json::from_str(&t).ok()),
        last_scan_at: row.try_get("last_scan_at")?,
        next_scan_at: row.try_get("next_scan_at")?,
        last_scan_id: row.try_get("last_scan_id")?,
        synced_at: row.try_get("synced_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
pub mod testing {
    use super::Store;

    pub async fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scans.db");
        let store = Store::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open store");
        (store, dir)
    }
}
