use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::db::Store;
use crate::manager::{ScanManager, SubmitScan};

/// Emits scans for due targets, most critical first. A submission failure
/// leaves `next_scan_at` alone so the target is retried on the next tick.
pub struct Scheduler {
    store: Store,
    manager: Arc<ScanManager>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(store: Store, manager: Arc<ScanManager>, interval_secs: u64) -> Self {
        Self {
            store,
            manager,
            interval: Duration::from_secs(interval_secs),
        }
    }

    pub async fn run_loop(self) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        let due = self.store.due_targets(Utc::now()).await?;
        if due.is_empty() {
            return Ok(());
        }
        info!(count = due.len(), "targets due for scanning");

        for target in due {
            let request = SubmitScan {
                target: target.host.clone(),
                scan_type: target.scan_type,
                ports: target.ports.clone(),
                probe_name: None,
                external_target_id: Some(target.external_id.clone()),
            };
            match self.manager.submit(request).await {
                Ok(record) => {
                    let now = Utc::now();
                    let next = now + chrono::Duration::hours(target.scan_frequency_hours);
                    if let Err(e) = self
                        .store
                        .update_target_schedule(&target.external_id, &record.scan_id, now, next)
                        .await
                    {
                        error!(external_id = %target.external_id, error = %e, "failed to update target schedule");
                    }
                    info!(
                        external_id = %target.external_id,
                        host = %target.host,
                        scan_id = %record.scan_id,
                        criticality = target.criticality.as_str(),
                        "scheduled scan created"
                    );
                }
                Err(e) => {
                    error!(external_id = %target.external_id, error = %e, "scheduled scan failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::Scheduler;
    use crate::gmp::testing::FakeEngine;
    use crate::manager::testing::{fast_config, manager_with};
    use crate::models::{Criticality, ScanType, SyncTarget};

    fn due_target(id: &str, host: &str, criticality: Criticality) -> SyncTarget {
        SyncTarget {
            id: id.to_string(),
            host: host.to_string(),
            ports: None,
            scan_type: ScanType::Full,
            criticality,
            scan_frequency_hours: 24,
            enabled: true,
            tags: None,
        }
    }

    #[tokio::test]
    async fn critical_targets_are_submitted_first() {
        let engine = Arc::new(FakeEngine::done("<report/>"));
        let (manager, store, _dir) = manager_with(fast_config(), &[("gvm-1", engine)]).await;
        store
            .apply_sync(&[
                due_target("asset-low", "10.0.0.1", Criticality::Low),
                due_target("asset-critical", "10.0.0.2", Criticality::Critical),
            ])
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), manager, 60);
        scheduler.tick().await.unwrap();

        // newest first: the low-priority scan was created after the critical one
        let scans = store.list_scans().await.unwrap();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].external_target_id.as_deref(), Some("asset-low"));
        assert_eq!(
            scans[1].external_target_id.as_deref(),
            Some("asset-critical")
        );

        let critical = store.get_target("asset-critical").await.unwrap().unwrap();
        assert_eq!(critical.last_scan_id.as_deref(), Some(scans[1].scan_id.as_str()));
        assert!(critical.next_scan_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn disabled_targets_are_never_emitted() {
        let engine = Arc::new(FakeEngine::done("<report/>"));
        let (manager, store, _dir) = manager_with(fast_config(), &[("gvm-1", engine)]).await;
        let mut disabled = due_target("asset-off", "10.0.0.9", Criticality::Critical);
        disabled.enabled = false;
        store.apply_sync(&[disabled]).await.unwrap();

        let scheduler = Scheduler::new(store.clone(), manager, 60);
        scheduler.tick().await.unwrap();

        assert!(store.list_scans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_submission_keeps_the_target_due() {
        // empty fleet: every submission is rejected
        let (manager, store, _dir) = manager_with(fast_config(), &[]).await;
        store
            .apply_sync(&[due_target("asset-001", "10.0.0.1", Criticality::High)])
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), manager, 60);
        scheduler.tick().await.unwrap();

        assert!(store.list_scans().await.unwrap().is_empty());
        let target = store.get_target("asset-001").await.unwrap().unwrap();
        assert!(target.last_scan_id.is_none());
        assert_eq!(store.due_targets(Utc::now()).await.unwrap().len(), 1);
    }
}
