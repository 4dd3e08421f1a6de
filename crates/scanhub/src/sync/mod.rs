use std::time::Duration;

use anyhow::Context;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{error, info, warn};

use crate::config::SourceConfig;
use crate::db::Store;
use crate::models::SyncTarget;

/// Pulls the upstream inventory on an interval and reconciles the local target
/// table. Upstream failures never touch the store: the scheduler keeps working
/// off whatever was synced last.
pub struct TargetSync {
    store: Store,
    config: SourceConfig,
    http: reqwest::Client,
}

impl TargetSync {
    pub fn new(store: Store, config: SourceConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .context("failed to build sync http client")?;
        Ok(Self { store, config, http })
    }

    pub async fn run_loop(self) {
        let interval = Duration::from_secs(self.config.sync_interval);
        info!(interval_secs = self.config.sync_interval, "target sync started");
        loop {
            if let Err(e) = self.sync_once().await {
                error!(error = %e, "target sync failed; keeping existing targets");
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn sync_once(&self) -> anyhow::Result<()> {
        let Some(url) = &self.config.url else {
            return Ok(());
        };

        let mut request = self.http.get(url).header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.config.auth_token {
            request = request.header(AUTHORIZATION, token);
        }
        let body: serde_json::Value = request
            .send()
            .await
            .context("upstream request failed")?
            .error_for_status()
            .context("upstream returned an error status")?
            .json()
            .await
            .context("upstream response is not valid JSON")?;

        let targets = extract_targets(&body)?;
        let active = targets.iter().filter(|t| t.enabled).count();
        self.store.apply_sync(&targets).await?;
        info!(received = targets.len(), active, "target sync done");
        Ok(())
    }
}

/// Validates the upstream payload. A missing `targets` array fails the whole
/// sync (the snapshot is unusable); an individual malformed object is skipped.
pub fn extract_targets(body: &serde_json::Value) -> anyhow::Result<Vec<SyncTarget>> {
    let items = body
        .get("targets")
        .and_then(|t| t.as_array())
        .context("upstream response has no 'targets' array")?;

    Ok(items
        .iter()
        .filter_map(|item| match serde_json::from_value::<SyncTarget>(item.clone()) {
            Ok(target) if target.id.is_empty() || target.host.is_empty() => {
                warn!(id = %target.id, "skipping target with empty mandatory field");
                None
            }
            Ok(target) => Some(target),
            Err(e) => {
                warn!(error = %e, "skipping malformed target object");
                None
            }
        })
        .collect())
}
