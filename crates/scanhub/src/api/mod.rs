use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::manager::{SubmitError, SubmitScan};
use crate::models::ScanType;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scans", post(create_scan).get(list_scans))
        .route("/scans/:scan_id", get(get_scan))
        .route("/scans/:scan_id/report", get(get_scan_report))
        .route("/probes", get(list_probes))
        .route("/targets", get(list_targets))
        .route("/targets/:external_id", get(get_target))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    target: String,
    #[serde(default)]
    scan_type: ScanType,
    #[serde(default)]
    ports: Option<Vec<u16>>,
    #[serde(default)]
    probe_name: Option<String>,
}

pub async fn create_scan(
    State(state): State<AppState>,
    Json(req): Json<CreateScanRequest>,
) -> Response {
    let request = SubmitScan {
        target: req.target,
        scan_type: req.scan_type,
        ports: req.ports,
        probe_name: req.probe_name,
        external_target_id: None,
    };
    match state.manager.submit(request).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(json!({
                "scan_id": record.scan_id,
                "probe_name": record.probe_name,
                "message": "Scan submitted",
            })),
        )
            .into_response(),
        Err(e @ (SubmitError::Invalid(_) | SubmitError::ProbeNotFound(_))) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"detail": e.to_string()})),
        )
            .into_response(),
        Err(SubmitError::Store(e)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn list_scans(State(state): State<AppState>) -> Response {
    match state.store.list_scans().await {
        Ok(scans) => {
            // report blobs are served by the per-scan report endpoint only
            let scans: Vec<_> = scans
                .iter()
                .map(|s| {
                    json!({
                        "scan_id": s.scan_id,
                        "probe_name": s.probe_name,
                        "target": s.target,
                        "scan_type": s.scan_type,
                        "gvm_status": s.gvm_status,
                        "gvm_progress": s.gvm_progress,
                        "created_at": s.created_at,
                        "started_at": s.started_at,
                        "completed_at": s.completed_at,
                        "error": s.error,
                        "external_target_id": s.external_target_id,
                    })
                })
                .collect();
            Json(json!({"total": scans.len(), "scans": scans})).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn get_scan(State(state): State<AppState>, Path(scan_id): Path<String>) -> Response {
    match state.store.get_scan(&scan_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Scan not found"})),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn get_scan_report(
    State(state): State<AppState>,
    Path(scan_id): Path<String>,
) -> Response {
    let record = match state.store.get_scan(&scan_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"detail": "Scan not found"})),
            )
                .into_response()
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    if record.report_xml.is_none() {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "detail": format!("Report not available yet. Current status: {}", record.gvm_status)
            })),
        )
            .into_response();
    }
    Json(json!({
        "scan_id": record.scan_id,
        "probe_name": record.probe_name,
        "gvm_status": record.gvm_status,
        "target": record.target,
        "completed_at": record.completed_at,
        "report_xml": record.report_xml,
        "summary": record.summary,
        "error": record.error,
    }))
    .into_response()
}

pub async fn list_probes(State(state): State<AppState>) -> Response {
    let counts = match state.store.active_counts().await {
        Ok(counts) => counts,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let probes: Vec<_> = state
        .probes
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "host": p.host,
                "port": p.port,
                "active_scans": counts.get(&p.name).copied().unwrap_or(0),
            })
        })
        .collect();
    Json(json!({"probes": probes})).into_response()
}

pub async fn list_targets(State(state): State<AppState>) -> Response {
    match state.store.list_targets().await {
        Ok(targets) => Json(json!({"total": targets.len(), "targets": targets})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn get_target(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Response {
    match state.store.get_target(&external_id).await {
        Ok(Some(target)) => Json(target).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Target not found"})),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// The one endpoint that touches engines at request time.
pub async fn health(State(state): State<AppState>) -> Response {
    let mut probes = serde_json::Map::new();
    let mut healthy = true;
    for probe in state.probes.iter() {
        match probe.engine.ping().await {
            Ok(()) => {
                probes.insert(probe.name.clone(), json!("connected"));
            }
            Err(e) => {
                healthy = false;
                probes.insert(probe.name.clone(), json!(e.to_string()));
            }
        }
    }
    if healthy {
        Json(json!({"status": "healthy", "probes": probes})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": {"status": "degraded", "probes": probes}})),
        )
            .into_response()
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::router;
    use crate::gmp::testing::FakeEngine;
    use crate::manager::testing::{fast_config, manager_with, probe_set};
    use crate::metrics::Metrics;
    use crate::models::{gvm_status, Criticality, ScanType, SyncTarget};
    use crate::AppState;

    async fn app_with(
        engines: &[(&str, Arc<FakeEngine>)],
    ) -> (axum::Router, crate::db::Store, tempfile::TempDir) {
        app_with_config(fast_config(), engines).await
    }

    async fn app_with_config(
        cfg: crate::config::AppConfig,
        engines: &[(&str, Arc<FakeEngine>)],
    ) -> (axum::Router, crate::db::Store, tempfile::TempDir) {
        let (manager, store, dir) = manager_with(cfg, engines).await;
        let state = AppState {
            store: store.clone(),
            manager,
            probes: probe_set(engines),
            metrics: Arc::new(Metrics::new()),
        };
        (router(state), store, dir)
    }

    // workers polling a never-terminal engine should idle between polls
    fn slow_poll_config() -> crate::config::AppConfig {
        let mut cfg = fast_config();
        cfg.scan.poll_interval = 1;
        cfg
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_scan(body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/scans")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn directed_scan_without_ports_is_rejected() {
        let engine = Arc::new(FakeEngine::done("<report/>"));
        let (app, _store, _dir) = app_with(&[("gvm-1", engine)]).await;

        let response = app
            .clone()
            .oneshot(post_scan(&serde_json::json!({
                "target": "10.0.0.5",
                "scan_type": "directed"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app
            .oneshot(post_scan(&serde_json::json!({
                "target": "10.0.0.5",
                "scan_type": "directed",
                "ports": [22, 80, 443]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["probe_name"], "gvm-1");
        assert!(body["scan_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn submitted_scan_reads_back_with_its_fields() {
        // a scan that never finishes keeps /report at 409
        let engine = Arc::new(FakeEngine::finishing_with(gvm_status::RUNNING, ""));
        let (app, _store, _dir) = app_with_config(slow_poll_config(), &[("gvm-1", engine)]).await;

        let response = app
            .clone()
            .oneshot(post_scan(&serde_json::json!({"target": "192.168.15.20"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let scan_id = created["scan_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(get(&format!("/scans/{scan_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let scan = body_json(response).await;
        assert_eq!(scan["target"], "192.168.15.20");
        assert_eq!(scan["scan_type"], "full");
        assert_eq!(scan["probe_name"], "gvm-1");

        let response = app
            .clone()
            .oneshot(get(&format!("/scans/{scan_id}/report")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.oneshot(get("/scans/no-such-scan")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn probes_report_live_active_counts() {
        let engine = Arc::new(FakeEngine::finishing_with(gvm_status::RUNNING, ""));
        let (app, _store, _dir) = app_with_config(slow_poll_config(), &[("gvm-1", engine)]).await;

        let response = app
            .clone()
            .oneshot(post_scan(&serde_json::json!({"target": "10.0.0.5"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.oneshot(get("/probes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["probes"][0]["name"], "gvm-1");
        assert_eq!(body["probes"][0]["active_scans"], 1);
    }

    #[tokio::test]
    async fn health_degrades_when_any_probe_is_down() {
        let up = Arc::new(FakeEngine::done(""));
        let down = Arc::new(FakeEngine::unreachable());
        let (app, _store, _dir) = app_with(&[("gvm-1", up), ("gvm-2", down)]).await;

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["detail"]["status"], "degraded");
        assert_eq!(body["detail"]["probes"]["gvm-1"], "connected");
        assert!(body["detail"]["probes"]["gvm-2"]
            .as_str()
            .unwrap()
            .contains("unavailable"));
    }

    #[tokio::test]
    async fn health_reports_all_probes_connected() {
        let engine = Arc::new(FakeEngine::done(""));
        let (app, _store, _dir) = app_with(&[("gvm-1", engine)]).await;

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["probes"]["gvm-1"], "connected");
    }

    #[tokio::test]
    async fn targets_endpoints_read_the_synced_table() {
        let engine = Arc::new(FakeEngine::done(""));
        let (app, store, _dir) = app_with(&[("gvm-1", engine)]).await;
        store
            .apply_sync(&[SyncTarget {
                id: "asset-001".to_string(),
                host: "10.0.0.1".to_string(),
                ports: None,
                scan_type: ScanType::Full,
                criticality: Criticality::High,
                scan_frequency_hours: 24,
                enabled: true,
                tags: None,
            }])
            .await
            .unwrap();

        let response = app.clone().oneshot(get("/targets")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["targets"][0]["external_id"], "asset-001");
        assert_eq!(body["targets"][0]["criticality"], "high");

        let response = app
            .clone()
            .oneshot(get("/targets/asset-001"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/targets/asset-999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let engine = Arc::new(FakeEngine::done(""));
        let (app, _store, _dir) = app_with(&[("gvm-1", engine)]).await;

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("scanhub_scans_active"));
    }
}
