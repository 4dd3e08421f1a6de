pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::escape::escape;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_native_tls::TlsStream;
use tracing::{debug, warn};

use crate::config::{AppConfig, GmpConfig, ProbeConfig, ScanConfig};

const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation timed out after {0}s")]
    Timeout(u64),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::Timeout(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub status: String,
    pub progress: i64,
}

/// The fixed operation set the orchestrator needs from a scan engine.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;
    async fn create_target(
        &self,
        name: &str,
        host: &str,
        ports: Option<&[u16]>,
    ) -> Result<String, EngineError>;
    async fn create_task(&self, name: &str, target_id: &str) -> Result<String, EngineError>;
    async fn start_task(&self, task_id: &str) -> Result<String, EngineError>;
    async fn get_task(&self, task_id: &str) -> Result<TaskStatus, EngineError>;
    async fn get_report(&self, report_id: &str) -> Result<String, EngineError>;
    async fn stop_task(&self, task_id: &str) -> Result<(), EngineError>;
    async fn delete_task(&self, task_id: &str) -> Result<(), EngineError>;
    async fn delete_target(&self, target_id: &str) -> Result<(), EngineError>;
}

#[derive(Clone)]
pub struct ProbeHandle {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub engine: Arc<dyn Engine>,
}

pub struct ProbeSet {
    probes: Vec<ProbeHandle>,
}

impl ProbeSet {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let probes = cfg
            .probes
            .iter()
            .map(|p| ProbeHandle {
                name: p.name.clone(),
                host: p.host.clone(),
                port: p.port,
                engine: Arc::new(GmpEngine::new(p.clone(), cfg.gmp.clone(), cfg.scan.clone()))
                    as Arc<dyn Engine>,
            })
            .collect();
        Self { probes }
    }

    pub fn new(probes: Vec<ProbeHandle>) -> Self {
        Self { probes }
    }

    pub fn get(&self, name: &str) -> Option<&ProbeHandle> {
        self.probes.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.probes.iter().map(|p| p.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbeHandle> {
        self.probes.iter()
    }
}

struct GmpSession {
    stream: TlsStream<TcpStream>,
}

impl GmpSession {
    async fn exchange(&mut self, command: &str, io_timeout: Duration) -> Result<String, EngineError> {
        timeout(io_timeout, self.stream.write_all(command.as_bytes()))
            .await
            .map_err(|_| EngineError::Timeout(io_timeout.as_secs()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = timeout(io_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| EngineError::Timeout(io_timeout.as_secs()))?
                .map_err(|e| EngineError::Unavailable(e.to_string()))?;
            if n == 0 {
                return Err(EngineError::Unavailable(
                    "connection closed mid-response".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > MAX_RESPONSE_BYTES {
                return Err(EngineError::Protocol("response exceeds size cap".to_string()));
            }
            if let Some(doc) = wire::complete_document(&buf) {
                return Ok(doc.to_string());
            }
        }
    }
}

/// GMP client for one probe. Holds at most one authenticated session,
/// reconnecting lazily after transport failures.
pub struct GmpEngine {
    probe: ProbeConfig,
    gmp: GmpConfig,
    scan: ScanConfig,
    session: Mutex<Option<GmpSession>>,
    // engine ids resolved from configured names; stable across reconnects
    resolved: Mutex<HashMap<String, String>>,
}

impl GmpEngine {
    pub fn new(probe: ProbeConfig, gmp: GmpConfig, scan: ScanConfig) -> Self {
        Self {
            probe,
            gmp,
            scan,
            session: Mutex::new(None),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.gmp.timeout)
    }

    async fn connect(&self) -> Result<GmpSession, EngineError> {
        let addr = format!("{}:{}", self.probe.host, self.probe.port);
        debug!(probe = %self.probe.name, %addr, "connecting to engine");
        let tcp = timeout(self.io_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| EngineError::Timeout(self.gmp.timeout))?
            .map_err(|e| EngineError::Unavailable(format!("connect {addr}: {e}")))?;

        // gvmd presents a self-signed certificate; the configured probe list
        // is the trust anchor here, not the certificate chain
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(tls);
        let stream = timeout(self.io_timeout(), connector.connect(&self.probe.host, tcp))
            .await
            .map_err(|_| EngineError::Timeout(self.gmp.timeout))?
            .map_err(|e| EngineError::Unavailable(format!("tls handshake: {e}")))?;

        let mut session = GmpSession { stream };
        let auth = format!(
            "<authenticate><credentials><username>{}</username><password>{}</password></credentials></authenticate>",
            escape(&self.probe.username),
            escape(&self.probe.password),
        );
        let response = session.exchange(&auth, self.io_timeout()).await?;
        let env = wire::envelope(&response)
            .ok_or_else(|| EngineError::Protocol("unparseable authenticate response".to_string()))?;
        if !env.ok() {
            return Err(EngineError::AuthFailed(env.describe()));
        }
        debug!(probe = %self.probe.name, "engine session authenticated");
        Ok(session)
    }

    /// One GMP round trip, reconnecting between attempts on transport errors.
    async fn command(&self, body: &str) -> Result<String, EngineError> {
        let mut guard = self.session.lock().await;
        let mut last = EngineError::Unavailable("no connection attempt made".to_string());
        for attempt in 1..=self.gmp.retry_attempts.max(1) {
            if attempt > 1 {
                sleep(Duration::from_secs(self.gmp.retry_delay)).await;
            }
            if guard.is_none() {
                match self.connect().await {
                    Ok(s) => *guard = Some(s),
                    Err(e @ EngineError::AuthFailed(_)) => return Err(e),
                    Err(e) => {
                        warn!(probe = %self.probe.name, attempt, error = %e, "engine connection failed");
                        last = e;
                        continue;
                    }
                }
            }
            let Some(session) = guard.as_mut() else {
                continue;
            };
            match session.exchange(body, self.io_timeout()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    warn!(probe = %self.probe.name, attempt, error = %e, "engine exchange failed");
                    *guard = None;
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn checked(&self, body: &str) -> Result<(String, wire::ResponseEnvelope), EngineError> {
        let response = self.command(body).await?;
        let env = wire::envelope(&response).ok_or_else(|| {
            EngineError::Protocol(format!("unparseable response to {}", command_name(body)))
        })?;
        if !env.ok() {
            return Err(EngineError::Protocol(format!(
                "{} rejected: {}",
                command_name(body),
                env.describe()
            )));
        }
        Ok((response, env))
    }

    async fn lookup(
        &self,
        command: &str,
        element: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        let (response, _) = self.checked(command).await?;
        Ok(wire::find_named_id(&response, element, name))
    }

    async fn resolve_id(
        &self,
        kind: &str,
        command: &str,
        element: &str,
        name: &str,
    ) -> Result<String, EngineError> {
        let key = format!("{kind}:{name}");
        if let Some(id) = self.resolved.lock().await.get(&key) {
            return Ok(id.clone());
        }
        let (response, _) = self.checked(command).await?;
        let id = wire::find_named_id(&response, element, name)
            .ok_or_else(|| EngineError::Protocol(format!("engine has no {kind} named '{name}'")))?;
        self.resolved.lock().await.insert(key, id.clone());
        Ok(id)
    }
}

#[async_trait]
impl Engine for GmpEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.checked("<get_version/>").await.map(|_| ())
    }

    async fn create_target(
        &self,
        name: &str,
        host: &str,
        ports: Option<&[u16]>,
    ) -> Result<String, EngineError> {
        let filter = format!("<get_targets filter=\"name={}\"/>", escape(name));
        if let Some(id) = self.lookup(&filter, "target", name).await? {
            debug!(probe = %self.probe.name, target_id = %id, "reusing existing engine target");
            return Ok(id);
        }
        let port_spec = match ports {
            Some(ports) => format!("<port_range>{}</port_range>", port_range(ports)),
            None => {
                let id = self
                    .resolve_id(
                        "port list",
                        "<get_port_lists/>",
                        "port_list",
                        &self.scan.default_port_list,
                    )
                    .await?;
                format!("<port_list id=\"{id}\"/>")
            }
        };
        let body = format!(
            "<create_target><name>{}</name><hosts>{}</hosts>{}</create_target>",
            escape(name),
            escape(host),
            port_spec
        );
        match self.checked(&body).await {
            Ok((_, env)) => env
                .id
                .ok_or_else(|| EngineError::Protocol("create_target returned no id".to_string())),
            Err(e) => {
                // a previous attempt may have created it right before dying
                if let Ok(Some(id)) = self.lookup(&filter, "target", name).await {
                    return Ok(id);
                }
                Err(e)
            }
        }
    }

    async fn create_task(&self, name: &str, target_id: &str) -> Result<String, EngineError> {
        let filter = format!("<get_tasks filter=\"name={}\"/>", escape(name));
        if let Some(id) = self.lookup(&filter, "task", name).await? {
            debug!(probe = %self.probe.name, task_id = %id, "reusing existing engine task");
            return Ok(id);
        }
        let config_id = self
            .resolve_id("scan config", "<get_configs/>", "config", &self.scan.gvm_scan_config)
            .await?;
        let scanner_id = self
            .resolve_id("scanner", "<get_scanners/>", "scanner", &self.scan.gvm_scanner)
            .await?;
        let body = format!(
            "<create_task><name>{}</name><config id=\"{}\"/><target id=\"{}\"/><scanner id=\"{}\"/></create_task>",
            escape(name),
            escape(config_id.as_str()),
            escape(target_id),
            escape(scanner_id.as_str()),
        );
        match self.checked(&body).await {
            Ok((_, env)) => env
                .id
                .ok_or_else(|| EngineError::Protocol("create_task returned no id".to_string())),
            Err(e) => {
                if let Ok(Some(id)) = self.lookup(&filter, "task", name).await {
                    return Ok(id);
                }
                Err(e)
            }
        }
    }

    async fn start_task(&self, task_id: &str) -> Result<String, EngineError> {
        let (response, _) = self
            .checked(&format!("<start_task task_id=\"{}\"/>", escape(task_id)))
            .await?;
        wire::first_child_text(&response, "report_id")
            .ok_or_else(|| EngineError::Protocol("start_task returned no report_id".to_string()))
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskStatus, EngineError> {
        let (response, _) = self
            .checked(&format!("<get_tasks task_id=\"{}\"/>", escape(task_id)))
            .await?;
        let status = wire::first_child_text(&response, "status")
            .ok_or_else(|| EngineError::Protocol(format!("no status for task {task_id}")))?;
        let progress = wire::first_child_text(&response, "progress")
            .and_then(|p| p.parse::<i64>().ok())
            .unwrap_or(0)
            .max(0);
        Ok(TaskStatus { status, progress })
    }

    async fn get_report(&self, report_id: &str) -> Result<String, EngineError> {
        let (response, _) = self
            .checked(&format!(
                "<get_reports report_id=\"{}\" details=\"1\" ignore_pagination=\"1\"/>",
                escape(report_id)
            ))
            .await?;
        wire::extract_element(&response, "report")
            .ok_or_else(|| EngineError::Protocol(format!("no report element for report {report_id}")))
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), EngineError> {
        self.checked(&format!("<stop_task task_id=\"{}\"/>", escape(task_id)))
            .await
            .map(|_| ())
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), EngineError> {
        self.checked(&format!("<delete_task task_id=\"{}\"/>", escape(task_id)))
            .await
            .map(|_| ())
    }

    async fn delete_target(&self, target_id: &str) -> Result<(), EngineError> {
        self.checked(&format!("<delete_target target_id=\"{}\"/>", escape(target_id)))
            .await
            .map(|_| ())
    }
}

fn port_range(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| format!("T:{p}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn command_name(body: &str) -> &str {
    body.trim_start_matches('<')
        .split(|c: char| c == ' ' || c == '>' || c == '/')
        .next()
        .unwrap_or("command")
}
