//! Proxy process supervisor.
//!
//! `run` renders the bootstrap, reads the admin port out of it, writes it to
//! a temp file and launches the proxy, then polls `/ready`. `cleanup` asks
//! for a graceful exit through `/quitquitquit`, waits up to three seconds in
//! total and kills the process if it is still alive. The temp file is
//! removed either way.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::scenario::Step;
use crate::{Error, Params, Result};

/// Bootstrap used by [`Envoy::client`] and [`Envoy::server`].
pub const DEFAULT_BOOTSTRAP: &str = include_str!("../templates/bootstrap.yaml.j2");

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
const QUIT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const READY_ATTEMPTS: usize = 50;
const READY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Custom,
    Client,
    Server,
}

#[derive(Debug, Deserialize)]
struct Bootstrap {
    admin: Admin,
}

#[derive(Debug, Deserialize)]
struct Admin {
    address: Address,
}

#[derive(Debug, Deserialize)]
struct Address {
    socket_address: SocketAddress,
}

#[derive(Debug, Deserialize)]
struct SocketAddress {
    port_value: u16,
}

/// Read the admin port out of a rendered bootstrap.
pub fn admin_port(bootstrap: &str) -> Result<u16> {
    let doc: Bootstrap =
        serde_yaml::from_str(bootstrap).map_err(|e| Error::parse("bootstrap admin section", e))?;
    Ok(doc.admin.address.socket_address.port_value)
}

/// Launch and supervise one proxy process.
#[derive(Debug)]
pub struct Envoy {
    bootstrap: String,
    role: Role,
    binary: Option<PathBuf>,
    concurrency: u32,
    hot_restart: bool,
    drain_time: Duration,
    ready_attempts: usize,
    child: Option<Child>,
    admin_port: Option<u16>,
    config: Option<NamedTempFile>,
}

impl Envoy {
    /// Proxy launched with a bootstrap template rendered against the params.
    pub fn new(bootstrap: impl Into<String>) -> Self {
        Self {
            bootstrap: bootstrap.into(),
            role: Role::Custom,
            binary: None,
            concurrency: 1,
            hot_restart: false,
            drain_time: Duration::from_secs(4),
            ready_attempts: READY_ATTEMPTS,
            child: None,
            admin_port: None,
            config: None,
        }
    }

    /// Client-side proxy: node `client`, admin on `ports.client_admin`,
    /// metadata from the `ClientMetadata` variable.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::new(DEFAULT_BOOTSTRAP)
        }
    }

    /// Server-side proxy: node `server`, admin on `ports.server_admin`,
    /// metadata from the `ServerMetadata` variable.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::new(DEFAULT_BOOTSTRAP)
        }
    }

    /// Run this binary instead of the configured one.
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary = Some(path.into());
        self
    }

    /// Worker thread count.
    pub fn concurrency(mut self, n: u32) -> Self {
        self.concurrency = n;
        self
    }

    /// Keep hot restart enabled.
    pub fn hot_restart(mut self, enabled: bool) -> Self {
        self.hot_restart = enabled;
        self
    }

    /// Number of `/ready` polls before giving up.
    pub fn ready_attempts(mut self, attempts: usize) -> Self {
        self.ready_attempts = attempts;
        self
    }

    /// Admin port of the running process.
    pub fn admin_port(&self) -> Option<u16> {
        self.admin_port
    }

    /// Process id of the running process.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Path of the rendered bootstrap while the process runs.
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_ref().map(NamedTempFile::path)
    }

    fn render(&self, params: &Params) -> Result<String> {
        let (node, admin_port, metadata) = match self.role {
            Role::Custom => return params.fill(&self.bootstrap),
            Role::Client => ("client", params.ports.client_admin, params.get("ClientMetadata")),
            Role::Server => ("server", params.ports.server_admin, params.get("ServerMetadata")),
        };
        params.fill_with(
            &self.bootstrap,
            minijinja::context! { node, admin_port, metadata },
        )
    }

    fn command(&self, binary: &Path, config: &Path, admin_port: u16) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg("-c")
            .arg(config)
            .arg("-l")
            .arg(DriverConfig::global().envoy_log_level())
            .arg("--concurrency")
            .arg(self.concurrency.to_string())
            .arg("--drain-time-s")
            .arg(self.drain_time.as_secs().to_string());
        if self.hot_restart {
            cmd.arg("--base-id").arg(admin_port.to_string());
        } else {
            cmd.arg("--disable-hot-restart");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    async fn wait_ready(&mut self, admin_port: u16) -> Result<()> {
        let url = format!("http://127.0.0.1:{admin_port}/ready");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .map_err(|e| Error::http(&url, e))?;

        for attempt in 0..self.ready_attempts {
            if let Some(child) = self.child.as_mut() {
                let exited = child
                    .try_wait()
                    .map_err(|e| Error::io("failed to poll envoy process", e))?;
                if let Some(status) = exited {
                    return Err(Error::Process(format!("exited before becoming ready: {status}")));
                }
            }

            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(admin_port, attempt, "envoy ready");
                    return Ok(());
                }
                Ok(resp) => debug!(status = %resp.status(), attempt, "envoy not ready"),
                Err(e) => debug!(error = %e, attempt, "envoy admin unreachable"),
            }
            tokio::time::sleep(READY_INTERVAL).await;
        }

        Err(Error::Process(format!(
            "{url} not ready after {} attempts",
            self.ready_attempts
        )))
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            self.config = None;
            return;
        };
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;

        if let Some(port) = self.admin_port {
            let url = format!("http://127.0.0.1:{port}/quitquitquit");
            let sent = match reqwest::Client::builder().timeout(QUIT_REQUEST_TIMEOUT).build() {
                Ok(client) => client.post(&url).send().await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(error = %e, "graceful shutdown request failed");
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "envoy exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for envoy"),
            Err(_) => {
                warn!("envoy did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill envoy");
                }
            }
        }

        self.admin_port = None;
        self.config = None;
    }
}

#[async_trait]
impl Step for Envoy {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let rendered = self.render(params)?;
        let admin_port = admin_port(&rendered)?;

        let mut config = tempfile::Builder::new()
            .prefix("envoy-bootstrap-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| Error::io("failed to create bootstrap file", e))?;
        config
            .write_all(rendered.as_bytes())
            .and_then(|()| config.flush())
            .map_err(|e| Error::io(format!("failed to write {}", config.path().display()), e))?;

        let binary = self
            .binary
            .clone()
            .unwrap_or_else(|| DriverConfig::global().envoy_path().to_path_buf());
        let child = self
            .command(&binary, config.path(), admin_port)
            .spawn()
            .map_err(|e| Error::io(format!("failed to launch {}", binary.display()), e))?;
        info!(pid = ?child.id(), admin_port, binary = %binary.display(), "envoy launched");

        self.child = Some(child);
        self.admin_port = Some(admin_port);
        self.config = Some(config);

        if let Err(err) = self.wait_ready(admin_port).await {
            self.stop().await;
            return Err(err);
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.stop().await;
    }
}
