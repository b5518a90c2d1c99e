//! Shared lifecycle for fake servers.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{FakeError, Result};

const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Bind a loopback listener, reporting the fake and port on failure.
pub async fn bind(name: &'static str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|source| FakeError::Bind { name, port, source })
}

/// A running fake server.
///
/// The listener is bound before the serving task starts, so a handle only
/// exists once the port accepts connections. Dropping the handle requests
/// shutdown without waiting for it.
#[derive(Debug)]
pub struct FakeServer {
    name: &'static str,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FakeServer {
    /// Spawn `serve` on an already-bound listener.
    ///
    /// `serve` receives the listener and a future that resolves when
    /// shutdown is requested.
    pub fn spawn<F, Fut, E>(name: &'static str, listener: TcpListener, serve: F) -> Result<Self>
    where
        F: FnOnce(TcpListener, ShutdownSignal) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let addr = listener.local_addr().map_err(|source| FakeError::Bind {
            name,
            port: 0,
            source,
        })?;
        let (tx, rx) = oneshot::channel();
        let serving = serve(listener, ShutdownSignal(rx));

        let task = tokio::spawn(async move {
            match serving.await {
                Ok(()) => debug!(server = name, "fake server exited"),
                Err(e) => error!(server = name, error = %e, "fake server failed"),
            }
        });

        info!(server = name, addr = %addr, "fake server listening");
        Ok(Self {
            name,
            addr,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Request shutdown and wait for the serving task, aborting it if it
    /// lingers.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!(server = self.name, "fake server did not stop in time, aborting");
            task.abort();
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Resolves once the owning [`FakeServer`] is stopped or dropped.
#[derive(Debug)]
pub struct ShutdownSignal(oneshot::Receiver<()>);

impl ShutdownSignal {
    /// Wait for shutdown.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_resolves_shutdown_signal() {
        let listener = bind("probe", 0).await.unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        let mut server = FakeServer::spawn("probe", listener, |_listener, shutdown| async move {
            shutdown.wait().await;
            let _ = done_tx.send(());
            Ok::<(), std::io::Error>(())
        })
        .unwrap();

        assert_ne!(server.port(), 0);
        server.stop().await;
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn bind_conflict_reports_port() {
        let first = bind("probe", 0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind("probe", port).await.unwrap_err();
        assert!(matches!(err, FakeError::Bind { port: p, .. } if p == port));
    }
}
