//! TCP echo backend and the matching client step.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use e2e_fakes::serve::{self, FakeServer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::scenario::Step;
use crate::{Error, Params, Result};

/// Prefix the echo server puts in front of every line.
pub const TCP_PREFIX: &str = "hello ";

const PROBE_ATTEMPTS: usize = 10;
const PROBE_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Send one line and read one line back.
async fn round_trip(port: u16, line: &str, timeout: Duration) -> Result<String> {
    let exchange = async {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        stream.write_all(format!("{line}\n").as_bytes()).await?;
        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(reply)) => Ok(reply.trim_end_matches(['\r', '\n']).to_string()),
        Ok(Err(e)) => Err(Error::Tcp {
            port,
            message: e.to_string(),
        }),
        Err(_) => Err(Error::Tcp {
            port,
            message: format!("no reply within {timeout:?}"),
        }),
    }
}

async fn echo_lines(stream: TcpStream, prefix: String) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        write
            .write_all(format!("{prefix}{line}\n").as_bytes())
            .await?;
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    prefix: String,
    shutdown: serve::ShutdownSignal,
) -> std::io::Result<()> {
    let shutdown = shutdown.wait();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "tcp backend accepted connection");
                    let prefix = prefix.clone();
                    tokio::spawn(async move {
                        if let Err(e) = echo_lines(stream, prefix).await {
                            debug!(%peer, error = %e, "tcp echo connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "tcp backend accept failed"),
            },
        }
    }
}

/// Line echo server that prefixes every reply.
///
/// `run` returns only after a `ping` round trip succeeds.
#[derive(Debug)]
pub struct TcpServer {
    port: Option<u16>,
    prefix: String,
    server: Option<FakeServer>,
}

impl Default for TcpServer {
    fn default() -> Self {
        Self {
            port: None,
            prefix: TCP_PREFIX.to_string(),
            server: None,
        }
    }
}

impl TcpServer {
    /// Echo server on `ports.tcp_backend` with the default prefix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `port` instead.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Reply prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn probe(&self, port: u16) -> Result<()> {
        let want = format!("{}ping", self.prefix);
        let mut last = None;
        for attempt in 0..PROBE_ATTEMPTS {
            match round_trip(port, "ping", PROBE_INTERVAL).await {
                Ok(reply) if reply == want => {
                    info!(port, attempt, "tcp backend ready");
                    return Ok(());
                }
                Ok(reply) => {
                    last = Some(Error::Tcp {
                        port,
                        message: format!("unexpected probe reply {reply:?}"),
                    })
                }
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
        Err(last.unwrap_or_else(|| Error::Tcp {
            port,
            message: "probe never ran".into(),
        }))
    }
}

#[async_trait]
impl Step for TcpServer {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let port = self.port.unwrap_or(params.ports.tcp_backend);
        let listener = serve::bind("tcp backend", port).await?;
        let prefix = self.prefix.clone();
        let mut server = FakeServer::spawn("tcp backend", listener, move |listener, shutdown| {
            accept_loop(listener, prefix, shutdown)
        })?;

        if let Err(err) = self.probe(server.port()).await {
            server.stop().await;
            return Err(err);
        }
        self.server = Some(server);
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
    }
}

/// Send a line through a TCP port and require the prefixed echo.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    port: Option<u16>,
    message: String,
    prefix: String,
    timeout: Duration,
}

impl TcpConnection {
    /// Send `message` to `ports.client`. The message is rendered against
    /// the params first.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            port: None,
            message: message.into(),
            prefix: TCP_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Connect to `port` instead.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Expected reply prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Give up after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Step for TcpConnection {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let port = self.port.unwrap_or(params.ports.client);
        let message = params.fill(&self.message)?;
        let want = format!("{}{message}", self.prefix);
        let reply = round_trip(port, &message, self.timeout).await?;
        if reply != want {
            return Err(Error::Tcp {
                port,
                message: format!("got {reply:?}, want {want:?}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_with_prefix() {
        let mut params = Params::new(52);
        let mut server = TcpServer::new();
        server.run(&mut params).await.unwrap();

        let backend = params.ports.tcp_backend;
        TcpConnection::new("world {{ n }}")
            .port(backend)
            .run(&mut params)
            .await
            .unwrap();

        let err = TcpConnection::new("world")
            .port(backend)
            .prefix("bye ")
            .run(&mut params)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hello world"), "{err}");

        server.cleanup().await;
        let err = TcpConnection::new("world")
            .port(backend)
            .run(&mut params)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tcp { port, .. } if port == backend));
    }

    #[tokio::test]
    async fn custom_prefix_and_multiple_lines() {
        let mut params = Params::new(53);
        let mut server = TcpServer::new().prefix("> ");
        server.run(&mut params).await.unwrap();

        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, params.ports.tcp_backend))
            .await
            .unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"one\ntwo\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "> one");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "> two");

        server.cleanup().await;
    }
}
