//! Secure Token Service step.

use async_trait::async_trait;
use e2e_fakes::FakeServer;

use crate::scenario::Step;
use crate::{Params, Result};

/// Run the token exchange emulator on `ports.sts`.
///
/// Only the exact token request the proxy is configured to send gets a
/// token. Anything else is answered with an empty 200 and logged.
#[derive(Debug, Default)]
pub struct SecureTokenService {
    port: Option<u16>,
    sts: e2e_fakes::SecureTokenService,
    server: Option<FakeServer>,
}

impl SecureTokenService {
    /// Emulator on `ports.sts`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `port` instead.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Number of tokens handed out so far.
    pub fn issued(&self) -> usize {
        self.sts.issued()
    }
}

#[async_trait]
impl Step for SecureTokenService {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let port = self.port.unwrap_or(params.ports.sts);
        self.server = Some(self.sts.start(port).await?);
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
    }
}
