//! Server TLS from PEM fixtures.

use std::path::{Path, PathBuf};

use tonic::transport::{Identity, ServerTlsConfig};

use crate::{FakeError, Result};

/// Certificate chain and key for a fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM certificate chain.
    pub cert_chain: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

impl TlsFiles {
    /// The standard fixture layout under `dir`: `cert-chain.pem` and `key.pem`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert_chain: dir.join("cert-chain.pem"),
            key: dir.join("key.pem"),
        }
    }

    /// Build a tonic server TLS config.
    pub fn server_config(&self) -> Result<ServerTlsConfig> {
        let cert = read(&self.cert_chain)?;
        let key = read(&self.key)?;
        Ok(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| FakeError::TlsFixture {
        path: path.to_path_buf(),
        source,
    })
}
