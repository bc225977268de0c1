//! On-disk certificate layout under the etcd home.

use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use plinth_pki::{CaMaterial, CertPair, CertRequest, Signer, ETCD_PEER_CA, ETCD_SERVER_CA};
use tracing::{debug, info};

use crate::error::Result;

const FILES: [&str; 10] = [
    "server.crt",
    "server.key",
    "server-ca.crt",
    "server-ca.key",
    "client.crt",
    "client.key",
    "peer.crt",
    "peer.key",
    "peer-ca.crt",
    "peer-ca.key",
];

/// `<home>/cert/{server,client,peer}.{crt,key}` plus CA copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertLayout {
    home: PathBuf,
}

impl CertLayout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn dir(&self) -> PathBuf {
        self.home.join("cert")
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir().join(name)
    }

    pub fn server_ca(&self) -> PathBuf {
        self.file("server-ca.crt")
    }

    pub fn client_cert(&self) -> PathBuf {
        self.file("client.crt")
    }

    pub fn client_key(&self) -> PathBuf {
        self.file("client.key")
    }

    /// True when every certificate file is already on disk.
    pub async fn is_complete(&self) -> bool {
        for name in FILES {
            match tokio::fs::try_exists(self.file(name)).await {
                Ok(true) => {}
                _ => return false,
            }
        }
        true
    }

    /// Reuse the certificates on disk, or sign and write a fresh set.
    pub async fn load_or_sign(
        &self,
        cas: &CaMaterial,
        signer: &dyn Signer,
        node_id: &str,
        ip: IpAddr,
    ) -> Result<()> {
        if self.is_complete().await {
            debug!(dir = %self.dir().display(), "reusing etcd certificates");
            return Ok(());
        }

        let peer_ca = cas.require(ETCD_PEER_CA)?;
        let server_ca = cas.require(ETCD_SERVER_CA)?;

        let peer = signer.sign(peer_ca, &CertRequest::etcd(node_id, &[ip]))?;
        let server = signer.sign(server_ca, &CertRequest::etcd(node_id, &[ip]))?;
        let client = signer.sign(
            server_ca,
            &CertRequest::client(&format!("etcd-client-{}", node_id), &["plinth"]),
        )?;

        tokio::fs::create_dir_all(self.dir()).await?;
        self.write_pair("server", &server).await?;
        self.write_pair("server-ca", server_ca).await?;
        self.write_pair("client", &client).await?;
        self.write_pair("peer", &peer).await?;
        self.write_pair("peer-ca", peer_ca).await?;

        info!(dir = %self.dir().display(), node = %node_id, "signed etcd certificates");
        Ok(())
    }

    async fn write_pair(&self, stem: &str, pair: &CertPair) -> Result<()> {
        let cert = self.file(&format!("{}.crt", stem));
        let key = self.file(&format!("{}.key", stem));
        tokio::fs::write(&cert, pair.cert_pem.as_bytes()).await?;
        tokio::fs::write(&key, pair.key_pem.as_bytes()).await?;
        tokio::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(())
    }
}
