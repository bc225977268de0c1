//! Certificate material for plinth nodes.
//!
//! The control plane hands every node a map of CA key pairs in its
//! bootstrap request. Nodes sign their own leaf certificates (etcd peer and
//! server certs, the admin client cert) from that map through a [`Signer`],
//! and create CSRs for the bootstrap exchange with [`generate_csr`].

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Kubernetes root CA.
pub const ROOT_CA: &str = "root";
/// CA for etcd peer traffic.
pub const ETCD_PEER_CA: &str = "etcd-peer";
/// CA for etcd client traffic.
pub const ETCD_SERVER_CA: &str = "etcd-server";
/// CA for the aggregation layer.
pub const FRONT_PROXY_CA: &str = "front-proxy";
/// Service account signing key pair.
pub const SERVICE_ACCOUNT: &str = "svc";

/// Validity for leaf certificates signed on the node.
pub const LEAF_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Error)]
pub enum PkiError {
    /// The request does not carry the named CA.
    #[error("missing CA [{0}] in bootstrap request")]
    MissingCa(String),

    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate signing failed: {0}")]
    Signing(String),

    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// A PEM encoded private key and certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPair {
    #[serde(rename = "key")]
    pub key_pem: String,
    #[serde(rename = "cert")]
    pub cert_pem: String,
}

impl CertPair {
    pub fn new(key_pem: impl Into<String>, cert_pem: impl Into<String>) -> Self {
        Self {
            key_pem: key_pem.into(),
            cert_pem: cert_pem.into(),
        }
    }
}

/// CA key pairs keyed by purpose (`root`, `etcd-peer`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaMaterial(BTreeMap<String, CertPair>);

impl CaMaterial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, pair: CertPair) {
        self.0.insert(name.into(), pair);
    }

    pub fn get(&self, name: &str) -> Option<&CertPair> {
        self.0.get(name)
    }

    /// Look up a CA that must be present.
    pub fn require(&self, name: &str) -> Result<&CertPair> {
        self.0
            .get(name)
            .ok_or_else(|| PkiError::MissingCa(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a leaf certificate should say about its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRequest {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub ips: Vec<IpAddr>,
    pub dns_names: Vec<String>,
    pub server_auth: bool,
    pub client_auth: bool,
}

impl CertRequest {
    /// Certificate for an etcd member, valid for both peer and client use.
    pub fn etcd(node_id: &str, ips: &[IpAddr]) -> Self {
        let mut all_ips = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        all_ips.extend(ips.iter().copied().filter(|ip| !ip.is_loopback()));
        Self {
            common_name: format!("etcd-{}.member", node_id),
            organizations: vec!["plinth".to_string()],
            ips: all_ips,
            dns_names: vec![
                "localhost".to_string(),
                format!("etcd-{}.local", node_id),
                format!("etcd-{}.member", node_id),
            ],
            server_auth: true,
            client_auth: true,
        }
    }

    /// Client-only certificate, e.g. `kubernetes-admin` in `system:masters`.
    pub fn client(common_name: &str, organizations: &[&str]) -> Self {
        Self {
            common_name: common_name.to_string(),
            organizations: organizations.iter().map(|o| o.to_string()).collect(),
            ips: Vec::new(),
            dns_names: Vec::new(),
            server_auth: false,
            client_auth: true,
        }
    }

    fn params(&self) -> Result<CertificateParams> {
        if self.common_name.is_empty() {
            return Err(PkiError::InvalidRequest(
                "a common name is required".to_string(),
            ));
        }
        if !self.server_auth && !self.client_auth {
            return Err(PkiError::InvalidRequest(
                "at least one extended key usage is required".to_string(),
            ));
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&self.common_name, &self.organizations);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = Vec::new();
        if self.server_auth {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ServerAuth);
        }
        if self.client_auth {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ClientAuth);
        }

        let mut sans = Vec::with_capacity(self.ips.len() + self.dns_names.len());
        for name in &self.dns_names {
            let dns = Ia5String::try_from(name.clone()).map_err(|e| {
                PkiError::InvalidRequest(format!("invalid DNS name '{}': {}", name, e))
            })?;
            sans.push(SanType::DnsName(dns));
        }
        sans.extend(self.ips.iter().map(|ip| SanType::IpAddress(*ip)));
        params.subject_alt_names = sans;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
        Ok(params)
    }
}

/// Signs leaf certificates with a CA key pair.
pub trait Signer: Send + Sync {
    fn sign(&self, ca: &CertPair, request: &CertRequest) -> Result<CertPair>;
}

/// [`Signer`] backed by rcgen. A fresh key pair is generated per certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenSigner;

impl Signer for RcgenSigner {
    fn sign(&self, ca: &CertPair, request: &CertRequest) -> Result<CertPair> {
        let params = request.params()?;

        let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(|e| PkiError::Parse {
            what: "CA key",
            reason: e.to_string(),
        })?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key).map_err(|e| {
            PkiError::Parse {
                what: "CA certificate",
                reason: e.to_string(),
            }
        })?;

        let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        debug!(cn = %request.common_name, "signed leaf certificate");
        Ok(CertPair::new(key.serialize_pem(), cert.pem()))
    }
}

/// Create a self-signed CA. Used for local clusters and tests.
pub fn self_signed_ca(common_name: &str) -> Result<CertPair> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, &["plinth".to_string()]);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

    let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| PkiError::Signing(e.to_string()))?;
    Ok(CertPair::new(key.serialize_pem(), cert.pem()))
}

/// A freshly generated key and the CSR built from it.
#[derive(Debug, Clone)]
pub struct CsrMaterial {
    pub key_pem: String,
    pub csr_pem: String,
    /// DER encoded public key, input for request naming.
    pub public_key_der: Vec<u8>,
}

/// Generate an ECDSA P-256 key and a CSR for `common_name` in `organizations`.
pub fn generate_csr(common_name: &str, organizations: &[String]) -> Result<CsrMaterial> {
    if common_name.is_empty() {
        return Err(PkiError::InvalidRequest(
            "a common name is required".to_string(),
        ));
    }
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, organizations);

    let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
    let csr = params
        .serialize_request(&key)
        .map_err(|e| PkiError::Signing(e.to_string()))?;
    let csr_pem = csr.pem().map_err(|e| PkiError::Signing(e.to_string()))?;

    Ok(CsrMaterial {
        key_pem: key.serialize_pem(),
        csr_pem,
        public_key_der: key.subject_public_key_info(),
    })
}

fn distinguished_name(common_name: &str, organizations: &[String]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    for org in organizations.iter().filter(|o| !o.is_empty()) {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    dn
}
