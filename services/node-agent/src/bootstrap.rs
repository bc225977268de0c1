//! Bootstrap CSR exchange.
//!
//! A joining node only knows the apiserver address and a bootstrap token.
//! It trades them for a client certificate through the certificates API,
//! then uses that identity to fetch the cluster's bootstrap request.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha512_256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::kubeconfig::{Credentials, Kubeconfig};
use crate::layout::write_file;
use crate::request::BootstrapRequest;

const CSR_PATH: &str = "/apis/certificates.k8s.io/v1/certificatesigningrequests";
const REQUEST_PATH: &str = "/apis/plinth.dev/v1/requests";

pub const CSR_NAME_PREFIX: &str = "plinth-csr";
pub const SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";
pub const ORGANIZATION: &str = "system:plinth";
pub const USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("certificate signing request {name} was denied: {reason}")]
    Denied { name: String, reason: String },

    #[error("certificate signing request {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("certificate signing request {name} not issued after {after:?}")]
    NotIssued { name: String, after: Duration },
}

/// Timing for the exchange.
#[derive(Debug, Clone)]
pub struct BootstrapPolicy {
    pub health_interval: Duration,
    /// Jitter fraction added to each health probe pause.
    pub health_jitter: f64,
    pub health_deadline: Duration,
    pub poll_interval: Duration,
    pub issue_deadline: Duration,
}

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(2),
            health_jitter: 0.2,
            health_deadline: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            issue_deadline: Duration::from_secs(3600),
        }
    }
}

/// Client key and the certificate issued for it.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub key_pem: String,
    pub cert_pem: String,
}

#[derive(Debug, Deserialize)]
struct CsrObject {
    #[serde(default)]
    status: CsrStatus,
}

#[derive(Debug, Default, Deserialize)]
struct CsrStatus {
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    conditions: Vec<CsrCondition>,
}

#[derive(Debug, Deserialize)]
struct CsrCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RequestObject {
    spec: BootstrapRequest,
}

/// Talks to the apiserver with a bootstrap token.
pub struct BootstrapClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    policy: BootstrapPolicy,
}

impl BootstrapClient {
    /// `apiserver` is `host:port` or a full URL.
    pub fn new(apiserver: &str, token: &str, policy: BootstrapPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            // The bootstrap kubeconfig has no CA yet.
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url(apiserver),
            token: token.to_string(),
            policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Poll `/healthz` until the apiserver answers.
    pub async fn wait_for_server(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let started = Instant::now();
        loop {
            match self.http.get(&url).bearer_auth(&self.token).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(url = %url, "apiserver is healthy");
                    return Ok(());
                }
                Ok(resp) => debug!(status = %resp.status(), "apiserver not ready"),
                Err(e) => debug!(error = %e, "apiserver not reachable"),
            }

            let pause = jittered(self.policy.health_interval, self.policy.health_jitter);
            if started.elapsed() + pause > self.policy.health_deadline {
                bail!(
                    "apiserver {} not healthy after {:?}",
                    self.base_url,
                    self.policy.health_deadline
                );
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Create (or reuse) a CSR for `node_name` and wait until it is issued.
    pub async fn request_certificate(&self, node_name: &str) -> Result<IssuedCredentials> {
        let common_name = format!("{}:{}", ORGANIZATION, node_name);
        let organizations = vec![ORGANIZATION.to_string()];
        let material = plinth_pki::generate_csr(&common_name, &organizations)?;
        let name = digested_name(
            CSR_NAME_PREFIX,
            &material.public_key_der,
            &common_name,
            &organizations,
            &USAGES,
        );

        let body = json!({
            "apiVersion": "certificates.k8s.io/v1",
            "kind": "CertificateSigningRequest",
            "metadata": { "name": name },
            "spec": {
                "request": STANDARD.encode(&material.csr_pem),
                "signerName": SIGNER_NAME,
                "usages": USAGES,
            },
        });

        let url = format!("{}{}", self.base_url, CSR_PATH);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to create CSR {}", name))?;
        match resp.status() {
            s if s.is_success() => info!(csr = %name, cn = %common_name, "created CSR"),
            StatusCode::CONFLICT => info!(csr = %name, "CSR already exists, waiting for it"),
            status => {
                let text = resp.text().await.unwrap_or_default();
                bail!("failed to create CSR {}: {} - {}", name, status, text);
            }
        }

        let cert_pem = self.wait_issued(&name).await?;
        Ok(IssuedCredentials {
            key_pem: material.key_pem,
            cert_pem,
        })
    }

    async fn wait_issued(&self, name: &str) -> Result<String> {
        let url = format!("{}{}/{}", self.base_url, CSR_PATH, name);
        let started = Instant::now();
        loop {
            let resp = self.http.get(&url).bearer_auth(&self.token).send().await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    let csr: CsrObject = resp
                        .json()
                        .await
                        .with_context(|| format!("failed to decode CSR {}", name))?;
                    if let Some(cert) = issued(name, csr.status)? {
                        info!(csr = %name, "certificate issued");
                        return Ok(cert);
                    }
                }
                Ok(resp) => warn!(csr = %name, status = %resp.status(), "failed to read CSR"),
                Err(e) => warn!(csr = %name, error = %e, "failed to read CSR"),
            }

            if started.elapsed() + self.policy.poll_interval > self.policy.issue_deadline {
                return Err(CsrError::NotIssued {
                    name: name.to_string(),
                    after: self.policy.issue_deadline,
                }
                .into());
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    /// Fetch the cluster's bootstrap request using the issued identity.
    pub async fn fetch_request(
        &self,
        credentials: &IssuedCredentials,
        cluster: &str,
    ) -> Result<BootstrapRequest> {
        let identity = reqwest::Identity::from_pem(
            format!("{}\n{}", credentials.cert_pem, credentials.key_pem).as_bytes(),
        )
        .context("failed to load issued client certificate")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .identity(identity)
            .build()
            .context("failed to build HTTP client")?;

        let url = format!("{}{}/{}", self.base_url, REQUEST_PATH, cluster);
        let resp = http.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("failed to fetch bootstrap request: {} - {}", status, body);
        }
        let object: RequestObject = resp
            .json()
            .await
            .context("failed to decode bootstrap request")?;
        Ok(object.spec)
    }

    /// Full exchange: wait for the apiserver, obtain credentials, write the
    /// node kubeconfig to `kubeconfig_path`, and fetch the request.
    pub async fn bootstrap(
        &self,
        node_name: &str,
        cluster: &str,
        kubeconfig_path: &Path,
    ) -> Result<BootstrapRequest> {
        self.wait_for_server().await?;
        let credentials = self.request_certificate(node_name).await?;

        let kubeconfig = Kubeconfig::new(
            self.base_url.clone(),
            None,
            Credentials::Certificate {
                cert_pem: credentials.cert_pem.clone(),
                key_pem: credentials.key_pem.clone(),
            },
        );
        write_file(kubeconfig_path, kubeconfig.render(), 0o600)
            .await
            .with_context(|| format!("failed to write {}", kubeconfig_path.display()))?;

        self.fetch_request(&credentials, cluster).await
    }
}

fn base_url(apiserver: &str) -> String {
    let trimmed = apiserver.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

fn jittered(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let extra = rand::rng().random_range(0.0..=jitter.min(1.0));
    interval.mul_f64(1.0 + extra)
}

/// Issued certificate as PEM, `None` while pending.
fn issued(name: &str, status: CsrStatus) -> Result<Option<String>> {
    for condition in &status.conditions {
        let reason = if condition.message.is_empty() {
            condition.reason.clone()
        } else {
            format!("{}: {}", condition.reason, condition.message)
        };
        match condition.kind.as_str() {
            "Denied" => {
                return Err(CsrError::Denied {
                    name: name.to_string(),
                    reason,
                }
                .into())
            }
            "Failed" => {
                return Err(CsrError::Failed {
                    name: name.to_string(),
                    reason,
                }
                .into())
            }
            _ => {}
        }
    }

    match status.certificate.filter(|c| !c.is_empty()) {
        Some(encoded) => {
            let pem = STANDARD
                .decode(encoded.as_bytes())
                .context("issued certificate is not base64")?;
            Ok(Some(String::from_utf8(pem).context("issued certificate is not PEM")?))
        }
        None => Ok(None),
    }
}

/// Deterministic CSR name for a key and subject, so a retried bootstrap
/// finds its earlier request instead of creating another one.
pub fn digested_name(
    prefix: &str,
    public_key_der: &[u8],
    common_name: &str,
    organizations: &[String],
    usages: &[&str],
) -> String {
    let mut hash = Sha512_256::new();
    let mut write = |data: &[u8]| {
        hash.update(URL_SAFE_NO_PAD.encode(data).as_bytes());
        hash.update(b"|");
    };

    write(public_key_der);
    write(common_name.as_bytes());
    for org in organizations {
        write(org.as_bytes());
    }
    for usage in usages {
        write(usage.as_bytes());
    }

    format!("{}-{}", prefix, URL_SAFE_NO_PAD.encode(hash.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("10.0.0.1:6443"), "https://10.0.0.1:6443");
        assert_eq!(base_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_digested_name_is_stable_and_key_bound() {
        let orgs = vec![ORGANIZATION.to_string()];
        let a = digested_name(CSR_NAME_PREFIX, b"key-a", "system:plinth:n1", &orgs, &USAGES);
        let again = digested_name(CSR_NAME_PREFIX, b"key-a", "system:plinth:n1", &orgs, &USAGES);
        let b = digested_name(CSR_NAME_PREFIX, b"key-b", "system:plinth:n1", &orgs, &USAGES);

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert!(a.starts_with("plinth-csr-"));
        // 32 byte digest, unpadded base64url.
        assert_eq!(a.len(), "plinth-csr-".len() + 43);
    }

    #[test]
    fn test_issued_reports_denial() {
        let status = CsrStatus {
            certificate: None,
            conditions: vec![CsrCondition {
                kind: "Denied".to_string(),
                reason: "AutoDenied".to_string(),
                message: "not a node".to_string(),
            }],
        };
        let err = issued("csr-1", status).unwrap_err();
        assert!(err.to_string().contains("denied: AutoDenied: not a node"));
    }

    #[test]
    fn test_issued_pending_then_ready() {
        assert!(issued("csr-1", CsrStatus::default()).unwrap().is_none());

        let status = CsrStatus {
            certificate: Some(STANDARD.encode("-----BEGIN CERTIFICATE-----")),
            conditions: vec![CsrCondition {
                kind: "Approved".to_string(),
                reason: String::new(),
                message: String::new(),
            }],
        };
        assert_eq!(
            issued("csr-1", status).unwrap().as_deref(),
            Some("-----BEGIN CERTIFICATE-----")
        );
    }
}
