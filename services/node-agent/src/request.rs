//! The immutable provisioning input for one node.
//!
//! A `BootstrapRequest` is created once per cluster and handed to every
//! node, either from a file (`--request`) or fetched from the apiserver
//! after the bootstrap CSR exchange.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use plinth_pki::{CaMaterial, ETCD_PEER_CA, ETCD_SERVER_CA, ROOT_CA};
use serde::{Deserialize, Serialize};

/// Default apiserver port.
pub const API_PORT: u16 = 6443;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// kubeadm bootstrap token (`abcdef.0123456789abcdef`).
    #[serde(default)]
    pub token: String,

    pub access_point: AccessPoint,

    #[serde(default)]
    pub etcd: EtcdSpec,

    pub kubernetes: KubernetesSpec,

    /// Image registry mirror. Empty means upstream.
    #[serde(default)]
    pub registry: String,

    /// Extra apiserver certificate SANs.
    #[serde(default)]
    pub sans: Vec<String>,

    /// CA key pairs keyed by purpose.
    #[serde(default)]
    pub tls: CaMaterial,

    #[serde(default)]
    pub addons: Vec<Addon>,
}

fn default_cluster_name() -> String {
    "kubernetes".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPoint {
    /// Address reachable from inside the cluster network.
    pub intranet: String,

    #[serde(default)]
    pub internet: String,

    /// Domain that resolves to the apiserver, preferred over `intranet`.
    #[serde(default)]
    pub api_domain: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_api_port() -> u16 {
    API_PORT
}

impl AccessPoint {
    /// `host:port` used to join the control plane.
    pub fn endpoint(&self) -> String {
        let host = if self.api_domain.is_empty() {
            &self.intranet
        } else {
            &self.api_domain
        };
        format!("{}:{}", host, self.api_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    /// `--initial-cluster-token`.
    #[serde(default = "default_etcd_token")]
    pub init_token: String,

    /// IPs of existing etcd members a joining node talks to.
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_etcd_token() -> String {
    "plinth-etcd".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    pub version: String,

    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,

    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
}

fn default_pod_cidr() -> String {
    "10.244.0.0/16".to_string()
}

fn default_service_cidr() -> String {
    "10.96.0.0/12".to_string()
}

/// A manifest applied after the control plane is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addon {
    pub name: String,
    pub manifest: String,
}

impl BootstrapRequest {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse bootstrap request")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read bootstrap request {}", path.display()))?;
        Self::from_json(&bytes)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize bootstrap request")
    }

    /// Fill defaults that depend on the node running the request.
    pub fn with_node_defaults(mut self, node_ip: &str) -> Self {
        if self.sans.is_empty() {
            self.sans.push(node_ip.to_string());
        }
        self
    }

    /// Checks that every node needs. Control plane nodes additionally need
    /// the etcd CAs, see [`BootstrapRequest::validate_control_plane`].
    pub fn validate(&self) -> Result<()> {
        if self.access_point.intranet.is_empty() && self.access_point.api_domain.is_empty() {
            bail!("access point needs an intranet address or an api domain");
        }
        if self.kubernetes.version.is_empty() {
            bail!("kubernetes version is required");
        }
        cidr_ip(&self.kubernetes.service_cidr, 10)
            .with_context(|| format!("invalid service CIDR {}", self.kubernetes.service_cidr))?;
        for peer in &self.etcd.peers {
            peer.parse::<IpAddr>()
                .with_context(|| format!("invalid etcd peer ip {}", peer))?;
        }
        Ok(())
    }

    pub fn validate_control_plane(&self) -> Result<()> {
        self.validate()?;
        for ca in [ROOT_CA, ETCD_PEER_CA, ETCD_SERVER_CA] {
            self.tls.require(ca)?;
        }
        Ok(())
    }

    /// etcd peers other than `me`.
    pub fn etcd_peers_except(&self, me: &str) -> Vec<String> {
        self.etcd
            .peers
            .iter()
            .filter(|p| p.as_str() != me)
            .cloned()
            .collect()
    }

    /// Copy for worker nodes: no CA private keys beyond what joining needs.
    pub fn for_worker(&self) -> Self {
        let mut copy = self.clone();
        let root = copy.tls.get(ROOT_CA).cloned();
        copy.tls = CaMaterial::new();
        if let Some(mut root) = root {
            root.key_pem.clear();
            copy.tls.insert(ROOT_CA, root);
        }
        copy
    }
}

/// The `index`-th address of `cidr` (`10.96.0.0/12`, 10 → `10.96.0.10`).
pub fn cidr_ip(cidr: &str, index: u32) -> Result<IpAddr> {
    let (addr, prefix) = cidr
        .split_once('/')
        .with_context(|| format!("{} is not in CIDR notation", cidr))?;
    let addr: IpAddr = addr
        .parse()
        .with_context(|| format!("invalid address in {}", cidr))?;
    let prefix: u32 = prefix
        .parse()
        .with_context(|| format!("invalid prefix in {}", cidr))?;

    match addr {
        IpAddr::V4(v4) => {
            if prefix > 32 {
                bail!("prefix /{} too long for IPv4", prefix);
            }
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            let network = u32::from(v4) & mask;
            let size = 1u64 << (32 - prefix);
            if u64::from(index) >= size {
                bail!("{} has no address at index {}", cidr, index);
            }
            Ok(IpAddr::V4((network + index).into()))
        }
        IpAddr::V6(v6) => {
            if prefix > 128 {
                bail!("prefix /{} too long for IPv6", prefix);
            }
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            let network = u128::from(v6) & mask;
            if prefix == 128 && index > 0 {
                bail!("{} has no address at index {}", cidr, index);
            }
            Ok(IpAddr::V6((network + u128::from(index)).into()))
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use plinth_pki::{self_signed_ca, FRONT_PROXY_CA, SERVICE_ACCOUNT};

    /// A complete request with freshly generated CAs.
    pub fn request(peers: &[&str]) -> BootstrapRequest {
        let mut tls = CaMaterial::new();
        for name in [ROOT_CA, ETCD_PEER_CA, ETCD_SERVER_CA, FRONT_PROXY_CA, SERVICE_ACCOUNT] {
            tls.insert(name, self_signed_ca(name).unwrap());
        }
        BootstrapRequest {
            cluster_name: "kubernetes".to_string(),
            token: "abcdef.0123456789abcdef".to_string(),
            access_point: AccessPoint {
                intranet: "10.0.0.100".to_string(),
                internet: String::new(),
                api_domain: String::new(),
                api_port: API_PORT,
            },
            etcd: EtcdSpec {
                init_token: "plinth-etcd".to_string(),
                peers: peers.iter().map(|p| p.to_string()).collect(),
            },
            kubernetes: KubernetesSpec {
                version: "1.31.1".to_string(),
                pod_cidr: default_pod_cidr(),
                service_cidr: default_service_cidr(),
            },
            registry: String::new(),
            sans: Vec::new(),
            tls,
            addons: vec![Addon {
                name: "coredns".to_string(),
                manifest: "{\"kind\":\"ConfigMap\"}".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "accessPoint": {"intranet": "10.0.0.100"},
            "kubernetes": {"version": "1.31.1"}
        }"#;
        let request = BootstrapRequest::from_json(json.as_bytes()).unwrap();

        assert_eq!(request.cluster_name, "kubernetes");
        assert_eq!(request.access_point.endpoint(), "10.0.0.100:6443");
        assert_eq!(request.kubernetes.service_cidr, "10.96.0.0/12");
        assert_eq!(request.etcd.init_token, "plinth-etcd");
        assert!(request.validate().is_ok());
        assert!(request.validate_control_plane().is_err());
    }

    #[test]
    fn test_api_domain_wins() {
        let mut ap = AccessPoint {
            intranet: "10.0.0.100".to_string(),
            api_domain: "api.plinth.local".to_string(),
            api_port: 8443,
            ..AccessPoint::default()
        };
        assert_eq!(ap.endpoint(), "api.plinth.local:8443");
        ap.api_domain.clear();
        assert_eq!(ap.endpoint(), "10.0.0.100:8443");
    }

    #[test]
    fn test_cluster_dns_is_tenth_address() {
        assert_eq!(cidr_ip("10.96.0.0/12", 10).unwrap().to_string(), "10.96.0.10");
        assert_eq!(cidr_ip("172.16.5.7/24", 10).unwrap().to_string(), "172.16.5.10");
        assert_eq!(cidr_ip("fd00:10:96::/112", 10).unwrap().to_string(), "fd00:10:96::a");
        assert!(cidr_ip("10.0.0.0/30", 10).is_err());
        assert!(cidr_ip("10.0.0.0", 10).is_err());
    }

    #[test]
    fn test_bad_peer_fails_validation() {
        let mut request = fixtures::request(&["10.0.0.1"]);
        assert!(request.validate_control_plane().is_ok());
        request.etcd.peers.push("not-an-ip".to_string());
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_worker_copy_drops_ca_keys() {
        let request = fixtures::request(&[]);
        let worker = request.for_worker();

        assert_eq!(worker.tls.names().collect::<Vec<_>>(), vec!["root"]);
        assert!(worker.tls.get(ROOT_CA).unwrap().key_pem.is_empty());
    }

    #[test]
    fn test_peers_except_self() {
        let request = fixtures::request(&["10.0.0.1", "10.0.0.2"]);
        assert_eq!(request.etcd_peers_except("10.0.0.1"), vec!["10.0.0.2"]);
    }
}
