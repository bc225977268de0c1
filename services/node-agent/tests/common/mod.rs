//! Shared fixtures for the node agent integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use plinth_node::request::{AccessPoint, Addon, EtcdSpec, KubernetesSpec};
use plinth_node::{BootstrapRequest, Layout, MockHost, NodeSpec, Role};
use plinth_pki::{
    self_signed_ca, CaMaterial, RcgenSigner, ETCD_PEER_CA, ETCD_SERVER_CA, FRONT_PROXY_CA,
    ROOT_CA, SERVICE_ACCOUNT,
};

pub const ETCD_HOME: &str = "/var/lib/plinth/etcd";

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
            api_port: 6443,
            ..AccessPoint::default()
        },
        etcd: EtcdSpec {
            init_token: "plinth-etcd".to_string(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
        },
        kubernetes: KubernetesSpec {
            version: "1.31.1".to_string(),
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
        },
        registry: String::new(),
        sans: vec!["10.0.0.100".to_string()],
        tls,
        addons: vec![Addon {
            name: "coredns".to_string(),
            manifest: "{}".to_string(),
        }],
    }
}

/// A node rooted at `dir`, backed by a recording host.
pub fn node(dir: &Path, role: Role, ip: &str, request: BootstrapRequest) -> (NodeSpec, Arc<MockHost>) {
    let host = Arc::new(MockHost::new(format!("node-{}", ip), ip));
    let node = NodeSpec {
        request: Arc::new(request),
        host: host.clone(),
        layout: Layout::new(dir, ETCD_HOME),
        role,
        signer: Arc::new(RcgenSigner),
    };
    (node, host)
}
