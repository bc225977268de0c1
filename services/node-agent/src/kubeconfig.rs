//! Kubeconfig rendering.
//!
//! kubectl and kubeadm accept JSON kubeconfigs, so we render them with
//! serde_json instead of templating YAML.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

/// How the client proves its identity.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// PEM client certificate and key.
    Certificate { cert_pem: String, key_pem: String },
    /// Bearer token, e.g. a bootstrap token.
    Token(String),
}

/// A single-cluster, single-user kubeconfig.
#[derive(Debug, Clone)]
pub struct Kubeconfig {
    pub server: String,
    /// PEM CA bundle. `None` skips server verification.
    pub ca_pem: Option<String>,
    pub credentials: Credentials,
    pub cluster: String,
    pub user: String,
}

impl Kubeconfig {
    pub fn new(server: impl Into<String>, ca_pem: Option<String>, credentials: Credentials) -> Self {
        Self {
            server: server.into(),
            ca_pem,
            credentials,
            cluster: "default-cluster".to_string(),
            user: "default-auth".to_string(),
        }
    }

    pub fn with_names(mut self, cluster: &str, user: &str) -> Self {
        self.cluster = cluster.to_string();
        self.user = user.to_string();
        self
    }

    pub fn to_value(&self) -> Value {
        let mut cluster = json!({ "server": self.server });
        match &self.ca_pem {
            Some(ca) => {
                cluster["certificate-authority-data"] = json!(STANDARD.encode(ca));
            }
            None => {
                cluster["insecure-skip-tls-verify"] = json!(true);
            }
        }

        let user = match &self.credentials {
            Credentials::Certificate { cert_pem, key_pem } => json!({
                "client-certificate-data": STANDARD.encode(cert_pem),
                "client-key-data": STANDARD.encode(key_pem),
            }),
            Credentials::Token(token) => json!({ "token": token }),
        };

        let context = format!("{}@{}", self.user, self.cluster);
        json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": self.cluster, "cluster": cluster }],
            "users": [{ "name": self.user, "user": user }],
            "contexts": [{
                "name": context,
                "context": { "cluster": self.cluster, "user": self.user, "namespace": "default" },
            }],
            "current-context": context,
        })
    }

    pub fn render(&self) -> String {
        // Serializing a Value cannot fail.
        serde_json::to_string_pretty(&self.to_value()).unwrap_or_default()
    }
}
