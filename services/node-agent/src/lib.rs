//! plinth node agent library.
//!
//! The agent turns a bare host into a Kubernetes node. It reads a
//! [`BootstrapRequest`] (from a file or, after a bootstrap CSR exchange,
//! from the apiserver) and drives a plan of provisioning blocks toward it.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── prepare (concurrent)
//! │   ├── EtcdBlock        (control plane only, membership via plinth-etcd)
//! │   ├── ContainerdBlock
//! │   └── KubeletBlock
//! ├── AcceleratorBlock
//! ├── InitBlock | JoinBlock
//! ├── KubeAuthBlock        (control plane only)
//! └── addons (concurrent)  (control plane only)
//!     ├── CcmConfigBlock
//!     └── PostAddonBlock
//! ```
//!
//! ## Modules
//!
//! - `blocks`: leaf provisioners
//! - `bootstrap`: CSR exchange with the apiserver
//! - `host`: node identity and service control
//! - `orchestrator`: plan assembly and execution

pub mod blocks;
pub mod bootstrap;
pub mod config;
pub mod host;
pub mod kubeconfig;
pub mod layout;
pub mod logging;
pub mod orchestrator;
pub mod request;

pub use blocks::NodeSpec;
pub use bootstrap::{BootstrapClient, BootstrapPolicy, CsrError};
pub use config::Config;
pub use host::{Host, LocalHost, MockHost, ServiceControl, Systemd};
pub use layout::Layout;
pub use orchestrator::{Action, Orchestrator, Provisioners, Role};
pub use request::BootstrapRequest;
