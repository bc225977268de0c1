//! Filesystem locations written by the provisioners.
//!
//! Every absolute path is resolved under a configurable root so the whole
//! plan can run against a scratch directory.

use std::path::{Path, PathBuf};

/// Well-known paths on a node, relative to `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    etcd_home: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, etcd_home: impl AsRef<Path>) -> Self {
        let root = root.into();
        let etcd_home = join_under(&root, etcd_home.as_ref());
        Self { root, etcd_home }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an absolute system path under the root.
    pub fn path(&self, absolute: impl AsRef<Path>) -> PathBuf {
        join_under(&self.root, absolute.as_ref())
    }

    pub fn etcd_home(&self) -> &Path {
        &self.etcd_home
    }

    pub fn etcd_unit(&self) -> PathBuf {
        self.path("/etc/systemd/system/etcd.service")
    }

    pub fn kubelet_unit(&self) -> PathBuf {
        self.path("/etc/systemd/system/kubelet.service")
    }

    pub fn containerd_dir(&self) -> PathBuf {
        self.path("/etc/containerd")
    }

    pub fn crictl_config(&self) -> PathBuf {
        self.path("/etc/crictl.yaml")
    }

    pub fn kubernetes_dir(&self) -> PathBuf {
        self.path("/etc/kubernetes")
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.path("/etc/kubernetes/pki")
    }

    pub fn kubelet_kubeconfig(&self) -> PathBuf {
        self.path("/etc/kubernetes/kubelet.conf")
    }

    pub fn kubelet_state(&self) -> PathBuf {
        self.path("/var/lib/kubelet")
    }

    pub fn admin_kubeconfig(&self) -> PathBuf {
        self.path("/etc/kubernetes/admin.local")
    }

    pub fn home_kubeconfig(&self) -> PathBuf {
        self.path("/root/.kube/config")
    }

    pub fn kubeadm_dir(&self) -> PathBuf {
        self.path("/etc/kubeadm")
    }

    pub fn kubeadm_config(&self) -> PathBuf {
        self.path("/etc/kubeadm/kubeadm.conf")
    }

    pub fn plinth_dir(&self) -> PathBuf {
        self.path("/etc/plinth")
    }

    /// Where a successful run leaves its bootstrap request.
    pub fn request_file(&self) -> PathBuf {
        self.path("/etc/plinth/request.json")
    }

    pub fn bootstrap_kubeconfig(&self) -> PathBuf {
        self.path("/etc/plinth/bootstrap.kubeconfig")
    }

    /// Rendered manifests handed to `kubectl apply`.
    pub fn manifests_dir(&self) -> PathBuf {
        self.path("/etc/plinth/manifests")
    }

    pub fn nvidia_device(&self) -> PathBuf {
        self.path("/dev/nvidia0")
    }
}

fn join_under(root: &Path, absolute: &Path) -> PathBuf {
    let relative = absolute.strip_prefix("/").unwrap_or(absolute);
    root.join(relative)
}

/// Write `contents` to `path`, creating parent directories, then set `mode`.
pub async fn write_file(path: &Path, contents: impl AsRef<[u8]>, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

/// Remove a file or directory tree. Missing paths are fine.
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_root() {
        let layout = Layout::new("/tmp/node", "/var/lib/plinth/etcd");

        assert_eq!(
            layout.etcd_unit(),
            PathBuf::from("/tmp/node/etc/systemd/system/etcd.service")
        );
        assert_eq!(layout.etcd_home(), Path::new("/tmp/node/var/lib/plinth/etcd"));
        assert_eq!(layout.path("relative/x"), PathBuf::from("/tmp/node/relative/x"));
    }

    #[test]
    fn test_system_root_is_identity() {
        let layout = Layout::new("/", "/var/lib/plinth/etcd");
        assert_eq!(layout.request_file(), PathBuf::from("/etc/plinth/request.json"));
    }

    #[tokio::test]
    async fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a/b/c.conf");

        write_file(&file, "x", 0o600).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "x");

        remove_path(&dir.path().join("a")).await.unwrap();
        assert!(!file.exists());
        remove_path(&dir.path().join("a")).await.unwrap();
    }
}
