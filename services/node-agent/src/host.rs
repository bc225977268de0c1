//! Host abstraction: node identity and OS service control.
//!
//! Provisioners only talk to the machine through [`Host`]. [`LocalHost`]
//! drives a real systemd host; [`MockHost`] records every call for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Control over the host's service supervisor.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self, unit: &str) -> Result<()>;
    async fn stop(&self, unit: &str) -> Result<()>;
    async fn restart(&self, unit: &str) -> Result<()>;
    async fn enable(&self, unit: &str) -> Result<()>;
    async fn disable(&self, unit: &str) -> Result<()>;

    /// Reload unit files after writing them.
    async fn daemon_reload(&self) -> Result<()>;
}

/// The machine being provisioned.
#[async_trait]
pub trait Host: Send + Sync {
    fn node_id(&self) -> &str;

    /// Address advertised to etcd peers and the control plane.
    fn node_ip(&self) -> &str;

    /// Architecture in Go notation (`amd64`, `arm64`).
    fn arch(&self) -> &str;

    /// OS release id (`ubuntu`, `centos`, ...).
    fn os(&self) -> &str;

    fn service(&self) -> &dyn ServiceControl;

    /// Run a program to completion and return its stdout. A non-zero exit
    /// status is an error carrying stderr.
    async fn command(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Run `program` with a timeout. Shared by [`LocalHost`] and [`Systemd`].
async fn run(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    debug!(program = %program, args = ?args, "running command");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .with_context(|| format!("{} timed out after {:?}", program, timeout))?
        .with_context(|| format!("failed to wait for {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `systemctl` backed [`ServiceControl`].
#[derive(Debug, Clone)]
pub struct Systemd {
    timeout: Duration,
}

impl Systemd {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        run("systemctl", &args, self.timeout).await.map(|_| ())
    }

    /// Stop and disable succeed for units that do not exist.
    async fn systemctl_tolerant(&self, verb: &str, unit: &str) -> Result<()> {
        match self.systemctl(&[verb, unit]).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing_unit(&e.to_string()) => {
                debug!(unit = %unit, verb = %verb, "unit not loaded, nothing to do");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_missing_unit(stderr: &str) -> bool {
    stderr.contains("not loaded") || stderr.contains("does not exist") || stderr.contains("not found")
}

#[async_trait]
impl ServiceControl for Systemd {
    async fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start", unit]).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl_tolerant("stop", unit).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl(&["restart", unit]).await
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["enable", unit]).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.systemctl_tolerant("disable", unit).await
    }

    async fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"]).await
    }
}

/// The machine this process runs on.
#[derive(Debug, Clone)]
pub struct LocalHost {
    node_id: String,
    node_ip: String,
    arch: String,
    os: String,
    systemd: Systemd,
    timeout: Duration,
}

impl LocalHost {
    /// Detect identity from the running system. Explicit values win.
    pub async fn detect(
        node_id: Option<String>,
        node_ip: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let node_id = match node_id {
            Some(id) => id,
            None => hostname().await?,
        };
        let node_ip = match node_ip {
            Some(ip) => ip,
            None => default_route_ip().await?,
        };
        let os = os_release_id(Path::new("/etc/os-release"))
            .await
            .unwrap_or_else(|| "linux".to_string());

        let host = Self {
            node_id,
            node_ip,
            arch: go_arch(std::env::consts::ARCH).to_string(),
            os,
            systemd: Systemd::new(timeout),
            timeout,
        };
        info!(
            node_id = %host.node_id,
            node_ip = %host.node_ip,
            arch = %host.arch,
            os = %host.os,
            "detected local host"
        );
        Ok(host)
    }
}

#[async_trait]
impl Host for LocalHost {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn node_ip(&self) -> &str {
        &self.node_ip
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    fn os(&self) -> &str {
        &self.os
    }

    fn service(&self) -> &dyn ServiceControl {
        &self.systemd
    }

    async fn command(&self, program: &str, args: &[String]) -> Result<String> {
        run(program, args, self.timeout).await
    }
}

fn go_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

async fn hostname() -> Result<String> {
    let raw = tokio::fs::read_to_string("/proc/sys/kernel/hostname")
        .await
        .context("failed to read hostname")?;
    let name = raw.trim();
    if name.is_empty() {
        bail!("hostname is empty, set PLINTH_NODE_ID");
    }
    Ok(name.to_string())
}

/// Address of the interface holding the default route. Connecting a UDP
/// socket sends nothing.
async fn default_route_ip() -> Result<String> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind probe socket")?;
    socket
        .connect("8.8.8.8:80")
        .await
        .context("no default route, set PLINTH_NODE_IP")?;
    Ok(socket.local_addr()?.ip().to_string())
}

async fn os_release_id(path: &Path) -> Option<String> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    parse_os_release_id(&text)
}

fn parse_os_release_id(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("ID="))
        .map(|id| id.trim_matches('"').to_string())
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Recording [`Host`] for tests.
///
/// Every service and command call is appended to [`MockHost::calls`] as a
/// short string (`restart etcd`, `daemon-reload`, `run kubeadm init ...`).
pub struct MockHost {
    node_id: String,
    node_ip: String,
    arch: String,
    calls: Mutex<Vec<String>>,
    restart_hooks: Mutex<HashMap<String, Vec<Hook>>>,
    scripted: Mutex<HashMap<String, VecDeque<std::result::Result<String, String>>>>,
    failing_units: Mutex<HashSet<String>>,
}

impl MockHost {
    pub fn new(node_id: impl Into<String>, node_ip: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_ip: node_ip.into(),
            arch: "amd64".to_string(),
            calls: Mutex::new(Vec::new()),
            restart_hooks: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            failing_units: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_arch(mut self, arch: &str) -> Self {
        self.arch = arch.to_string();
        self
    }

    /// Run `hook` every time `unit` is started or restarted.
    pub fn on_restart(&self, unit: &str, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.restart_hooks)
            .entry(unit.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Results for the next invocations of `program`, in order. Once used
    /// up, the program succeeds with empty output.
    pub fn script_command(&self, program: &str, results: Vec<std::result::Result<&str, &str>>) {
        let results = results
            .into_iter()
            .map(|r| r.map(str::to_string).map_err(str::to_string))
            .collect();
        lock(&self.scripted).insert(program.to_string(), results);
    }

    /// Make start and restart of `unit` fail.
    pub fn fail_unit(&self, unit: &str) {
        lock(&self.failing_units).insert(unit.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls equal to `call`.
    pub fn count(&self, call: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    /// Recorded calls starting with `prefix`.
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn record(&self, call: String) {
        debug!(call = %call, "mock host call");
        lock(&self.calls).push(call);
    }

    fn launch(&self, verb: &str, unit: &str) -> Result<()> {
        self.record(format!("{} {}", verb, unit));
        if lock(&self.failing_units).contains(unit) {
            bail!("Job for {}.service failed", unit);
        }
        let hooks = lock(&self.restart_hooks)
            .get(unit)
            .cloned()
            .unwrap_or_default();
        for hook in hooks {
            hook();
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ServiceControl for MockHost {
    async fn start(&self, unit: &str) -> Result<()> {
        self.launch("start", unit)
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.record(format!("stop {}", unit));
        Ok(())
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.launch("restart", unit)
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.record(format!("enable {}", unit));
        Ok(())
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.record(format!("disable {}", unit));
        Ok(())
    }

    async fn daemon_reload(&self) -> Result<()> {
        self.record("daemon-reload".to_string());
        Ok(())
    }
}

#[async_trait]
impl Host for MockHost {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn node_ip(&self) -> &str {
        &self.node_ip
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    fn os(&self) -> &str {
        "ubuntu"
    }

    fn service(&self) -> &dyn ServiceControl {
        self
    }

    async fn command(&self, program: &str, args: &[String]) -> Result<String> {
        let mut call = format!("run {}", program);
        for arg in args {
            call.push(' ');
            call.push_str(arg);
        }
        self.record(call);

        let next = lock(&self.scripted)
            .get_mut(program)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(stderr)) => {
                warn!(program = %program, "scripted command failure");
                bail!("{} {} failed (exit status: 1): {}", program, args.join(" "), stderr)
            }
            None => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_go_arch_names() {
        assert_eq!(go_arch("x86_64"), "amd64");
        assert_eq!(go_arch("aarch64"), "arm64");
        assert_eq!(go_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_parse_os_release() {
        let text = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(parse_os_release_id(text).as_deref(), Some("ubuntu"));
        assert_eq!(parse_os_release_id("ID=\"centos\"").as_deref(), Some("centos"));
        assert_eq!(parse_os_release_id("NAME=x"), None);
    }

    #[test]
    fn test_missing_unit_detection() {
        assert!(is_missing_unit("Failed to stop etcd.service: Unit etcd.service not loaded."));
        assert!(!is_missing_unit("Job for etcd.service failed because the control process exited"));
    }

    #[tokio::test]
    async fn test_mock_host_records_and_hooks() {
        let host = MockHost::new("node-a", "10.0.0.1");
        let restarts = Arc::new(AtomicUsize::new(0));
        let seen = restarts.clone();
        host.on_restart("etcd", move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        host.service().enable("etcd").await.unwrap();
        host.service().restart("etcd").await.unwrap();
        host.service().restart("kubelet").await.unwrap();

        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(host.calls(), vec!["enable etcd", "restart etcd", "restart kubelet"]);
    }

    #[tokio::test]
    async fn test_mock_host_scripted_commands() {
        let host = MockHost::new("node-a", "10.0.0.1");
        host.script_command("kubectl", vec![Err("connection refused"), Ok("ok")]);
        let args = vec!["get".to_string(), "nodes".to_string()];

        assert!(host.command("kubectl", &args).await.is_err());
        assert_eq!(host.command("kubectl", &args).await.unwrap(), "ok");
        assert_eq!(host.command("kubectl", &args).await.unwrap(), "");
        assert_eq!(host.count("run kubectl get nodes"), 3);
    }

    #[tokio::test]
    async fn test_failing_unit() {
        let host = MockHost::new("node-a", "10.0.0.1");
        host.fail_unit("containerd");
        assert!(host.service().restart("containerd").await.is_err());
    }
}
