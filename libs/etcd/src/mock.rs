//! In-memory etcd cluster for tests and dry runs.
//!
//! Behaves like the membership API of a real cluster closely enough to
//! exercise the join protocol: added members stay unstarted (no name, no
//! client urls) until [`MockEtcdCluster::start_member`] is called, duplicate
//! peer urls are rejected, and only started members answer requests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::debug;

use crate::ctl::{EndpointStatus, EtcdCtl, RestoreRequest, StatusBody, StatusHeader};
use crate::error::{EtcdError, Result};
use crate::member::{
    advertise, member_name, parse_peer_url, MemberId, MemberSnapshot, CLIENT_PORT, PEER_PORT,
};

type AddHook = Box<dyn FnOnce(&mut MockState) + Send>;

#[derive(Debug, Clone)]
struct MockMember {
    id: u64,
    ip: String,
    started: bool,
}

/// Mutable cluster state, exposed to hooks.
#[derive(Default)]
pub struct MockState {
    members: Vec<MockMember>,
    unreachable: HashSet<String>,
    health_script: VecDeque<bool>,
    calls: HashMap<&'static str, usize>,
    restored: Vec<RestoreRequest>,
}

impl MockState {
    /// Register a member that has not started yet.
    pub fn add_unstarted(&mut self, ip: &str) {
        if self.members.iter().any(|m| m.ip == ip) {
            return;
        }
        self.members.push(MockMember {
            id: fresh_id(),
            ip: ip.to_string(),
            started: false,
        });
    }

    fn reachable(&self, endpoint: &str) -> bool {
        let Ok(ip) = parse_peer_url(endpoint) else {
            return false;
        };
        !self.unreachable.contains(&ip) && self.members.iter().any(|m| m.ip == ip && m.started)
    }

    fn snapshot_json(&self) -> Vec<u8> {
        let members: Vec<serde_json::Value> = self
            .members
            .iter()
            .map(|m| {
                if m.started {
                    json!({
                        "ID": m.id,
                        "name": member_name(&m.ip),
                        "peerURLs": [advertise(&m.ip, PEER_PORT)],
                        "clientURLs": [advertise(&m.ip, CLIENT_PORT)],
                    })
                } else {
                    json!({
                        "ID": m.id,
                        "peerURLs": [advertise(&m.ip, PEER_PORT)],
                    })
                }
            })
            .collect();
        json!({ "members": members }).to_string().into_bytes()
    }
}

fn fresh_id() -> u64 {
    rand::rng().random_range(1..=u64::MAX)
}

fn refused(endpoint: &str) -> EtcdError {
    EtcdError::Command {
        command: format!("etcdctl --endpoints {}", endpoint),
        status: "exit status: 1".to_string(),
        stderr: "context deadline exceeded: connection refused".to_string(),
    }
}

/// Shared in-memory cluster implementing [`EtcdCtl`].
pub struct MockEtcdCluster {
    state: Mutex<MockState>,
    on_add: Mutex<Option<AddHook>>,
    latency: Duration,
}

impl Default for MockEtcdCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEtcdCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            on_add: Mutex::new(None),
            latency: Duration::ZERO,
        }
    }

    /// Delay every call, so concurrent callers interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self, op: &'static str) {
        *self.lock().calls.entry(op).or_default() += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Mark the member at `ip` started. An empty cluster is bootstrapped
    /// with `ip` as its first member.
    pub fn start_member(&self, ip: &str) {
        let mut state = self.lock();
        if state.members.is_empty() {
            state.members.push(MockMember {
                id: fresh_id(),
                ip: ip.to_string(),
                started: true,
            });
            return;
        }
        if let Some(member) = state.members.iter_mut().find(|m| m.ip == ip) {
            member.started = true;
        }
    }

    pub fn set_unreachable(&self, ip: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(ip.to_string());
        } else {
            state.unreachable.remove(ip);
        }
    }

    /// Results for the next health probes, in order. Once used up, health
    /// follows reachability.
    pub fn script_health(&self, probes: Vec<bool>) {
        self.lock().health_script = probes.into();
    }

    /// Run `hook` right after the next successful `member add`.
    pub fn on_member_add(&self, hook: impl FnOnce(&mut MockState) + Send + 'static) {
        *self.on_add.lock().unwrap_or_else(|p| p.into_inner()) = Some(Box::new(hook));
    }

    /// Member ips in insertion order.
    pub fn member_ips(&self) -> Vec<String> {
        self.lock().members.iter().map(|m| m.ip.clone()).collect()
    }

    pub fn is_started(&self, ip: &str) -> bool {
        self.lock().members.iter().any(|m| m.ip == ip && m.started)
    }

    /// Number of calls made to the named operation.
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn restored(&self) -> Vec<RestoreRequest> {
        self.lock().restored.clone()
    }
}

#[async_trait]
impl EtcdCtl for MockEtcdCluster {
    async fn member_list(&self, endpoint: &str) -> Result<MemberSnapshot> {
        self.enter("member_list").await;
        let json = {
            let state = self.lock();
            if !state.reachable(endpoint) {
                return Err(refused(endpoint));
            }
            state.snapshot_json()
        };
        MemberSnapshot::from_json(&json)
    }

    async fn member_add(&self, endpoint: &str, name: &str, peer_url: &str) -> Result<()> {
        self.enter("member_add").await;
        let ip = parse_peer_url(peer_url)?;
        {
            let mut state = self.lock();
            if !state.reachable(endpoint) {
                return Err(refused(endpoint));
            }
            if state.members.iter().any(|m| m.ip == ip) {
                return Err(EtcdError::Command {
                    command: format!("etcdctl member add {}", name),
                    status: "exit status: 1".to_string(),
                    stderr: "etcdserver: Peer URLs already exists".to_string(),
                });
            }
            state.add_unstarted(&ip);
            debug!(ip = %ip, members = state.members.len(), "mock member added");
        }

        let hook = self.on_add.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(hook) = hook {
            hook(&mut self.lock());
        }
        Ok(())
    }

    async fn member_remove(&self, endpoint: &str, id: &MemberId) -> Result<()> {
        self.enter("member_remove").await;
        let mut state = self.lock();
        if !state.reachable(endpoint) {
            return Err(refused(endpoint));
        }
        let before = state.members.len();
        state.members.retain(|m| MemberId::new(m.id) != *id);
        if state.members.len() == before {
            return Err(EtcdError::Command {
                command: format!("etcdctl member remove {:x}", id),
                status: "exit status: 1".to_string(),
                stderr: "etcdserver: member not found".to_string(),
            });
        }
        Ok(())
    }

    async fn endpoint_health(&self, endpoints: &[String]) -> Result<()> {
        self.enter("endpoint_health").await;
        let mut state = self.lock();
        let healthy = match state.health_script.pop_front() {
            Some(scripted) => scripted,
            None => !endpoints.is_empty() && endpoints.iter().all(|e| state.reachable(e)),
        };
        if healthy {
            Ok(())
        } else {
            Err(EtcdError::Unhealthy(endpoints.join(",")))
        }
    }

    async fn endpoint_status(&self, endpoints: &[String]) -> Result<Vec<EndpointStatus>> {
        self.enter("endpoint_status").await;
        let state = self.lock();
        let leader = state
            .members
            .iter()
            .find(|m| m.started)
            .map(|m| MemberId::new(m.id))
            .unwrap_or_default();
        let mut statuses = Vec::new();
        for endpoint in endpoints {
            if !state.reachable(endpoint) {
                return Err(refused(endpoint));
            }
            let ip = parse_peer_url(endpoint)?;
            let member_id = state
                .members
                .iter()
                .find(|m| m.ip == ip)
                .map(|m| MemberId::new(m.id))
                .unwrap_or_default();
            statuses.push(EndpointStatus {
                endpoint: endpoint.clone(),
                status: StatusBody {
                    header: StatusHeader {
                        member_id,
                        ..StatusHeader::default()
                    },
                    version: "3.5.9".to_string(),
                    leader: leader.clone(),
                    ..StatusBody::default()
                },
            });
        }
        Ok(statuses)
    }

    async fn snapshot_save(&self, endpoint: &str, path: &Path) -> Result<()> {
        self.enter("snapshot_save").await;
        let json = {
            let state = self.lock();
            if !state.reachable(endpoint) {
                return Err(refused(endpoint));
            }
            state.snapshot_json()
        };
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn snapshot_restore(&self, request: &RestoreRequest) -> Result<()> {
        self.enter("snapshot_restore").await;
        self.lock().restored.push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_added_member_is_unstarted_until_started() {
        let cluster = MockEtcdCluster::new();
        cluster.start_member("10.0.0.1");

        cluster
            .member_add("https://10.0.0.1:2379", "etcd-10.0.0.2.member", "https://10.0.0.2:2380")
            .await
            .unwrap();
        let snapshot = cluster.member_list("https://10.0.0.1:2379").await.unwrap();
        assert_eq!(snapshot.client_endpoints(), vec!["https://10.0.0.1:2379"]);
        assert!(cluster.member_list("https://10.0.0.2:2379").await.is_err());

        cluster.start_member("10.0.0.2");
        let snapshot = cluster.member_list("https://10.0.0.2:2379").await.unwrap();
        assert_eq!(snapshot.client_endpoints().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_peer_url_is_rejected() {
        let cluster = MockEtcdCluster::new();
        cluster.start_member("10.0.0.1");

        let err = cluster
            .member_add("https://10.0.0.1:2379", "etcd-10.0.0.1.member", "https://10.0.0.1:2380")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_unreachable_member_refuses() {
        let cluster = MockEtcdCluster::new();
        cluster.start_member("10.0.0.1");
        cluster.set_unreachable("10.0.0.1", true);

        assert!(cluster.member_list("https://10.0.0.1:2379").await.is_err());
        assert!(cluster
            .endpoint_health(&["https://10.0.0.1:2379".to_string()])
            .await
            .is_err());
    }
}
