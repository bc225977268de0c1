//! Membership actor for one node.
//!
//! The actor holds no cluster state of its own. Every fact is re-read from
//! the cluster, and concurrent joins by other nodes are resolved by
//! snapshot, compare and self-removal rather than by any lock.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::ctl::{EndpointStatus, EtcdCtl, RestoreRequest};
use crate::error::{EtcdError, Result};
use crate::health::wait_for_streak;
use crate::member::{advertise, member_name, MemberId, MemberSnapshot, CLIENT_PORT, PEER_PORT};

/// Timing for every retry and probe loop in the protocol.
#[derive(Debug, Clone)]
pub struct MembershipPolicy {
    /// Attempts against each peer before moving on to the next.
    pub peer_attempts: u32,
    pub peer_retry_interval: Duration,
    /// Consecutive healthy probes required.
    pub health_streak: u32,
    pub probe_interval: Duration,
    pub health_deadline: Duration,
    /// Pause between full join attempts.
    pub join_interval: Duration,
    pub join_deadline: Duration,
    /// Extra random fraction (0.0 to 1.0) added to each join pause so
    /// racing nodes fall out of step.
    pub join_jitter: f64,
}

impl Default for MembershipPolicy {
    fn default() -> Self {
        Self {
            peer_attempts: 2,
            peer_retry_interval: Duration::from_secs(2),
            health_streak: 3,
            probe_interval: Duration::from_secs(1),
            health_deadline: Duration::from_secs(3 * 60),
            join_interval: Duration::from_secs(5),
            join_deadline: Duration::from_secs(5 * 60),
            join_jitter: 0.5,
        }
    }
}

/// How a join attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// We added ourselves and nobody raced us.
    Joined,
    /// We were already listed; nothing was changed.
    AlreadyMember,
}

/// Drives membership changes for the node advertising `me`.
pub struct EtcdActor {
    me: String,
    peers: Vec<String>,
    ctl: Arc<dyn EtcdCtl>,
    policy: MembershipPolicy,
}

impl EtcdActor {
    pub fn new(
        me: impl Into<String>,
        peers: Vec<String>,
        ctl: Arc<dyn EtcdCtl>,
        policy: MembershipPolicy,
    ) -> Self {
        Self {
            me: me.into(),
            peers,
            ctl,
            policy,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn policy(&self) -> &MembershipPolicy {
        &self.policy
    }

    /// Our own client endpoint.
    pub fn endpoint(&self) -> String {
        advertise(&self.me, CLIENT_PORT)
    }

    /// Peers, or ourselves when no peer is known.
    fn targets(&self) -> Vec<String> {
        if self.peers.is_empty() {
            vec![self.me.clone()]
        } else {
            self.peers.clone()
        }
    }

    /// Call `op` against each ip's client endpoint, `peer_attempts` times
    /// per ip, until one call succeeds.
    async fn try_each<T, F, Fut>(&self, ips: &[String], what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if ips.is_empty() {
            return Err(EtcdError::Config(format!("no etcd peers to {}", what)));
        }

        let total = ips.len() * self.policy.peer_attempts.max(1) as usize;
        let mut attempts = 0;
        let mut last = None;
        for ip in ips {
            let endpoint = advertise(ip, CLIENT_PORT);
            for _ in 0..self.policy.peer_attempts.max(1) {
                attempts += 1;
                match op(endpoint.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_config() => return Err(e),
                    Err(e) => {
                        debug!(endpoint = %endpoint, attempt = attempts, error = %e, "{} failed", what);
                        last = Some(e);
                    }
                }
                if attempts < total {
                    tokio::time::sleep(self.policy.peer_retry_interval).await;
                }
            }
        }

        let source = last.unwrap_or_else(|| EtcdError::Config(format!("no etcd peers to {}", what)));
        Err(EtcdError::NoMoreEndpoints {
            attempts,
            source: Box::new(source),
        })
    }

    /// Current members, read through the first peer that answers.
    pub async fn member_list(&self) -> Result<MemberSnapshot> {
        let ctl = &self.ctl;
        self.try_each(&self.peers, "list members", |endpoint| async move {
            ctl.member_list(&endpoint).await
        })
        .await
    }

    /// Members through the peers, or an empty snapshot when there are none.
    pub async fn latest_members(&self) -> Result<MemberSnapshot> {
        if self.peers.is_empty() {
            return Ok(MemberSnapshot::empty());
        }
        self.member_list().await
    }

    /// `--initial-cluster` built from the latest members.
    pub async fn initial_cluster(&self) -> Result<String> {
        Ok(self.latest_members().await?.initial_cluster(&self.me))
    }

    /// Wait for a streak of healthy probes across `endpoints`.
    pub async fn wait_healthy(&self, endpoints: &[String]) -> Result<()> {
        if endpoints.is_empty() {
            return Err(EtcdError::Unhealthy(
                "no started members to probe".to_string(),
            ));
        }
        wait_for_streak(
            self.ctl.as_ref(),
            endpoints,
            self.policy.health_streak,
            self.policy.probe_interval,
            self.policy.health_deadline,
        )
        .await
    }

    /// Wait for our own endpoint to become healthy.
    pub async fn wait_self_healthy(&self) -> Result<()> {
        self.wait_healthy(&[self.endpoint()]).await
    }

    /// Add ourselves unless `before` already lists us.
    pub async fn join_me(&self, before: &MemberSnapshot) -> Result<JoinOutcome> {
        if before.contains_ip(&self.me) {
            info!(me = %self.me, "already an etcd member, skipping join");
            return Ok(JoinOutcome::AlreadyMember);
        }

        let name = member_name(&self.me);
        let peer_url = advertise(&self.me, PEER_PORT);
        let me = self.me.as_str();
        let ctl = &self.ctl;
        info!(me = %self.me, name = %name, "adding etcd member");

        self.try_each(&self.peers, "add member", |endpoint| {
            let name = name.clone();
            let peer_url = peer_url.clone();
            async move {
                // An earlier attempt may have landed even though it reported failure.
                let current = ctl.member_list(&endpoint).await?;
                if current.contains_ip(me) {
                    return Ok(());
                }
                ctl.member_add(&endpoint, &name, &peer_url).await
            }
        })
        .await?;
        Ok(JoinOutcome::Joined)
    }

    /// One complete join attempt: snapshot, health gate, add, snapshot,
    /// compare. On a detected race we remove ourselves and fail.
    #[instrument(skip(self), fields(me = %self.me))]
    pub async fn join(&self) -> Result<JoinOutcome> {
        if self.peers.is_empty() {
            return Err(EtcdError::Config(
                "cannot join etcd without at least one peer".to_string(),
            ));
        }

        let before = self.member_list().await?;
        debug!(members = %before, "member snapshot before join");

        self.wait_healthy(&before.client_endpoints()).await?;

        if self.join_me(&before).await? == JoinOutcome::AlreadyMember {
            return Ok(JoinOutcome::AlreadyMember);
        }

        let after = self.member_list().await?;
        debug!(members = %after, "member snapshot after join");

        if after.len() > before.len() + 1 {
            warn!(
                before = %before,
                after = %after,
                "concurrent etcd member join, removing ourselves"
            );
            self.remove_member(&after.id_of(&self.me)).await?;
            return Err(EtcdError::ConcurrentJoin {
                before: before.len(),
                after: after.len(),
            });
        }

        info!(name = %member_name(&self.me), members = after.len(), "joined etcd cluster");
        Ok(JoinOutcome::Joined)
    }

    /// Repeat [`EtcdActor::join`] from scratch until it succeeds, a
    /// configuration error occurs, or the join deadline passes.
    pub async fn backoff_join(&self) -> Result<JoinOutcome> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.join().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_config() => return Err(e),
                Err(e) => e,
            };

            let pause = self.jittered_join_interval();
            if started.elapsed() + pause >= self.policy.join_deadline {
                return Err(EtcdError::Timeout {
                    what: format!("etcd join after {} attempts, last error: {}", attempt, err),
                    after: self.policy.join_deadline,
                });
            }
            warn!(attempt, error = %err, retry_in = ?pause, "etcd join attempt failed");
            tokio::time::sleep(pause).await;
        }
    }

    fn jittered_join_interval(&self) -> Duration {
        let jitter = self.policy.join_jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return self.policy.join_interval;
        }
        let extra = rand::rng().random_range(0.0..=jitter);
        self.policy.join_interval.mul_f64(1.0 + extra)
    }

    /// Remove a member through any peer. Absent ids are a no-op.
    pub async fn remove_member(&self, id: &MemberId) -> Result<()> {
        if id.is_absent() {
            info!("member id absent, nothing to remove");
            return Ok(());
        }
        info!(id = %format!("{:x}", id), "removing etcd member");
        let ctl = &self.ctl;
        self.try_each(&self.targets(), "remove member", |endpoint| async move {
            ctl.member_remove(&endpoint, id).await
        })
        .await
    }

    /// Status of every peer endpoint, or our own when no peer is known.
    pub async fn endpoint_status(&self) -> Result<Vec<EndpointStatus>> {
        let endpoints: Vec<String> = self
            .targets()
            .iter()
            .map(|ip| advertise(ip, CLIENT_PORT))
            .collect();
        self.ctl.endpoint_status(&endpoints).await
    }

    /// Save a snapshot through the first endpoint that answers.
    pub async fn snapshot_save(&self, path: &Path) -> Result<()> {
        let ctl = &self.ctl;
        self.try_each(&self.targets(), "save snapshot", |endpoint| async move {
            ctl.snapshot_save(&endpoint, path).await
        })
        .await
    }

    /// Restore `snapshot` into `data_dir` as a single-member cluster.
    pub async fn snapshot_restore(
        &self,
        snapshot: &Path,
        data_dir: impl Into<PathBuf>,
        token: &str,
    ) -> Result<()> {
        let request = RestoreRequest {
            snapshot: snapshot.to_path_buf(),
            data_dir: data_dir.into(),
            name: member_name(&self.me),
            initial_cluster: MemberSnapshot::empty().initial_cluster(&self.me),
            initial_cluster_token: token.to_string(),
            initial_advertise_peer_urls: advertise(&self.me, PEER_PORT),
        };
        self.ctl.snapshot_restore(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEtcdCluster;

    fn fast_policy() -> MembershipPolicy {
        MembershipPolicy {
            peer_attempts: 2,
            peer_retry_interval: Duration::from_millis(1),
            health_streak: 3,
            probe_interval: Duration::from_millis(1),
            health_deadline: Duration::from_secs(2),
            join_interval: Duration::from_millis(5),
            join_deadline: Duration::from_secs(5),
            join_jitter: 1.0,
        }
    }

    fn actor(me: &str, peers: &[&str], cluster: &Arc<MockEtcdCluster>) -> EtcdActor {
        EtcdActor::new(
            me,
            peers.iter().map(|p| p.to_string()).collect(),
            cluster.clone(),
            fast_policy(),
        )
    }

    #[tokio::test]
    async fn test_peer_exhaustion_is_bounded() {
        let cluster = Arc::new(MockEtcdCluster::new());
        let node = actor("10.0.0.9", &["10.0.0.1", "10.0.0.2", "10.0.0.3"], &cluster);

        let err = node.member_list().await.unwrap_err();

        assert!(err.to_string().contains("no more endpoints to try"));
        assert_eq!(cluster.calls("member_list"), 6);
    }

    #[tokio::test]
    async fn test_second_peer_answers() {
        let cluster = Arc::new(MockEtcdCluster::new());
        cluster.start_member("10.0.0.2");
        let node = actor("10.0.0.9", &["10.0.0.1", "10.0.0.2"], &cluster);

        let members = node.member_list().await.unwrap();

        assert_eq!(members.len(), 1);
        assert_eq!(cluster.calls("member_list"), 3);
    }

    #[tokio::test]
    async fn test_simple_join_grows_by_one() {
        let cluster = Arc::new(MockEtcdCluster::new());
        cluster.start_member("10.0.0.1");
        let node = actor("10.0.0.2", &["10.0.0.1"], &cluster);

        let outcome = node.join().await.unwrap();

        assert_eq!(outcome, JoinOutcome::Joined);
        assert_eq!(cluster.member_ips(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(cluster.calls("member_add"), 1);
        assert_eq!(cluster.calls("member_remove"), 0);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let cluster = Arc::new(MockEtcdCluster::new());
        cluster.start_member("10.0.0.1");
        let node = actor("10.0.0.2", &["10.0.0.1"], &cluster);

        node.join().await.unwrap();
        cluster.start_member("10.0.0.2");
        let outcome = node.join().await.unwrap();

        assert_eq!(outcome, JoinOutcome::AlreadyMember);
        assert_eq!(cluster.calls("member_add"), 1);
        assert_eq!(cluster.member_ips().len(), 2);
    }

    #[tokio::test]
    async fn test_race_triggers_self_removal() {
        let cluster = Arc::new(MockEtcdCluster::new());
        cluster.start_member("10.0.0.1");
        // Another node sneaks in between our add and our second snapshot.
        cluster.on_member_add(|state| state.add_unstarted("10.0.0.3"));
        let node = actor("10.0.0.2", &["10.0.0.1"], &cluster);

        let err = node.join().await.unwrap_err();

        assert!(matches!(err, EtcdError::ConcurrentJoin { before: 1, after: 3 }));
        assert_eq!(cluster.member_ips(), vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(cluster.calls("member_remove"), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_member_is_noop() {
        let cluster = Arc::new(MockEtcdCluster::new());
        let node = actor("10.0.0.2", &["10.0.0.1"], &cluster);

        node.remove_member(&MemberId::absent()).await.unwrap();

        assert_eq!(cluster.calls("member_remove"), 0);
    }

    #[tokio::test]
    async fn test_join_without_peers_is_config_error() {
        let cluster = Arc::new(MockEtcdCluster::new());
        let node = actor("10.0.0.2", &[], &cluster);

        let err = node.backoff_join().await.unwrap_err();

        assert!(err.is_config());
        assert_eq!(cluster.calls("member_list"), 0);
    }

    #[tokio::test]
    async fn test_latest_members_without_peers_is_empty() {
        let cluster = Arc::new(MockEtcdCluster::new());
        let node = actor("10.0.0.1", &[], &cluster);

        assert!(node.latest_members().await.unwrap().is_empty());
        assert_eq!(
            node.initial_cluster().await.unwrap(),
            "etcd-10.0.0.1.member=https://10.0.0.1:2380"
        );
    }

    #[tokio::test]
    async fn test_join_waits_for_health_streak() {
        let cluster = Arc::new(MockEtcdCluster::new());
        cluster.start_member("10.0.0.1");
        cluster.script_health(vec![false, true, true, false, true, true, true]);
        let node = actor("10.0.0.2", &["10.0.0.1"], &cluster);

        node.join().await.unwrap();

        assert_eq!(cluster.calls("endpoint_health"), 7);
    }

    #[tokio::test]
    async fn test_backoff_join_gives_up_at_deadline() {
        let cluster = Arc::new(MockEtcdCluster::new());
        let mut policy = fast_policy();
        policy.join_deadline = Duration::from_millis(50);
        let node = EtcdActor::new("10.0.0.2", vec!["10.0.0.1".to_string()], cluster.clone(), policy);

        let err = node.backoff_join().await.unwrap_err();

        assert!(matches!(err, EtcdError::Timeout { .. }));
        assert!(err.to_string().contains("no more endpoints to try"));
    }
}
