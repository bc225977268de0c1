//! etcd cluster membership formation.
//!
//! Independently booted nodes form one etcd cluster without a shared lock.
//! The cluster's own member list is the only source of truth:
//!
//! 1. snapshot the members through any reachable peer,
//! 2. wait for the started members to report healthy,
//! 3. add ourselves unless already listed,
//! 4. snapshot again,
//! 5. if more than one member appeared, another node raced us; remove
//!    ourselves and let the outer backoff run the whole sequence again.
//!
//! See [`EtcdActor::backoff_join`].

pub mod actor;
pub mod certs;
pub mod ctl;
pub mod error;
pub mod health;
pub mod member;
pub mod mock;
pub mod unit;

pub use actor::{EtcdActor, JoinOutcome, MembershipPolicy};
pub use certs::CertLayout;
pub use ctl::{CommandEtcdCtl, EndpointStatus, EtcdCtl, RestoreRequest};
pub use error::{EtcdError, Result};
pub use health::HealthStreak;
pub use member::{
    advertise, member_name, parse_peer_url, Member, MemberId, MemberSnapshot, MemberState,
    CLIENT_PORT, PEER_PORT,
};
pub use mock::MockEtcdCluster;
pub use unit::{flag_value, ClusterState, EtcdUnit, DATA_DIR};
