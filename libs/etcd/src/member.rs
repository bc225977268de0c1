//! Membership facts reported by a running cluster.
//!
//! Nothing here is cached. A [`MemberSnapshot`] is taken, compared and
//! dropped; the cluster itself is the only authority.

use std::fmt;

use num_bigint::BigUint;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{EtcdError, Result};

/// Port etcd serves clients on.
pub const CLIENT_PORT: u16 = 2379;
/// Port etcd members talk to each other on.
pub const PEER_PORT: u16 = 2380;

/// `https://<ip>:<port>`, bracketing IPv6 literals.
pub fn advertise(ip: &str, port: u16) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("https://[{}]:{}", ip, port)
    } else {
        format!("https://{}:{}", ip, port)
    }
}

/// The member name a node registers under.
pub fn member_name(ip: &str) -> String {
    format!("etcd-{}.member", ip)
}

/// Extract the host from `scheme://ip:port`.
pub fn parse_peer_url(url: &str) -> Result<String> {
    let malformed = |reason| EtcdError::MalformedPeerUrl {
        url: url.to_string(),
        reason,
    };

    let (_, rest) = url
        .split_once("://")
        .ok_or_else(|| malformed("missing scheme separator"))?;
    if rest.is_empty() {
        return Err(malformed("missing host"));
    }

    let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
        let (host, tail) = v6
            .split_once(']')
            .ok_or_else(|| malformed("unterminated IPv6 literal"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| malformed("missing port"))?;
        (host, port)
    } else {
        rest.rsplit_once(':')
            .ok_or_else(|| malformed("missing port"))?
    };

    if host.is_empty() {
        return Err(malformed("missing host"));
    }
    let port = port.trim_end_matches('/');
    if port.is_empty() || port.parse::<u16>().is_err() {
        return Err(malformed("invalid port"));
    }
    Ok(host.to_string())
}

/// Arbitrary precision member identifier.
///
/// Zero is the "absent" sentinel. A real member id of exactly zero would be
/// misread as absent; etcd does not hand out zero in practice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(BigUint);

impl MemberId {
    pub fn new(value: impl Into<BigUint>) -> Self {
        Self(value.into())
    }

    pub fn absent() -> Self {
        Self::default()
    }

    pub fn is_absent(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// Parse a decimal string.
    pub fn parse(text: &str) -> Result<Self> {
        text.parse::<BigUint>()
            .map(Self)
            .map_err(|e| EtcdError::Parse(format!("member id [{}]: {}", text, e)))
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Serialize for MemberId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match u64::try_from(&self.0) {
            Ok(small) => serializer.serialize_u64(small),
            Err(_) => serializer.serialize_str(&self.0.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for MemberId {
    /// etcdctl prints ids as bare JSON numbers of any width. The number's
    /// text is kept exact (`arbitrary_precision`) and read as a `BigUint`.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(number) => MemberId::parse(&number.to_string()).map_err(de::Error::custom),
            Value::String(text) => MemberId::parse(&text).map_err(de::Error::custom),
            other => Err(de::Error::custom(format!(
                "expected a non-negative integer or a decimal string, got {}",
                other
            ))),
        }
    }
}

/// Whether a member has come up since it was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Started,
    /// Added through `member add` but never connected. etcd reports these
    /// with an empty name and no client urls.
    Unstarted,
}

/// One etcd member as reported by `member list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: MemberId,
    pub ip: String,
    pub state: MemberState,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(rename = "ID", default)]
    id: MemberId,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireMemberList {
    #[serde(default)]
    members: Vec<WireMember>,
}

impl Member {
    fn from_wire(wire: WireMember) -> Result<Self> {
        let first = wire
            .peer_urls
            .first()
            .ok_or_else(|| EtcdError::MalformedPeerUrl {
                url: String::new(),
                reason: "member has no peer urls",
            })?;
        let ip = parse_peer_url(first)?;
        let state = if wire.name.is_empty() && wire.client_urls.is_empty() {
            MemberState::Unstarted
        } else {
            MemberState::Started
        };
        Ok(Self {
            id: wire.id,
            ip,
            state,
            name: wire.name,
            peer_urls: wire.peer_urls,
            client_urls: wire.client_urls,
        })
    }

    /// `etcd-<ip>.member=<peer url>` for `--initial-cluster`.
    pub fn initial_cluster_entry(&self) -> Option<String> {
        self.peer_urls
            .first()
            .map(|url| format!("{}={}", member_name(&self.ip), url))
    }
}

/// Members reported by the cluster at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemberSnapshot {
    members: Vec<Member>,
}

impl MemberSnapshot {
    /// An empty snapshot, used when there is nobody to ask.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse `etcdctl -w json member list` output.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let list: WireMemberList =
            serde_json::from_slice(bytes).map_err(|e| EtcdError::Parse(e.to_string()))?;
        let members = list
            .members
            .into_iter()
            .map(Member::from_wire)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { members })
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains_ip(&self, ip: &str) -> bool {
        self.members.iter().any(|m| m.ip == ip)
    }

    pub fn find_by_ip(&self, ip: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.ip == ip)
    }

    /// Id of the member at `ip`, or the absent sentinel.
    pub fn id_of(&self, ip: &str) -> MemberId {
        self.find_by_ip(ip)
            .map(|m| m.id.clone())
            .unwrap_or_default()
    }

    /// First client url of every started member.
    pub fn client_endpoints(&self) -> Vec<String> {
        self.members
            .iter()
            .filter_map(|m| m.client_urls.first().cloned())
            .collect()
    }

    /// `--initial-cluster` value. Falls back to `self_ip` alone when the
    /// snapshot is empty.
    pub fn initial_cluster(&self, self_ip: &str) -> String {
        let entries: Vec<String> = self
            .members
            .iter()
            .filter_map(Member::initial_cluster_entry)
            .collect();
        if entries.is_empty() {
            return format!("{}={}", member_name(self_ip), advertise(self_ip, PEER_PORT));
        }
        entries.join(",")
    }
}

impl fmt::Display for MemberSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ips: Vec<&str> = self.members.iter().map(|m| m.ip.as_str()).collect();
        write!(f, "[{}]", ips.join(", "))
    }
}
