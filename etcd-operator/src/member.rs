//! etcd members and member sets.
//!
//! A member is the consensus protocol's view of a replica. Its pod has the
//! same name, and both URLs are derived from that name, so a peer URL
//! advertised by etcd maps back to a pod name.

use crate::error::{OperatorError, OperatorResult};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::BTreeMap;
use std::fmt;

/// Port etcd serves clients on.
pub const CLIENT_PORT: u16 = 2379;

/// Port etcd members use for peer traffic.
pub const PEER_PORT: u16 = 2380;

/// Length of the random suffix of generated member names.
pub const RANDOM_SUFFIX_LENGTH: usize = 10;

/// Longest cluster name that still leaves room for a member suffix
/// within the 63 character DNS label limit.
pub const MAX_NAME_LENGTH: usize = 63 - RANDOM_SUFFIX_LENGTH - 1;

/// One etcd member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member and pod name, `<cluster>-<suffix>`.
    pub name: String,
    /// Namespace of the pod.
    pub namespace: String,
    /// Id assigned by etcd. `None` until the member is registered.
    pub id: Option<u64>,
    /// Peer traffic uses TLS.
    pub secure_peer: bool,
    /// Client traffic uses TLS.
    pub secure_client: bool,
    /// Cluster domain suffix, e.g. ".cluster.local".
    pub cluster_domain: String,
}

impl Member {
    /// Create an unregistered member.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            id: None,
            secure_peer: false,
            secure_client: false,
            cluster_domain: String::new(),
        }
    }

    /// Stable DNS name of the member behind the cluster's headless service.
    pub fn addr(&self) -> String {
        format!(
            "{}.{}.{}.svc{}",
            self.name,
            cluster_name_from_member_name(&self.name),
            self.namespace,
            self.cluster_domain
        )
    }

    /// URL clients reach this member on.
    pub fn client_url(&self) -> String {
        format!("{}://{}:{}", scheme(self.secure_client), self.addr(), CLIENT_PORT)
    }

    /// URL peers reach this member on.
    pub fn peer_url(&self) -> String {
        format!("{}://{}:{}", scheme(self.secure_peer), self.addr(), PEER_PORT)
    }

    /// Name of the member's data volume claim.
    pub fn pvc_name(&self) -> String {
        pvc_name(&self.name)
    }
}

fn scheme(secure: bool) -> &'static str {
    if secure { "https" } else { "http" }
}

/// Name of the data volume claim of a member.
pub fn pvc_name(member_name: &str) -> String {
    format!("{}-pvc", member_name)
}

/// Cluster part of a member name: everything before the last dash.
pub fn cluster_name_from_member_name(member_name: &str) -> &str {
    member_name
        .rfind('-')
        .map(|i| &member_name[..i])
        .unwrap_or(member_name)
}

/// Generate a fresh member name for a cluster.
pub fn unique_member_name(cluster_name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_LENGTH)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}", cluster_name, suffix)
}

/// Recover a member name from a peer URL such as
/// `http://example-abc.example.default.svc:2380`.
pub fn member_name_from_peer_url(peer_url: &str) -> OperatorResult<String> {
    let uri: http::Uri = peer_url
        .parse()
        .map_err(|e| OperatorError::Fatal(format!("invalid member peerURL ({}): {}", peer_url, e)))?;

    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| {
            OperatorError::Fatal(format!("invalid member peerURL ({}): missing host", peer_url))
        })?;

    let name = host.split('.').next().unwrap_or_default();
    if name.is_empty() {
        return Err(OperatorError::Fatal(format!(
            "invalid member peerURL ({}): empty member name",
            peer_url
        )));
    }
    Ok(name.to_string())
}

/// Members keyed by name.
///
/// Iteration is ordered by name, which makes [`MemberSet::pick_one`]
/// deterministic for a given set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberSet {
    members: BTreeMap<String, Member>,
}

impl MemberSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a member, replacing any member with the same name.
    pub fn add(&mut self, member: Member) {
        self.members.insert(member.name.clone(), member);
    }

    /// Remove a member by name.
    pub fn remove(&mut self, name: &str) -> Option<Member> {
        self.members.remove(name)
    }

    /// Look up a member by name.
    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Whether a member with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate members in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Member names in order.
    pub fn names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// Whether both sets hold the same names. Other fields are ignored.
    pub fn is_equal(&self, other: &MemberSet) -> bool {
        self.members.len() == other.members.len()
            && self.members.keys().all(|k| other.members.contains_key(k))
    }

    /// Members of `self` whose names are not in `other`.
    pub fn diff(&self, other: &MemberSet) -> MemberSet {
        self.members
            .values()
            .filter(|m| !other.contains(&m.name))
            .cloned()
            .collect()
    }

    /// One member of the set, the same one for the same set.
    pub fn pick_one(&self) -> Option<&Member> {
        self.members.values().next()
    }

    /// Client URLs of all members.
    pub fn client_urls(&self) -> Vec<String> {
        self.members.values().map(Member::client_url).collect()
    }

    /// `name=peerURL` pairs, as etcd's `--initial-cluster` expects.
    pub fn peer_url_pairs(&self) -> Vec<String> {
        self.members
            .values()
            .map(|m| format!("{}={}", m.name, m.peer_url()))
            .collect()
    }
}

impl FromIterator<Member> for MemberSet {
    fn from_iter<I: IntoIterator<Item = Member>>(iter: I) -> Self {
        let mut set = MemberSet::new();
        for member in iter {
            set.add(member);
        }
        set
    }
}

impl fmt::Display for MemberSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> MemberSet {
        names.iter().map(|n| Member::new(*n, "default")).collect()
    }

    #[test]
    fn urls_follow_name_namespace_and_domain() {
        let mut m = Member::new("example-abcdefghij", "prod");
        assert_eq!(
            m.peer_url(),
            "http://example-abcdefghij.example.prod.svc:2380"
        );
        assert_eq!(
            m.client_url(),
            "http://example-abcdefghij.example.prod.svc:2379"
        );

        m.secure_peer = true;
        m.secure_client = true;
        m.cluster_domain = ".cluster.local".into();
        assert_eq!(
            m.peer_url(),
            "https://example-abcdefghij.example.prod.svc.cluster.local:2380"
        );
        assert_eq!(
            m.client_url(),
            "https://example-abcdefghij.example.prod.svc.cluster.local:2379"
        );
    }

    #[test]
    fn peer_url_maps_back_to_name() {
        let m = Member::new("my-cluster-0123456789", "default");
        assert_eq!(
            member_name_from_peer_url(&m.peer_url()).unwrap(),
            "my-cluster-0123456789"
        );
    }

    #[test]
    fn malformed_peer_url_is_fatal() {
        let err = member_name_from_peer_url("not a url").unwrap_err();
        assert!(err.is_fatal());
        let err = member_name_from_peer_url("/just/a/path").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unique_names_carry_cluster_prefix() {
        let a = unique_member_name("example");
        let b = unique_member_name("example");
        assert!(a.starts_with("example-"));
        assert_eq!(a.len(), "example-".len() + RANDOM_SUFFIX_LENGTH);
        assert_ne!(a, b);
        assert_eq!(cluster_name_from_member_name(&a), "example");
        assert_eq!(a, a.to_ascii_lowercase());
    }

    #[test]
    fn diff_partitions_union() {
        let universe = ["a", "b", "c", "d", "e", "f"];
        // every pair of subsets of a six element universe
        for r_mask in 0u32..64 {
            for m_mask in 0u32..64 {
                let pick = |mask: u32| -> Vec<&str> {
                    universe
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| mask & (1 << i) != 0)
                        .map(|(_, n)| *n)
                        .collect()
                };
                let r = set(&pick(r_mask));
                let m = set(&pick(m_mask));
                let only_r = r.diff(&m);
                let only_m = m.diff(&r);
                let both = r.diff(&only_r);

                let mut covered: Vec<String> = only_r
                    .names()
                    .into_iter()
                    .chain(only_m.names())
                    .chain(both.names())
                    .collect();
                let total = covered.len();
                covered.sort();
                covered.dedup();
                assert_eq!(covered.len(), total, "parts overlap");

                let mut union = r.names();
                union.extend(m.names());
                union.sort();
                union.dedup();
                assert_eq!(covered, union);
            }
        }
    }

    #[test]
    fn equality_is_by_name() {
        let mut a = set(&["x-1", "x-2"]);
        let b = set(&["x-2", "x-1"]);
        assert!(a.is_equal(&b));

        let mut registered = Member::new("x-1", "default");
        registered.id = Some(42);
        a.add(registered);
        assert!(a.is_equal(&b));

        a.remove("x-2");
        assert!(!a.is_equal(&b));
    }

    #[test]
    fn pick_one_is_deterministic() {
        let s = set(&["c-1", "a-1", "b-1"]);
        assert_eq!(s.pick_one().map(|m| m.name.as_str()), Some("a-1"));
        assert_eq!(s.pick_one(), s.clone().pick_one());
        assert!(MemberSet::new().pick_one().is_none());
    }

    #[test]
    fn url_lists() {
        let s = set(&["ex-1", "ex-2"]);
        assert_eq!(
            s.peer_url_pairs(),
            vec![
                "ex-1=http://ex-1.ex.default.svc:2380".to_string(),
                "ex-2=http://ex-2.ex.default.svc:2380".to_string(),
            ]
        );
        assert_eq!(s.client_urls().len(), 2);
        assert_eq!(s.to_string(), "ex-1,ex-2");
    }
}
