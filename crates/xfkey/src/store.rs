//! In-memory mirror of the kernel policy table.
//!
//! The mirror is replaced wholesale by a dump ([`PolicyStore::refresh`])
//! and patched by the controller's own policy installs and deletes. Every
//! access, lookups included, takes the store mutex: the dispatcher thread
//! may refresh while a command thread is matching.

use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::model::{Direction, IpsecMode, IpsecProtocol, Policy, PolicyType, TrafficSelector};

/// Mirror of the kernel policy table, in kernel dump order.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: Mutex<Vec<Policy>>,
}

impl PolicyStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Policy>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.policies.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dump the kernel table and replace the mirror with it.
    ///
    /// With `show`, every policy is logged. Returns the number of policies.
    pub fn refresh(&self, backend: &Backend, show: bool) -> Result<usize> {
        let fresh = backend.dump_policies()?;
        if show {
            for policy in &fresh {
                info!("\n{}", policy.to_string_tab(0));
            }
        }
        let count = fresh.len();
        self.replace(fresh);
        debug!(count, "policy store refreshed");
        Ok(count)
    }

    /// Replace the contents atomically.
    ///
    /// The kernel does not always report the autogen marker, so it is
    /// carried over from the previous entry with the same id.
    pub fn replace(&self, mut fresh: Vec<Policy>) {
        let mut policies = self.lock();
        for policy in fresh.iter_mut().filter(|p| !p.autogen) {
            policy.autogen = policies.iter().any(|old| old.id == policy.id && old.autogen && old == &*policy);
        }
        *policies = fresh;
    }

    /// Copy of every policy.
    pub fn snapshot(&self) -> Vec<Policy> {
        self.lock().clone()
    }

    /// Number of mirrored policies.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the mirror is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Record a policy the controller just installed, replacing any
    /// entry with the same id or the same selectors.
    pub fn insert(&self, policy: Policy) {
        let mut policies = self.lock();
        match policies.iter_mut().find(|p| p.id == policy.id || p.same_selector(&policy)) {
            Some(slot) => *slot = policy,
            None => policies.push(policy),
        }
    }

    /// Remove the entry the kernel would delete for `policy`: same table,
    /// direction and selector, whatever its SA request.
    pub fn remove(&self, policy: &Policy) -> Option<Policy> {
        let mut policies = self.lock();
        let pos = policies.iter().position(|p| p.same_selector(policy))?;
        Some(policies.remove(pos))
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Policy with kernel id `id`.
    ///
    /// A miss means the mirror is stale, reported as
    /// [`Error::PolicyNotFound`].
    pub fn get_by_id(&self, id: u32) -> Result<Policy> {
        self.lock()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(Error::PolicyNotFound { id })
    }

    /// First policy (in kernel order) protecting traffic `ts_i -> ts_r`.
    ///
    /// A candidate matches when the direction, mode and protocol agree,
    /// the tunnel endpoints agree in tunnel mode, and its selectors
    /// contain the requested ones.
    pub fn find_policy(
        &self,
        ts_i: &TrafficSelector,
        ts_r: &TrafficSelector,
        direction: Direction,
        mode: IpsecMode,
        protocol: IpsecProtocol,
        tunnel: Option<(IpAddr, IpAddr)>,
    ) -> Option<Policy> {
        self.lock()
            .iter()
            .find(|p| {
                let Some(req) = &p.sa_request else {
                    return false;
                };
                if p.direction != direction || req.mode() != mode || req.protocol != protocol {
                    return false;
                }
                if mode == IpsecMode::Tunnel {
                    let endpoints = req.tunnel_endpoints().map(|t| (t.src, t.dst));
                    if endpoints != tunnel {
                        return false;
                    }
                }
                p.src_traffic_selector().contains(ts_i) && p.dst_traffic_selector().contains(ts_r)
            })
            .cloned()
    }

    /// First OUT policy whose SAs would run between `src` and `dst`.
    ///
    /// Used when an acquire names no policy: tunnel policies match on
    /// their endpoints, transport policies on their selectors.
    pub fn find_by_endpoints(&self, src: &IpAddr, dst: &IpAddr, protocol: IpsecProtocol) -> Option<Policy> {
        let (src_host, dst_host) = (TrafficSelector::host(*src), TrafficSelector::host(*dst));
        self.lock()
            .iter()
            .find(|p| {
                let Some(req) = &p.sa_request else {
                    return false;
                };
                if p.direction != Direction::Out || req.protocol != protocol {
                    return false;
                }
                match req.tunnel_endpoints() {
                    Some(t) => t.src == *src && t.dst == *dst,
                    None => {
                        p.src_traffic_selector().contains(&src_host)
                            && p.dst_traffic_selector().contains(&dst_host)
                    }
                }
            })
            .cloned()
    }

    /// Main-table policy a sub-policy was narrowed from: same direction
    /// and protocol, selectors containing the sub-policy's.
    pub fn parent_of(&self, sub: &Policy) -> Option<Policy> {
        let (src, dst) = (sub.src_traffic_selector(), sub.dst_traffic_selector());
        let protocol = sub.sa_request.as_ref().map(|r| r.protocol);
        self.lock()
            .iter()
            .find(|p| {
                p.policy_type == PolicyType::Main
                    && p.direction == sub.direction
                    && p.sa_request.as_ref().map(|r| r.protocol) == protocol
                    && p.src_traffic_selector().contains(&src)
                    && p.dst_traffic_selector().contains(&dst)
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::selector::{IPPROTO_TCP, IPPROTO_UDP};
    use crate::model::{IpsecLevel, PortRange, SaRequest};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn tunnel(id: u32, src: (&str, u8), dst: (&str, u8)) -> Policy {
        let mut p = Policy::new(Direction::Out, (ip(src.0), src.1), (ip(dst.0), dst.1)).with_request(
            SaRequest::tunnel(IpsecProtocol::Esp, IpsecLevel::Require, id, ip("192.0.2.1"), ip("192.0.2.2")),
        );
        p.id = id;
        p
    }

    fn ts(addr: &str, prefix: u8) -> TrafficSelector {
        TrafficSelector::from_prefix(ip(addr), prefix, 0, PortRange::ANY)
    }

    fn find(store: &PolicyStore, ts_i: TrafficSelector, ts_r: TrafficSelector) -> Option<u32> {
        store
            .find_policy(
                &ts_i,
                &ts_r,
                Direction::Out,
                IpsecMode::Tunnel,
                IpsecProtocol::Esp,
                Some((ip("192.0.2.1"), ip("192.0.2.2"))),
            )
            .map(|p| p.id)
    }

    #[test]
    fn subset_matches_disjoint_does_not() {
        let store = PolicyStore::new();
        store.replace(vec![tunnel(1, ("10.0.0.0", 24), ("10.0.1.0", 24))]);

        assert_eq!(find(&store, ts("10.0.0.0", 24), ts("10.0.1.0", 24)), Some(1));
        assert_eq!(find(&store, ts("10.0.0.5", 32), ts("10.0.1.128", 25)), Some(1));
        assert_eq!(find(&store, ts("10.0.2.0", 24), ts("10.0.1.0", 24)), None);
        assert_eq!(find(&store, ts("10.0.0.0", 16), ts("10.0.1.0", 24)), None);
    }

    #[test]
    fn first_match_wins_in_kernel_order() {
        let store = PolicyStore::new();
        store.replace(vec![
            tunnel(7, ("10.0.0.0", 16), ("10.0.1.0", 24)),
            tunnel(3, ("10.0.0.0", 24), ("10.0.1.0", 24)),
        ]);
        assert_eq!(find(&store, ts("10.0.0.1", 32), ts("10.0.1.1", 32)), Some(7));
    }

    #[test]
    fn mode_protocol_and_endpoints_must_agree() {
        let store = PolicyStore::new();
        store.replace(vec![tunnel(1, ("10.0.0.0", 24), ("10.0.1.0", 24))]);
        let (a, b) = (ts("10.0.0.1", 32), ts("10.0.1.1", 32));

        let other_gw = Some((ip("192.0.2.1"), ip("192.0.2.9")));
        assert!(store.find_policy(&a, &b, Direction::Out, IpsecMode::Tunnel, IpsecProtocol::Esp, other_gw).is_none());
        let gw = Some((ip("192.0.2.1"), ip("192.0.2.2")));
        assert!(store.find_policy(&a, &b, Direction::Out, IpsecMode::Tunnel, IpsecProtocol::Ah, gw).is_none());
        assert!(store.find_policy(&a, &b, Direction::In, IpsecMode::Tunnel, IpsecProtocol::Esp, gw).is_none());
        assert!(store.find_policy(&a, &b, Direction::Out, IpsecMode::Transport, IpsecProtocol::Esp, None).is_none());
    }

    #[test]
    fn port_ranges_are_matched() {
        let store = PolicyStore::new();
        let p = tunnel(4, ("10.0.0.0", 24), ("10.0.1.0", 24)).with_protocol(IPPROTO_TCP, 0, 443);
        store.replace(vec![p]);
        let gw = Some((ip("192.0.2.1"), ip("192.0.2.2")));
        let src = TrafficSelector::from_prefix(ip("10.0.0.1"), 32, IPPROTO_TCP, PortRange::single(5000));
        let https = TrafficSelector::from_prefix(ip("10.0.1.1"), 32, IPPROTO_TCP, PortRange::single(443));
        let dns = TrafficSelector::from_prefix(ip("10.0.1.1"), 32, IPPROTO_UDP, PortRange::single(53));
        let f = |dst: &TrafficSelector| {
            store
                .find_policy(&src, dst, Direction::Out, IpsecMode::Tunnel, IpsecProtocol::Esp, gw)
                .map(|p| p.id)
        };
        assert_eq!(f(&https), Some(4));
        assert_eq!(f(&dns), None);
    }

    #[test]
    fn get_by_id_miss_is_consistency_error() {
        let store = PolicyStore::new();
        store.insert(tunnel(5, ("10.0.0.0", 24), ("10.0.1.0", 24)));
        assert_eq!(store.get_by_id(5).unwrap().id, 5);
        let err = store.get_by_id(6).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn insert_replaces_and_remove_deletes() {
        let store = PolicyStore::new();
        let p = tunnel(5, ("10.0.0.0", 24), ("10.0.1.0", 24));
        store.insert(p.clone());
        let mut again = p.clone();
        again.priority = 9;
        store.insert(again);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_by_id(5).unwrap().priority, 9);
        let bare = Policy::new(Direction::Out, (ip("10.0.0.0"), 24), (ip("10.0.1.0"), 24));
        assert!(store.remove(&bare).is_some());
        assert!(store.is_empty());
        assert!(store.remove(&p).is_none());
    }

    #[test]
    fn autogen_survives_refresh() {
        let store = PolicyStore::new();
        let mut p = tunnel(5, ("10.0.0.0", 24), ("10.0.1.0", 24));
        p.autogen = true;
        store.insert(p.clone());
        p.autogen = false;
        store.replace(vec![p]);
        assert!(store.get_by_id(5).unwrap().autogen);
    }

    #[test]
    fn endpoint_lookup_and_parent() {
        let store = PolicyStore::new();
        let parent = tunnel(1, ("10.0.0.0", 16), ("0.0.0.0", 0));
        store.replace(vec![parent]);
        let hit = store.find_by_endpoints(&ip("192.0.2.1"), &ip("192.0.2.2"), IpsecProtocol::Esp);
        assert_eq!(hit.map(|p| p.id), Some(1));
        assert!(
            store
                .find_by_endpoints(&ip("192.0.2.2"), &ip("192.0.2.1"), IpsecProtocol::Esp)
                .is_none()
        );

        let mut sub = Policy::new(Direction::Out, (ip("10.0.3.0"), 24), (ip("172.16.0.1"), 32))
            .with_request(SaRequest::transport(IpsecProtocol::Esp, IpsecLevel::Unique, 0));
        sub.policy_type = PolicyType::Sub;
        assert_eq!(store.parent_of(&sub).map(|p| p.id), Some(1));
    }
}
