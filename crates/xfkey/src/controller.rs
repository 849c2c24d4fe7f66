//! The facade the IKE core talks to.
//!
//! ```ignore
//! use std::sync::mpsc;
//! use xfkey::{ControllerConfig, IpsecController, Protocol};
//!
//! let controller = IpsecController::with_kernel(ControllerConfig::new().backend(Protocol::Xfrm))?;
//! let (tx, rx) = mpsc::channel();
//! controller.start(tx)?;
//!
//! let spi = controller.get_spi(&remote, &local, IpsecProtocol::Esp)?;
//! // ... negotiate, then
//! controller.create_ipsec_sa(&remote, &local, &params.with_spi(spi))?;
//!
//! for command in rx {
//!     // StartNegotiation / RekeyChildSa / DeleteChildSa
//! }
//! ```

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::ControllerConfig;
use crate::dispatcher::{CommandSink, EventDispatcher};
use crate::error::{Error, Result};
use crate::lifecycle::SaLifecycle;
use crate::model::selector::is_icmp;
use crate::model::{
    ChildSaParams, Direction, IpsecLevel, IpsecMode, IpsecProtocol, Policy, PolicyAction, PolicyType,
    SaId, SaRequest, TrafficSelector,
};
use crate::store::PolicyStore;
use crate::transport::{Connector, KernelConnector, Protocol};

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    /// No dispatcher thread.
    Stopped,
    /// Dispatcher thread listening.
    Running,
    /// Exit requested; the dispatcher stops after its current receive.
    Stopping,
}

/// Policies to install with [`IpsecController::create_ipsec_policy`].
///
/// One kernel policy is installed for every pair of source and
/// destination CIDR blocks covering the selectors.
#[derive(Debug, Clone)]
pub struct PolicySpec {
    /// Source selectors.
    pub src_selectors: Vec<TrafficSelector>,
    /// Destination selectors.
    pub dst_selectors: Vec<TrafficSelector>,
    /// Direction.
    pub direction: Direction,
    /// Action.
    pub action: PolicyAction,
    /// Kernel priority.
    pub priority: u32,
    /// IPsec protocol of the SA request.
    pub protocol: IpsecProtocol,
    /// Encapsulation mode.
    pub mode: IpsecMode,
    /// Tunnel endpoints (tunnel mode only).
    pub tunnel: Option<(IpAddr, IpAddr)>,
    /// Request id binding SAs to the policies.
    pub reqid: u32,
    /// SAs are created on the first matching packet.
    pub autogen: bool,
    /// Install into the sub-policy table.
    pub sub: bool,
}

impl PolicySpec {
    /// Transport-mode protection of `src -> dst` traffic.
    pub fn protect(
        direction: Direction,
        src: Vec<TrafficSelector>,
        dst: Vec<TrafficSelector>,
        protocol: IpsecProtocol,
    ) -> Self {
        Self {
            src_selectors: src,
            dst_selectors: dst,
            direction,
            action: PolicyAction::Protect,
            priority: 0,
            protocol,
            mode: IpsecMode::Transport,
            tunnel: None,
            reqid: 0,
            autogen: false,
            sub: false,
        }
    }

    /// Switch to tunnel mode between `src` and `dst`.
    pub fn tunnel(mut self, src: IpAddr, dst: IpAddr) -> Self {
        self.mode = IpsecMode::Tunnel;
        self.tunnel = Some((src, dst));
        self
    }

    /// Set the action.
    pub fn action(mut self, action: PolicyAction) -> Self {
        self.action = action;
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the request id.
    pub fn reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    /// Mark the policies autogenerated.
    pub fn autogen(mut self, autogen: bool) -> Self {
        self.autogen = autogen;
        self
    }

    /// Install into the sub-policy table.
    pub fn sub(mut self, sub: bool) -> Self {
        self.sub = sub;
        self
    }

    fn sa_request(&self) -> Result<Option<SaRequest>> {
        if self.action != PolicyAction::Protect {
            return Ok(None);
        }
        let level = if self.autogen {
            IpsecLevel::Unique
        } else {
            IpsecLevel::Require
        };
        match (self.mode, self.tunnel) {
            (IpsecMode::Tunnel, Some((src, dst))) => {
                if src.is_ipv4() != dst.is_ipv4() {
                    return Err(Error::Config(format!(
                        "tunnel endpoints {} and {} differ in family",
                        src, dst
                    )));
                }
                Ok(Some(SaRequest::tunnel(self.protocol, level, self.reqid, src, dst)))
            }
            (IpsecMode::Tunnel, None) => Err(Error::Config("tunnel mode without tunnel endpoints".into())),
            (IpsecMode::Transport, Some(_)) => {
                Err(Error::Config("transport mode with tunnel endpoints".into()))
            }
            (IpsecMode::Transport, None) => Ok(Some(SaRequest::transport(self.protocol, level, self.reqid))),
        }
    }
}

/// Port fields of a selector, as a kernel policy can express them.
fn selector_port(ts: &TrafficSelector) -> Result<u16> {
    if ts.ports.is_any() {
        return Ok(0);
    }
    if ts.ports.start == ts.ports.end {
        return Ok(ts.ports.start);
    }
    if is_icmp(ts.ip_protocol) {
        // ICMP selectors encode type << 8 | code.
        return Err(Error::Config(format!(
            "ICMP type/code range {}-{} cannot be expressed by a kernel policy",
            ts.ports.start, ts.ports.end
        )));
    }
    Err(Error::Config(format!(
        "port range {}-{} cannot be expressed by a kernel policy",
        ts.ports.start, ts.ports.end
    )))
}

/// Kernel policies covering every pair of `src` and `dst` selectors.
fn expand(
    direction: Direction,
    src_selectors: &[TrafficSelector],
    dst_selectors: &[TrafficSelector],
) -> Result<Vec<Policy>> {
    let mut out = Vec::new();
    for src in src_selectors {
        for dst in dst_selectors {
            if src.start_addr.is_ipv4() != dst.start_addr.is_ipv4() {
                return Err(Error::Config(format!("selectors {} and {} differ in family", src, dst)));
            }
            let ip_protocol = match (src.ip_protocol, dst.ip_protocol) {
                (0, p) | (p, 0) => p,
                (a, b) if a == b => a,
                (a, b) => {
                    return Err(Error::Config(format!(
                        "selectors name different protocols {} and {}",
                        a, b
                    )));
                }
            };
            let (sport, dport) = if is_icmp(ip_protocol) {
                let icmp = selector_port(src)?;
                ((icmp >> 8), (icmp & 0xff))
            } else {
                (selector_port(src)?, selector_port(dst)?)
            };
            for src_block in src.to_prefixes() {
                for dst_block in dst.to_prefixes() {
                    out.push(Policy::new(direction, src_block, dst_block).with_protocol(ip_protocol, sport, dport));
                }
            }
        }
    }
    Ok(out)
}

/// Kernel IPsec control plane with one selected backend.
pub struct IpsecController {
    config: ControllerConfig,
    backend: Arc<Backend>,
    store: Arc<PolicyStore>,
    lifecycle: Arc<SaLifecycle>,
    exiting: Arc<AtomicBool>,
    state: Mutex<ControllerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IpsecController {
    /// Build a controller; `connector` opens its sockets.
    pub fn new(config: ControllerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(Backend::new(&config, connector));
        info!(backend = %backend.protocol(), "IPsec controller created");
        Ok(Self {
            config,
            backend,
            store: Arc::new(PolicyStore::new()),
            lifecycle: Arc::new(SaLifecycle::new()),
            exiting: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ControllerState::Stopped),
            worker: Mutex::new(None),
        })
    }

    /// Build a controller on real kernel sockets.
    pub fn with_kernel(config: ControllerConfig) -> Result<Self> {
        let connector = Arc::new(KernelConnector::new(config.buffer_size));
        Self::new(config, connector)
    }

    fn state_lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state_lock()
    }

    /// Selected backend.
    pub fn protocol(&self) -> Protocol {
        self.backend.protocol()
    }

    /// Configuration in use.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The policy mirror.
    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// The SA state machine.
    pub fn lifecycle(&self) -> &SaLifecycle {
        &self.lifecycle
    }

    /// Load the policy table and start the dispatcher thread.
    pub fn start(&self, sink: impl CommandSink + 'static) -> Result<()> {
        let mut state = self.state_lock();
        if *state != ControllerState::Stopped {
            return Err(Error::Config(format!("controller already {:?}", *state)));
        }
        let listener = self.backend.open_listener()?;
        self.store.refresh(&self.backend, false)?;

        self.exiting.store(false, Ordering::Release);
        let dispatcher = EventDispatcher::new(
            self.backend.clone(),
            self.store.clone(),
            self.lifecycle.clone(),
            Box::new(sink),
            self.exiting.clone(),
            self.config.timeout(),
        );
        let handle = std::thread::Builder::new()
            .name("xfkey-dispatcher".into())
            .spawn(move || dispatcher.run(listener))
            .map_err(|e| Error::transport("spawn dispatcher", e))?;
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *state = ControllerState::Running;
        info!("controller running");
        Ok(())
    }

    /// Ask the dispatcher to stop. It observes the request after its
    /// current receive returns, within one receive timeout.
    pub fn exit(&self) {
        let mut state = self.state_lock();
        if *state == ControllerState::Running {
            self.exiting.store(true, Ordering::Release);
            *state = ControllerState::Stopping;
            info!("controller stopping");
        }
    }

    /// Wait for the dispatcher thread after [`exit`](Self::exit).
    pub fn join(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("dispatcher thread panicked");
        }
        let mut state = self.state_lock();
        if *state == ControllerState::Stopping {
            *state = ControllerState::Stopped;
            info!("controller stopped");
        }
    }

    /// Allocate an SPI for an SA from `src` to `dst`.
    pub fn get_spi(&self, src: &IpAddr, dst: &IpAddr, protocol: IpsecProtocol) -> Result<u32> {
        self.lifecycle.get_spi(&self.backend, src, dst, protocol, 0)
    }

    /// Push a negotiated SA.
    pub fn create_ipsec_sa(&self, src: &IpAddr, dst: &IpAddr, params: &ChildSaParams) -> Result<()> {
        self.lifecycle.create_sa(&self.backend, src, dst, params)
    }

    /// Remove an SA, returning its SPI. A kernel rejection (for instance
    /// an unknown SPI) is returned as the error; the policy mirror is
    /// never touched.
    pub fn delete_ipsec_sa(&self, src: &IpAddr, dst: &IpAddr, protocol: IpsecProtocol, spi: u32) -> Result<u32> {
        let sa = SaId::new(*src, *dst, protocol, spi);
        self.lifecycle.delete_sa(&self.backend, &sa)?;
        Ok(spi)
    }

    /// Install policies; returns the kernel ids in installation order.
    pub fn create_ipsec_policy(&self, spec: &PolicySpec) -> Result<Vec<u32>> {
        let request = spec.sa_request()?;
        let mut policies = expand(spec.direction, &spec.src_selectors, &spec.dst_selectors)?;
        for policy in &mut policies {
            policy.priority = spec.priority;
            policy.autogen = spec.autogen;
            if spec.sub {
                policy.policy_type = PolicyType::Sub;
            }
            policy.action = spec.action;
            policy.sa_request = request.clone();
        }

        let mut installed: Vec<Policy> = Vec::with_capacity(policies.len());
        for mut policy in policies {
            match self.backend.add_policy(&policy, false) {
                Ok(id) => {
                    policy.id = id;
                    debug!(%policy, "policy installed");
                    self.store.insert(policy.clone());
                    installed.push(policy);
                }
                Err(e) => {
                    error!(error = %e, %policy, "policy install failed");
                    self.roll_back(&installed);
                    return Err(e);
                }
            }
        }
        Ok(installed.iter().map(|p| p.id).collect())
    }

    /// Best-effort removal of policies installed by a failed batch.
    fn roll_back(&self, installed: &[Policy]) {
        for policy in installed.iter().rev() {
            if let Err(e) = self.backend.delete_policy(policy) {
                warn!(error = %e, %policy, "rollback left policy installed");
            }
            self.store.remove(policy);
        }
    }

    /// Remove the policies covering every pair of selectors. Returns the
    /// number removed.
    pub fn delete_ipsec_policy(
        &self,
        src_selectors: &[TrafficSelector],
        dst_selectors: &[TrafficSelector],
        direction: Direction,
    ) -> Result<usize> {
        let policies = expand(direction, src_selectors, dst_selectors)?;
        let mut stale = false;
        for policy in &policies {
            self.backend.delete_policy(policy).inspect_err(|e| {
                error!(error = %e, %policy, "policy delete failed");
            })?;
            if self.store.remove(policy).is_none() {
                stale = true;
            }
        }
        if stale {
            warn!("deleted policy missing from mirror, refreshing");
            self.store.refresh(&self.backend, false)?;
        }
        Ok(policies.len())
    }

    /// Remove every kernel policy.
    pub fn flush_ipsec_policies(&self) -> Result<()> {
        self.backend.flush_policies()?;
        self.store.clear();
        info!("policies flushed");
        Ok(())
    }

    /// Remove every kernel SA.
    pub fn flush_ipsec_sas(&self) -> Result<()> {
        self.backend.flush_sas()?;
        self.lifecycle.clear();
        info!("SAs flushed");
        Ok(())
    }

    /// Log the mirrored policies and return the same text.
    pub fn print_policies(&self) -> String {
        let policies = self.store.snapshot();
        let mut out = String::new();
        for policy in &policies {
            let text = policy.to_string_tab(0);
            info!("\n{}", text);
            out.push_str(&text);
        }
        out
    }

    /// Reload the policy mirror from the kernel.
    pub fn update_policies(&self, show: bool) -> Result<usize> {
        self.store.refresh(&self.backend, show)
    }

    /// Mirrored policy with kernel id `id`. A miss reloads the mirror
    /// once before it is reported.
    pub fn get_policy_by_id(&self, id: u32) -> Result<Policy> {
        match self.store.get_by_id(id) {
            Err(e) if e.is_consistency() => {
                warn!(id, "policy missing from mirror, refreshing");
                self.store.refresh(&self.backend, false)?;
                self.store.get_by_id(id)
            }
            other => other,
        }
    }

    /// First mirrored policy protecting `ts_i -> ts_r`.
    pub fn find_policy(
        &self,
        ts_i: &TrafficSelector,
        ts_r: &TrafficSelector,
        direction: Direction,
        mode: IpsecMode,
        protocol: IpsecProtocol,
        tunnel: Option<(IpAddr, IpAddr)>,
    ) -> Option<Policy> {
        self.store.find_policy(ts_i, ts_r, direction, mode, protocol, tunnel)
    }

    /// Re-install every SA with an endpoint at `old` using `new`.
    pub fn update_ipsec_sa_addresses(&self, old: &IpAddr, new: &IpAddr) -> Result<usize> {
        self.lifecycle.update_addresses(&self.backend, old, new)
    }

    /// Move tunnel endpoints at `old` to `new` on every tunnel policy,
    /// then reload the mirror. Returns the number of policies updated.
    pub fn update_ipsec_policy_addresses(&self, old: &IpAddr, new: &IpAddr) -> Result<usize> {
        let mut updated = 0;
        for mut policy in self.store.snapshot() {
            let Some(req) = policy.sa_request.as_mut() else {
                continue;
            };
            let Some(mut endpoints) = req.tunnel_endpoints() else {
                continue;
            };
            if endpoints.src != *old && endpoints.dst != *old {
                continue;
            }
            if endpoints.src == *old {
                endpoints.src = *new;
            }
            if endpoints.dst == *old {
                endpoints.dst = *new;
            }
            req.set_tunnel_endpoints(endpoints);
            self.backend.add_policy(&policy, true)?;
            updated += 1;
        }
        self.store.refresh(&self.backend, false)?;
        if updated > 0 {
            info!(%old, %new, updated, "policy tunnel endpoints updated");
        }
        Ok(updated)
    }

    /// Narrow proposed selectors to the first OUT policy they overlap.
    ///
    /// With `assigned`, the initiator side is further narrowed to that
    /// address (a road-warrior client's pool address). Returns `None`
    /// when no policy overlaps.
    pub fn narrow_payload_ts(
        &self,
        ts_i: &TrafficSelector,
        ts_r: &TrafficSelector,
        mode: IpsecMode,
        protocol: IpsecProtocol,
        assigned: Option<IpAddr>,
    ) -> Option<(TrafficSelector, TrafficSelector)> {
        let ts_i = match assigned {
            Some(addr) => ts_i.intersect(&TrafficSelector::host(addr))?,
            None => *ts_i,
        };
        self.store.snapshot().iter().find_map(|p| {
            let req = p.sa_request.as_ref()?;
            if p.direction != Direction::Out || req.mode() != mode || req.protocol != protocol {
                return None;
            }
            let narrowed_i = p.src_traffic_selector().intersect(&ts_i)?;
            let narrowed_r = p.dst_traffic_selector().intersect(ts_r)?;
            debug!(policy = p.id, %narrowed_i, %narrowed_r, "selectors narrowed");
            Some((narrowed_i, narrowed_r))
        })
    }

    /// Check that selectors narrowed by the peer are covered by an
    /// installed OUT policy.
    pub fn check_narrow_payload_ts(
        &self,
        ts_i: &TrafficSelector,
        ts_r: &TrafficSelector,
        mode: IpsecMode,
        protocol: IpsecProtocol,
    ) -> bool {
        self.store.snapshot().iter().any(|p| {
            p.direction == Direction::Out
                && p.sa_request
                    .as_ref()
                    .is_some_and(|r| r.mode() == mode && r.protocol == protocol)
                && p.src_traffic_selector().contains(ts_i)
                && p.dst_traffic_selector().contains(ts_r)
        })
    }
}

impl Drop for IpsecController {
    fn drop(&mut self) {
        self.exit();
        self.join();
    }
}
