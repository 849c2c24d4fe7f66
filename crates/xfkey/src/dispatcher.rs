//! Listener thread turning kernel notifications into IKE commands.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::Result;
use crate::event::{Acquire, Expire, IkeCommand, KernelEvent};
use crate::lifecycle::SaLifecycle;
use crate::model::{IpsecMode, Policy, PolicyType};
use crate::store::PolicyStore;
use crate::transport::Transport;

/// Receiver of the commands the dispatcher produces.
pub trait CommandSink: Send {
    /// Hand a command to the IKE core.
    fn deliver(&self, command: IkeCommand);

    /// An acquire named no known policy, even after a refresh.
    fn policy_not_found(&self, acquire: &Acquire) {
        warn!(
            policy = ?acquire.policy_id,
            src = %acquire.src,
            dst = %acquire.dst,
            "no policy for acquire, ignoring"
        );
    }
}

impl CommandSink for mpsc::Sender<IkeCommand> {
    fn deliver(&self, command: IkeCommand) {
        if self.send(command).is_err() {
            debug!("command receiver gone, dropping command");
        }
    }
}

/// Dispatches broadcast messages until the exiting flag is set.
pub struct EventDispatcher {
    backend: Arc<Backend>,
    store: Arc<PolicyStore>,
    lifecycle: Arc<SaLifecycle>,
    sink: Box<dyn CommandSink>,
    exiting: Arc<AtomicBool>,
    timeout: Duration,
}

impl EventDispatcher {
    /// Create a dispatcher; `exiting` is shared with the controller.
    pub fn new(
        backend: Arc<Backend>,
        store: Arc<PolicyStore>,
        lifecycle: Arc<SaLifecycle>,
        sink: Box<dyn CommandSink>,
        exiting: Arc<AtomicBool>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            lifecycle,
            sink,
            exiting,
            timeout,
        }
    }

    /// Receive loop. Returns once the exiting flag is observed, at most one
    /// receive timeout after it was set; the listener is closed on return.
    pub fn run(self, mut listener: Box<dyn Transport>) {
        info!(backend = %self.backend.protocol(), "event dispatcher started");
        while !self.exiting.load(Ordering::Acquire) {
            match listener.recv(Some(self.timeout)) {
                Ok(Some(data)) => self.handle_datagram(&data),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "listener socket failed, reopening");
                    match self.backend.open_listener() {
                        Ok(fresh) => listener = fresh,
                        Err(e) => {
                            error!(error = %e, "cannot reopen listener");
                            std::thread::sleep(self.timeout);
                        }
                    }
                }
            }
        }
        info!("event dispatcher stopped");
    }

    /// Decode one datagram and act on every event in it. Malformed
    /// messages are logged and dropped.
    pub fn handle_datagram(&self, data: &[u8]) {
        for event in self.backend.decode_events(data) {
            match event {
                Ok(KernelEvent::Acquire(acquire)) => self.handle_acquire(&acquire),
                Ok(KernelEvent::Expire(expire)) => self.handle_expire(&expire),
                Err(e) => warn!(error = %e, len = data.len(), "dropping malformed kernel message"),
            }
        }
    }

    fn handle_expire(&self, expire: &Expire) {
        debug!(sa = %expire.sa, hard = expire.hard, "expire");
        if expire.hard {
            self.lifecycle.forget(&expire.sa);
        }
        self.sink.deliver(IkeCommand::for_expire(expire));
    }

    /// Resolve the policy behind an acquire: by id when the kernel names
    /// one (with a single refresh on a miss), otherwise by endpoints.
    fn resolve(&self, acquire: &Acquire) -> Result<Option<Policy>> {
        let Some(id) = acquire.policy_id else {
            return Ok(self
                .store
                .find_by_endpoints(&acquire.src, &acquire.dst, acquire.protocol));
        };
        match self.store.get_by_id(id) {
            Ok(policy) => Ok(Some(policy)),
            Err(e) if e.is_consistency() => {
                warn!(policy = id, "policy mirror stale, refreshing");
                self.store.refresh(&self.backend, false)?;
                Ok(self.store.get_by_id(id).ok())
            }
            Err(e) => Err(e),
        }
    }

    fn handle_acquire(&self, acquire: &Acquire) {
        debug!(policy = ?acquire.policy_id, src = %acquire.src, dst = %acquire.dst, "acquire");
        let policy = match self.resolve(acquire) {
            Ok(Some(policy)) => policy,
            Ok(None) => return self.sink.policy_not_found(acquire),
            Err(e) => {
                error!(error = %e, "acquire resolution failed");
                return;
            }
        };
        let Some(request) = &policy.sa_request else {
            warn!(policy = policy.id, "acquire for a policy without SA request");
            return;
        };
        let mut tunnel: Option<(IpAddr, IpAddr)> = request.tunnel_endpoints().map(|t| (t.src, t.dst));
        if tunnel.is_none() && policy.policy_type == PolicyType::Sub {
            tunnel = self
                .store
                .parent_of(&policy)
                .and_then(|parent| parent.sa_request)
                .and_then(|r| r.tunnel_endpoints())
                .map(|t| (t.src, t.dst));
        }
        self.sink.deliver(IkeCommand::StartNegotiation {
            policy_id: policy.id,
            ts_i: policy.src_traffic_selector(),
            ts_r: policy.dst_traffic_selector(),
            tunnel,
            mode: if tunnel.is_some() {
                IpsecMode::Tunnel
            } else {
                request.mode()
            },
            protocol: request.protocol,
            reqid: request.request_id,
        });
    }
}
