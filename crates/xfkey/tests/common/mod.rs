//! Common test utilities for integration tests.
//!
//! Every test runs a controller against its own `SimKernel`, so tests are
//! isolated and need no privileges. Tests that must hold for both kernel
//! interfaces loop over [`BACKENDS`].

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use xfkey::lab::SimKernel;
use xfkey::{
    Acquire, CommandSink, ControllerConfig, EncryptionAlgorithm, IkeCommand, IntegrityAlgorithm, IpsecController,
    PortRange, Protocol, Result, TrafficSelector,
};

/// Both kernel interfaces.
pub const BACKENDS: [Protocol; 2] = [Protocol::Xfrm, Protocol::Pfkey];

/// How long a test waits for the dispatcher.
pub const WAIT: Duration = Duration::from_secs(2);

/// What the dispatcher handed to the IKE side.
#[derive(Debug)]
pub enum Seen {
    Command(IkeCommand),
    NoPolicy(Acquire),
}

/// Sink forwarding everything to a channel.
pub struct Probe(pub Sender<Seen>);

impl CommandSink for Probe {
    fn deliver(&self, command: IkeCommand) {
        let _ = self.0.send(Seen::Command(command));
    }

    fn policy_not_found(&self, acquire: &Acquire) {
        let _ = self.0.send(Seen::NoPolicy(acquire.clone()));
    }
}

/// A simulated kernel and a controller talking to it.
pub struct Lab {
    pub kernel: SimKernel,
    pub controller: IpsecController,
}

impl Lab {
    /// Controller on a fresh kernel, dispatcher not started.
    pub fn new(backend: Protocol) -> Result<Self> {
        init_tracing();
        let kernel = SimKernel::new();
        let config = ControllerConfig::new()
            .backend(backend)
            .receive_timeout(Duration::from_millis(20))
            .pool_size(2);
        let controller = IpsecController::new(config, Arc::new(kernel.clone()))?;
        Ok(Self { kernel, controller })
    }

    /// Controller with its dispatcher running.
    pub fn started(backend: Protocol) -> Result<(Self, Receiver<Seen>)> {
        let lab = Self::new(backend)?;
        let (tx, rx) = mpsc::channel();
        lab.controller.start(Probe(tx))?;
        Ok((lab, rx))
    }

    /// Wait until `n` listening sockets are open.
    pub fn wait_listeners(&self, n: usize) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.kernel.listeners() == n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

/// Next command delivered to the IKE side, if any arrives in time.
pub fn next_command(rx: &Receiver<Seen>) -> Option<IkeCommand> {
    match rx.recv_timeout(WAIT) {
        Ok(Seen::Command(command)) => Some(command),
        _ => None,
    }
}

/// Route dispatcher logs through the test harness (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Any-protocol selector for `addr/prefix`.
pub fn net(addr: &str, prefix: u8) -> TrafficSelector {
    TrafficSelector::from_prefix(ip(addr), prefix, 0, PortRange::ANY)
}

/// Keyed ESP parameters for `spi`.
pub fn esp(spi: u32) -> xfkey::ChildSaParams {
    xfkey::ChildSaParams::esp(spi)
        .encryption(EncryptionAlgorithm::AesCbc, vec![0x11; 16])
        .integrity(IntegrityAlgorithm::HmacSha256_128, vec![0x22; 32])
}
