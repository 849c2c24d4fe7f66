//! Kernel IPsec control plane for an IKEv2 daemon.
//!
//! This crate installs and removes Security Associations and Security
//! Policies in the Linux kernel, keeps an in-memory mirror of the policy
//! table, and turns kernel ACQUIRE and EXPIRE notifications into commands
//! for the IKE core. Two interchangeable backends are supported: PF_KEY v2
//! and NETLINK_XFRM; exactly one is selected per controller.
//!
//! The library is blocking. Synchronous requests run on the caller's
//! thread over a pooled control socket; notifications are handled by one
//! dispatcher thread started with [`IpsecController::start`].
//!
//! # Features
//!
//! - `lab` - In-memory simulated kernel ([`lab::SimKernel`]) for tests and demos
//! - `full` - All features enabled
//!
//! # Example
//!
//! ```ignore
//! use std::sync::mpsc;
//! use xfkey::{ControllerConfig, IpsecController, IkeCommand, Protocol};
//!
//! fn main() -> xfkey::Result<()> {
//!     let controller = IpsecController::with_kernel(ControllerConfig::new().backend(Protocol::Xfrm))?;
//!     controller.update_policies(true)?;
//!
//!     let (tx, rx) = mpsc::channel();
//!     controller.start(tx)?;
//!     while let Ok(command) = rx.recv() {
//!         match command {
//!             IkeCommand::StartNegotiation { policy_id, .. } => println!("acquire for policy {}", policy_id),
//!             IkeCommand::RekeyChildSa { sa, .. } => println!("rekey {}", sa),
//!             IkeCommand::DeleteChildSa { sa, .. } => println!("expired {}", sa),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod model;
pub mod pfkey;
pub mod store;
pub mod transport;
pub mod wire;
pub mod xfrm;

#[cfg(feature = "lab")]
pub mod lab;

// Re-export common types at crate root for convenience
pub use config::ControllerConfig;
pub use controller::{ControllerState, IpsecController, PolicySpec};
pub use dispatcher::CommandSink;
pub use error::{Error, ErrorClass, Result};
pub use event::{Acquire, Expire, IkeCommand, KernelEvent};
pub use model::{
    ChildSaParams, Direction, EncryptionAlgorithm, IntegrityAlgorithm, IpsecLevel, IpsecMode, IpsecProtocol,
    Lifetime, Policy, PolicyAction, PolicyType, PortRange, SaId, TrafficSelector,
};
pub use transport::Protocol;
