//! Protocol-neutral data model shared by both backends.

pub mod algorithm;
pub mod policy;
pub mod sa;
pub mod selector;

pub use algorithm::{EncryptionAlgorithm, IntegrityAlgorithm};
pub use policy::{
    Direction, IpsecLevel, IpsecMode, IpsecProtocol, Policy, PolicyAction, PolicyType, Ports,
    SaRequest, TunnelEndpoints,
};
pub use sa::{ChildSaParams, Keyed, Lifetime, NatTraversal, SaEntry, SaId};
pub use selector::{PortRange, TrafficSelector};
