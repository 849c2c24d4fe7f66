//! Kernel SA state machine.
//!
//! ```text
//! NONE --GETSPI--> LARVAL --UPDATE--> MATURE --UPDATE--> MATURE --DELETE--> NONE
//! NONE --ADD (SPI known)-----------> MATURE
//! ```
//!
//! The kernel stays the source of truth; the manager only remembers which
//! SPIs it reserved and the last parameters it pushed, so a larval SA is
//! promoted with UPDATE and address changes can re-install SAs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::Result;
use crate::model::{ChildSaParams, IpsecProtocol, SaId};

/// Kernel state of a tracked SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaState {
    /// SPI reserved, no keys yet.
    Larval,
    /// Keyed and usable.
    Mature,
}

#[derive(Debug, Clone)]
struct Tracked {
    state: SaState,
    params: Option<ChildSaParams>,
}

/// Drives GETSPI / ADD / UPDATE / DELETE for kernel SAs.
#[derive(Debug, Default)]
pub struct SaLifecycle {
    sas: Mutex<HashMap<SaId, Tracked>>,
}

impl SaLifecycle {
    /// Manager with no tracked SAs.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SaId, Tracked>> {
        self.sas.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of `sa`, if tracked.
    pub fn state(&self, sa: &SaId) -> Option<SaState> {
        self.lock().get(sa).map(|t| t.state)
    }

    /// Number of tracked SAs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no SA is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Reserve an SPI for an SA from `src` to `dst`.
    pub fn get_spi(
        &self,
        backend: &Backend,
        src: &IpAddr,
        dst: &IpAddr,
        protocol: IpsecProtocol,
        reqid: u32,
    ) -> Result<u32> {
        let spi = backend.get_spi(src, dst, protocol, reqid).inspect_err(|e| {
            error!(error = %e, %src, %dst, %protocol, "SPI allocation failed");
        })?;
        self.lock().insert(
            SaId::new(*src, *dst, protocol, spi),
            Tracked {
                state: SaState::Larval,
                params: None,
            },
        );
        Ok(spi)
    }

    /// Push keys, algorithms and lifetimes for an SA.
    ///
    /// A larval or already mature SA is updated, an unknown SPI is added.
    /// Parameters are validated and algorithms resolved before the kernel
    /// is contacted.
    pub fn create_sa(&self, backend: &Backend, src: &IpAddr, dst: &IpAddr, params: &ChildSaParams) -> Result<()> {
        params.validate()?;
        let id = SaId::new(*src, *dst, params.protocol, params.spi);
        let update = self.state(&id).is_some();
        debug!(sa = %id, update, "installing SA");
        backend.add_sa(src, dst, params, update).inspect_err(|e| {
            error!(error = %e, sa = %id, "SA install failed");
        })?;
        self.lock().insert(
            id,
            Tracked {
                state: SaState::Mature,
                params: Some(params.clone()),
            },
        );
        Ok(())
    }

    /// Remove an SA from the kernel. Tracking ends even when the kernel no
    /// longer knows the SA.
    pub fn delete_sa(&self, backend: &Backend, sa: &SaId) -> Result<()> {
        let result = backend.delete_sa(sa);
        match &result {
            Ok(()) => {
                self.lock().remove(sa);
            }
            Err(e) if e.is_not_found() => {
                self.lock().remove(sa);
            }
            Err(_) => {}
        }
        result.inspect_err(|e| error!(error = %e, %sa, "SA delete failed"))
    }

    /// Forget an SA the kernel removed on its own (hard expire).
    pub fn forget(&self, sa: &SaId) {
        self.lock().remove(sa);
    }

    /// Forget every SA (after a flush).
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Move every mature SA with an endpoint equal to `old` over to `new`.
    ///
    /// The kernel keys SAs by (dst, protocol, SPI). When the destination
    /// changes the new SA is added before the old one is deleted. When only
    /// the source moves the key is unchanged, so the old SA is deleted first
    /// and restored if the re-add fails.
    ///
    /// Returns the number of SAs moved. Stops at the first failure.
    pub fn update_addresses(&self, backend: &Backend, old: &IpAddr, new: &IpAddr) -> Result<usize> {
        let affected: Vec<(SaId, ChildSaParams)> = self
            .lock()
            .iter()
            .filter(|(id, t)| t.state == SaState::Mature && (id.src == *old || id.dst == *old))
            .filter_map(|(id, t)| t.params.clone().map(|p| (*id, p)))
            .collect();

        let mut moved = 0;
        for (id, params) in affected {
            let swap = |a: IpAddr| if a == *old { *new } else { a };
            let (src, dst) = (swap(id.src), swap(id.dst));
            if dst == id.dst {
                backend.delete_sa(&id)?;
                if let Err(e) = backend.add_sa(&src, &dst, &params, false) {
                    if let Err(restore) = backend.add_sa(&id.src, &id.dst, &params, false) {
                        error!(error = %restore, sa = %id, "SA lost after failed address change");
                        self.lock().remove(&id);
                    }
                    return Err(e);
                }
            } else {
                backend.add_sa(&src, &dst, &params, false)?;
                if let Err(e) = backend.delete_sa(&id) {
                    warn!(error = %e, sa = %id, "old SA not removed after address change");
                }
            }
            let mut sas = self.lock();
            sas.remove(&id);
            sas.insert(
                SaId::new(src, dst, id.protocol, id.spi),
                Tracked {
                    state: SaState::Mature,
                    params: Some(params),
                },
            );
            moved += 1;
        }
        if moved > 0 {
            info!(%old, %new, moved, "SA addresses updated");
        }
        Ok(moved)
    }
}
