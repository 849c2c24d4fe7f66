//! Controller configuration.
//!
//! Built fluently or loaded from JSON:
//!
//! ```ignore
//! let config = ControllerConfig::new()
//!     .backend(Protocol::Xfrm)
//!     .receive_timeout(Duration::from_millis(500))
//!     .spi_range(0xc000_0000, 0xc0ff_ffff);
//! config.validate()?;
//!
//! let config: ControllerConfig = serde_json::from_str(r#"{ "backend": "pfkey" }"#)?;
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::Protocol;

/// Settings of one [`IpsecController`](crate::IpsecController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Kernel interface.
    pub backend: Protocol,
    /// Listener receive timeout in milliseconds; bounds shutdown latency.
    pub receive_timeout_ms: u64,
    /// Socket receive buffer size in bytes.
    pub buffer_size: usize,
    /// SPI allocation range (inclusive).
    pub spi_range: (u32, u32),
    /// Replay window for SAs whose parameters carry none.
    pub replay_window: u8,
    /// Soft lifetime as a fraction of the hard lifetime.
    pub soft_ratio: f64,
    /// Maximum number of idle control sockets kept open.
    pub pool_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend: Protocol::Xfrm,
            receive_timeout_ms: 1000,
            buffer_size: 64 * 1024,
            spi_range: (0xc000_0000, 0xcfff_ffff),
            replay_window: 32,
            soft_ratio: 0.8,
            pool_size: 8,
        }
    }
}

impl ControllerConfig {
    /// Default configuration (XFRM backend).
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON configuration file. Missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Select the backend.
    pub fn backend(mut self, backend: Protocol) -> Self {
        self.backend = backend;
        self
    }

    /// Set the listener receive timeout.
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the socket receive buffer size.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Set the SPI allocation range.
    pub fn spi_range(mut self, min: u32, max: u32) -> Self {
        self.spi_range = (min, max);
        self
    }

    /// Set the default replay window.
    pub fn replay_window(mut self, window: u8) -> Self {
        self.replay_window = window;
        self
    }

    /// Set the soft lifetime ratio.
    pub fn soft_ratio(mut self, ratio: f64) -> Self {
        self.soft_ratio = ratio;
        self
    }

    /// Set the idle control socket cap.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Listener receive timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Reject settings no backend can run with.
    pub fn validate(&self) -> Result<()> {
        let (min, max) = self.spi_range;
        if min > max {
            return Err(Error::Config(format!(
                "empty SPI range 0x{:08x}..0x{:08x}",
                min, max
            )));
        }
        // SPIs 1..=255 are reserved by IANA.
        if max < 256 {
            return Err(Error::Config(format!(
                "SPI range 0x{:08x}..0x{:08x} lies in the reserved range",
                min, max
            )));
        }
        if self.receive_timeout_ms == 0 {
            return Err(Error::Config("receive timeout must be non-zero".into()));
        }
        if !(self.soft_ratio > 0.0 && self.soft_ratio < 1.0) {
            return Err(Error::Config(format!(
                "soft lifetime ratio {} outside (0, 1)",
                self.soft_ratio
            )));
        }
        if self.buffer_size < 4096 {
            return Err(Error::Config(format!(
                "receive buffer of {} bytes is too small",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.spi_range, (0xc000_0000, 0xcfff_ffff));
    }

    #[test]
    fn builder() {
        let config = ControllerConfig::new()
            .backend(Protocol::Pfkey)
            .receive_timeout(Duration::from_millis(250))
            .spi_range(0x1000, 0x2000)
            .pool_size(2);
        assert_eq!(config.backend, Protocol::Pfkey);
        assert_eq!(config.receive_timeout_ms, 250);
        assert_eq!(config.pool_size, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases = [
            ControllerConfig::new().spi_range(0x2000, 0x1000),
            ControllerConfig::new().spi_range(1, 255),
            ControllerConfig::new().receive_timeout(Duration::ZERO),
            ControllerConfig::new().soft_ratio(1.0),
            ControllerConfig::new().soft_ratio(0.0),
            ControllerConfig::new().buffer_size(16),
        ];
        for config in cases {
            assert!(config.validate().unwrap_err().is_configuration(), "{:?}", config);
        }
    }

    #[test]
    fn json_with_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{ "backend": "pfkey", "receive_timeout_ms": 200 }"#).unwrap();
        assert_eq!(config.backend, Protocol::Pfkey);
        assert_eq!(config.receive_timeout_ms, 200);
        assert_eq!(config.replay_window, 32);

        assert!(serde_json::from_str::<ControllerConfig>(r#"{ "backend": "ipsec" }"#).is_err());
        assert!(serde_json::from_str::<ControllerConfig>(r#"{ "colour": 1 }"#).is_err());
    }
}
