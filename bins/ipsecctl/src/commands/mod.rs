//! Subcommand implementations and shared argument types.

pub mod monitor;
pub mod policy;
pub mod sa;

use std::io::Write;
use std::net::IpAddr;

use clap::ValueEnum;
use serde::Serialize;
use xfkey::{Direction, IpsecProtocol, PolicyAction, PortRange, TrafficSelector};

/// Output settings from the global flags.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub pretty: bool,
}

impl Output {
    /// Print `value` as JSON, or `text` otherwise.
    pub fn print<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        let mut stdout = std::io::stdout().lock();
        if self.json {
            if self.pretty {
                serde_json::to_writer_pretty(&mut stdout, value)?;
            } else {
                serde_json::to_writer(&mut stdout, value)?;
            }
            writeln!(stdout)?;
        } else {
            write!(stdout, "{}", text())?;
        }
        Ok(())
    }
}

/// Policy direction.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum Dir {
    In,
    Out,
    Fwd,
}

impl From<Dir> for Direction {
    fn from(dir: Dir) -> Self {
        match dir {
            Dir::In => Direction::In,
            Dir::Out => Direction::Out,
            Dir::Fwd => Direction::Forward,
        }
    }
}

/// IPsec protocol.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum Proto {
    Esp,
    Ah,
}

impl From<Proto> for IpsecProtocol {
    fn from(proto: Proto) -> Self {
        match proto {
            Proto::Esp => IpsecProtocol::Esp,
            Proto::Ah => IpsecProtocol::Ah,
        }
    }
}

/// What a policy does with matching traffic.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum Action {
    Protect,
    Bypass,
    Discard,
}

impl From<Action> for PolicyAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Protect => PolicyAction::Protect,
            Action::Bypass => PolicyAction::Bypass,
            Action::Discard => PolicyAction::Discard,
        }
    }
}

/// Parse `ADDR[/PREFIX]` into an any-protocol selector.
pub fn parse_selector(s: &str) -> Result<TrafficSelector, String> {
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (s, None),
    };
    let addr: IpAddr = addr.parse().map_err(|_| format!("invalid address '{}'", addr))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().map_err(|_| format!("invalid prefix length '{}'", p))?,
        None => max,
    };
    if prefix > max {
        return Err(format!("prefix length {} exceeds {}", prefix, max));
    }
    Ok(TrafficSelector::from_prefix(addr, prefix, 0, PortRange::ANY))
}

/// Parse an SPI given in decimal or as `0x`-prefixed hex.
pub fn parse_spi(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(0) => Err("SPI 0 is reserved".into()),
        Ok(spi) => Ok(spi),
        Err(_) => Err(format!("invalid SPI '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        let ts = parse_selector("10.0.0.0/24").unwrap();
        assert_eq!(ts.start_addr, "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(ts.end_addr, "10.0.0.255".parse::<IpAddr>().unwrap());

        let host = parse_selector("2001:db8::1").unwrap();
        assert_eq!(host.start_addr, host.end_addr);

        assert!(parse_selector("10.0.0.0/33").is_err());
        assert!(parse_selector("not-an-ip").is_err());
    }

    #[test]
    fn test_parse_spi() {
        assert_eq!(parse_spi("0xc0000100"), Ok(0xc000_0100));
        assert_eq!(parse_spi("4096"), Ok(4096));
        assert!(parse_spi("0").is_err());
        assert!(parse_spi("0xzz").is_err());
    }
}
