//! ipsecctl sa - security association management.

use std::net::IpAddr;

use clap::{Args, Subcommand};
use serde::Serialize;
use xfkey::IpsecController;

use super::{Output, Proto, parse_spi};

#[derive(Args)]
pub struct SaCmd {
    #[command(subcommand)]
    action: SaAction,
}

#[derive(Subcommand)]
enum SaAction {
    /// Reserve an SPI for an inbound SA, leaving a larval SA.
    Getspi(Endpoints),

    /// Remove one SA.
    #[command(visible_alias = "delete")]
    Del {
        #[command(flatten)]
        endpoints: Endpoints,

        /// SPI (decimal or 0x-prefixed hex).
        #[arg(long, value_parser = parse_spi)]
        spi: u32,
    },

    /// Remove every SA.
    Flush,
}

#[derive(Args)]
struct Endpoints {
    /// SA source address.
    #[arg(long)]
    src: IpAddr,

    /// SA destination address.
    #[arg(long)]
    dst: IpAddr,

    /// IPsec protocol.
    #[arg(long, value_enum, default_value = "esp")]
    proto: Proto,
}

#[derive(Serialize)]
struct SpiReply {
    src: IpAddr,
    dst: IpAddr,
    spi: String,
}

impl SaCmd {
    pub fn run(&self, controller: &IpsecController, output: Output) -> anyhow::Result<()> {
        match &self.action {
            SaAction::Getspi(ep) => {
                let spi = controller.get_spi(&ep.src, &ep.dst, ep.proto.into())?;
                let reply = SpiReply {
                    src: ep.src,
                    dst: ep.dst,
                    spi: format!("0x{:08x}", spi),
                };
                output.print(&reply, || format!("src {} dst {} spi {}\n", reply.src, reply.dst, reply.spi))
            }
            SaAction::Del { endpoints: ep, spi } => {
                controller.delete_ipsec_sa(&ep.src, &ep.dst, ep.proto.into(), *spi)?;
                Ok(())
            }
            SaAction::Flush => {
                controller.flush_ipsec_sas()?;
                Ok(())
            }
        }
    }
}
