//! ipsecctl policy - security policy management.

use std::net::IpAddr;

use clap::{Args, Subcommand};
use xfkey::{IpsecController, PolicySpec, TrafficSelector};

use super::{Action, Dir, Output, Proto, parse_selector};

#[derive(Args)]
pub struct PolicyCmd {
    #[command(subcommand)]
    action: Option<PolicyAction>,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show installed policies.
    #[command(visible_alias = "ls", visible_alias = "list")]
    Show,

    /// Install policies for every source/destination pair.
    Add(AddArgs),

    /// Remove the policies for every source/destination pair.
    #[command(visible_alias = "delete")]
    Del(SelectorArgs),

    /// Remove every policy.
    Flush,

    /// Print the number of installed policies.
    Count,
}

#[derive(Args)]
struct SelectorArgs {
    /// Source selector (ADDR[/PREFIX]); repeat for several.
    #[arg(long = "src", required = true, value_parser = parse_selector)]
    src: Vec<TrafficSelector>,

    /// Destination selector (ADDR[/PREFIX]); repeat for several.
    #[arg(long = "dst", required = true, value_parser = parse_selector)]
    dst: Vec<TrafficSelector>,

    /// Policy direction.
    #[arg(long, value_enum)]
    dir: Dir,

    /// Upper-layer protocol number (0 for any).
    #[arg(long, default_value_t = 0)]
    ulproto: u8,

    /// Source port (single port).
    #[arg(long)]
    sport: Option<u16>,

    /// Destination port (single port).
    #[arg(long)]
    dport: Option<u16>,
}

impl SelectorArgs {
    fn selectors(&self) -> anyhow::Result<(Vec<TrafficSelector>, Vec<TrafficSelector>)> {
        if self.ulproto == 0 && (self.sport.is_some() || self.dport.is_some()) {
            anyhow::bail!("--sport/--dport need --ulproto");
        }
        let with = |list: &[TrafficSelector], port: Option<u16>| -> Vec<TrafficSelector> {
            list.iter()
                .map(|ts| TrafficSelector {
                    ip_protocol: self.ulproto,
                    ports: port.map(xfkey::PortRange::single).unwrap_or(ts.ports),
                    ..*ts
                })
                .collect()
        };
        Ok((with(&self.src, self.sport), with(&self.dst, self.dport)))
    }
}

#[derive(Args)]
struct AddArgs {
    #[command(flatten)]
    selectors: SelectorArgs,

    /// IPsec protocol of the SA request.
    #[arg(long, value_enum, default_value = "esp")]
    proto: Proto,

    /// Policy action.
    #[arg(long, value_enum, default_value = "protect")]
    action: Action,

    /// Tunnel mode source endpoint.
    #[arg(long, requires = "tunnel_dst")]
    tunnel_src: Option<IpAddr>,

    /// Tunnel mode destination endpoint.
    #[arg(long, requires = "tunnel_src")]
    tunnel_dst: Option<IpAddr>,

    /// Request id binding SAs to the policy.
    #[arg(long, default_value_t = 0)]
    reqid: u32,

    /// Kernel priority.
    #[arg(long, default_value_t = 0)]
    priority: u32,

    /// Install into the sub-policy table.
    #[arg(long)]
    sub: bool,
}

impl PolicyCmd {
    pub fn run(&self, controller: &IpsecController, output: Output) -> anyhow::Result<()> {
        match &self.action {
            None | Some(PolicyAction::Show) => {
                controller.update_policies(false)?;
                let policies = controller.store().snapshot();
                output.print(&policies, || controller.print_policies())
            }
            Some(PolicyAction::Add(args)) => {
                let (src, dst) = args.selectors.selectors()?;
                let mut spec = PolicySpec::protect(args.selectors.dir.into(), src, dst, args.proto.into())
                    .action(args.action.into())
                    .priority(args.priority)
                    .reqid(args.reqid)
                    .sub(args.sub);
                if let (Some(tsrc), Some(tdst)) = (args.tunnel_src, args.tunnel_dst) {
                    spec = spec.tunnel(tsrc, tdst);
                }
                let ids = controller.create_ipsec_policy(&spec)?;
                output.print(&ids, || {
                    ids.iter().map(|id| format!("installed policy {}\n", id)).collect()
                })
            }
            Some(PolicyAction::Del(args)) => {
                let (src, dst) = args.selectors()?;
                let removed = controller.delete_ipsec_policy(&src, &dst, args.dir.into())?;
                output.print(&removed, || format!("removed {} policies\n", removed))
            }
            Some(PolicyAction::Flush) => {
                controller.flush_ipsec_policies()?;
                Ok(())
            }
            Some(PolicyAction::Count) => {
                let count = controller.update_policies(false)?;
                output.print(&count, || format!("{}\n", count))
            }
        }
    }
}
