//! ipsecctl monitor - watch kernel notifications.
//!
//! Starts the controller's dispatcher and prints every command it would
//! hand to an IKE daemon until interrupted.

use clap::Args;
use tokio::sync::mpsc;
use xfkey::{CommandSink, IkeCommand, IpsecController};

use super::Output;

/// Forwards dispatcher commands into the async runtime.
struct ChannelSink(mpsc::UnboundedSender<IkeCommand>);

impl CommandSink for ChannelSink {
    fn deliver(&self, command: IkeCommand) {
        let _ = self.0.send(command);
    }
}

#[derive(Args)]
pub struct MonitorCmd {
    /// Dump the policy table before listening.
    #[arg(long)]
    show: bool,

    /// Stop after this many notifications.
    #[arg(short = 'n', long)]
    count: Option<usize>,
}

fn describe(command: &IkeCommand) -> String {
    match command {
        IkeCommand::StartNegotiation {
            policy_id,
            ts_i,
            ts_r,
            tunnel,
            mode,
            protocol,
            reqid,
        } => {
            let mut line = format!(
                "acquire policy {} {} -> {} {} {:?} reqid {}",
                policy_id, ts_i, ts_r, protocol, mode, reqid
            );
            if let Some((src, dst)) = tunnel {
                line.push_str(&format!(" tunnel {} -> {}", src, dst));
            }
            line
        }
        IkeCommand::RekeyChildSa { sa, reqid } => format!("soft expire {} reqid {}", sa, reqid),
        IkeCommand::DeleteChildSa { sa, reqid } => format!("hard expire {} reqid {}", sa, reqid),
    }
}

impl MonitorCmd {
    pub async fn run(&self, controller: &IpsecController, output: Output) -> anyhow::Result<()> {
        if self.show {
            controller.update_policies(true)?;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.start(ChannelSink(tx))?;

        let mut seen = 0;
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    output.print(&command, || format!("{}\n", describe(&command)))?;
                    seen += 1;
                    if self.count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        // The dispatcher blocks on its socket; wait for it off the runtime.
        tokio::task::block_in_place(|| {
            controller.exit();
            controller.join();
        });
        Ok(())
    }
}
