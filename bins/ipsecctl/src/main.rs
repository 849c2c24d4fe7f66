//! ipsecctl command - kernel IPsec policy and SA management.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use xfkey::{ControllerConfig, IpsecController, Protocol};

use crate::commands::Output;

/// Kernel key management interface.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum Backend {
    /// NETLINK_XFRM.
    Xfrm,
    /// PF_KEY v2.
    Pfkey,
}

impl From<Backend> for Protocol {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Xfrm => Protocol::Xfrm,
            Backend::Pfkey => Protocol::Pfkey,
        }
    }
}

#[derive(Parser)]
#[command(name = "ipsecctl", version, about = "Kernel IPsec policy and SA tool")]
struct Cli {
    /// Kernel interface (overrides the configuration file).
    #[arg(short = 'b', long, value_enum)]
    backend: Option<Backend>,

    /// JSON configuration file.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long)]
    pretty: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage security policies.
    #[command(visible_alias = "p", visible_alias = "pol")]
    Policy(commands::policy::PolicyCmd),

    /// Manage security associations.
    #[command(visible_alias = "s", visible_alias = "state")]
    Sa(commands::sa::SaCmd),

    /// Print acquire and expire notifications as IKE commands.
    #[command(visible_alias = "m", visible_alias = "mon")]
    Monitor(commands::monitor::MonitorCmd),
}

impl Cli {
    fn controller_config(&self) -> anyhow::Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::new(),
        };
        if let Some(backend) = self.backend {
            config = config.backend(backend.into());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let output = Output {
        json: cli.json,
        pretty: cli.pretty,
    };

    let controller = IpsecController::with_kernel(cli.controller_config()?)?;

    let result = match cli.command {
        Command::Policy(cmd) => cmd.run(&controller, output),
        Command::Sa(cmd) => cmd.run(&controller, output),
        Command::Monitor(cmd) => cmd.run(&controller, output).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
