// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `ufs` — serve a host directory tree over 9P

use anyhow::Result;
use clap::Parser;
use tracing::info;

use ninefs::srv::{Srv, SrvConfig};
use ninefs::ufs::Ufs;

/// Serve a host directory tree to 9P clients
#[derive(Parser, Debug)]
struct CliArgs {
    /// Network address to listen on
    #[arg(long, default_value = "127.0.0.1:5640")]
    addr: String,

    /// Root of the served tree
    #[arg(long, default_value = "/")]
    root: String,

    /// Debug level; greater than 0 logs every message
    #[arg(short = 'd', long, default_value_t = 0)]
    debug: u32,

    /// Refuse the 9P2000.u dialect even if a client offers it
    #[arg(long)]
    no_dotu: bool,

    /// Server identity used in log messages
    #[arg(long, default_value = "ufs")]
    id: String,
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let default_level = if args.debug > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = SrvConfig {
        dotu: !args.no_dotu,
        debug: args.debug,
        id: args.id,
    };
    info!(addr = %args.addr, root = %args.root, dotu = config.dotu, "serving");

    let srv = Srv::new(Ufs::new(args.root), config);
    srv.start_net_listener("tcp", &args.addr)?;
    Ok(())
}
