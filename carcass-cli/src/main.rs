//! # carcass
//!
//! Manage environments of virtual machines: a virtual network and the
//! machines attached to it, on a libvirt hypervisor.
//!
//! ## Usage
//! ```bash
//! carcass list -a
//! carcass stop -f lab
//! carcass image add debian11 https://cloud.debian.org/images/cloud/bullseye/latest/debian-11-generic-amd64.qcow2
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};

mod cli;
mod commands;

use carcass_infra::{LogFormat, Settings};
use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load_or_default(args.config.as_deref())?
        .with_cli_overrides(&args.overrides());

    match settings.logging.format {
        LogFormat::Pretty => carcass_common::init_logging(&settings.logging.level)?,
        LogFormat::Json => carcass_common::init_logging_json(&settings.logging.level)?,
    }

    debug!(?settings, "Configuration loaded");

    let client = settings.connect().await?;
    info!(uri = %client.uri(), "Connected");

    let result = commands::run(&client, &settings, args.command).await;
    client.close().await;
    result
}
