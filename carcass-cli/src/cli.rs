//! Command-line argument parsing.

use std::path::PathBuf;

use carcass_infra::CliOverrides;
use clap::{Args as ClapArgs, Parser, Subcommand};

/// carcass - manage environments of virtual machines on libvirt
#[derive(Parser, Debug)]
#[command(name = "carcass")]
#[command(about = "Manage environments of virtual machines on libvirt")]
#[command(version)]
pub struct Args {
    /// Hypervisor connection URI
    #[arg(short = 'c', long = "connect", env = "CARCASS_CONNECT", global = true)]
    pub connect: Option<String>,

    /// Path to the data directory
    #[arg(short = 'd', long, global = true)]
    pub data_dir: Option<String>,

    /// Path to configuration file (optional, defaults used if not found)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Enable development mode (mock hypervisor)
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show environments
    List {
        /// Show details of all environments
        #[arg(short, long)]
        all: bool,

        /// Environments to show in detail
        envs: Vec<String>,
    },

    /// Start all machines of environments
    Start {
        #[arg(required = true)]
        envs: Vec<String>,
    },

    /// Stop all machines of environments
    Stop {
        /// Stop all environments
        #[arg(short, long)]
        all: bool,

        /// Send shutdown request even if the machine is not active
        #[arg(short, long)]
        force: bool,

        envs: Vec<String>,
    },

    /// Manage OS images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List images of the storage pool
    List(PoolArg),

    /// Download and store an OS cloud image in the storage pool
    Add {
        name: String,
        /// Path or URL of the image
        url: String,
        #[command(flatten)]
        pool: PoolArg,
    },

    /// Remove an OS cloud image from the storage pool
    Rm {
        name: String,
        #[command(flatten)]
        pool: PoolArg,
    },
}

#[derive(ClapArgs, Debug)]
pub struct PoolArg {
    /// Operate on this storage pool
    #[arg(short = 'p', long = "storage-pool")]
    pub storage_pool: Option<String>,
}

impl Args {
    /// Overrides of the configuration file given on the command line.
    pub fn overrides(&self) -> CliOverrides {
        let (storage_pool, force_stop) = match &self.command {
            Command::Image { action } => match action {
                ImageCommand::List(pool)
                | ImageCommand::Add { pool, .. }
                | ImageCommand::Rm { pool, .. } => (pool.storage_pool.clone(), false),
            },
            Command::Stop { force, .. } => (None, *force),
            _ => (None, false),
        };

        CliOverrides {
            connect: self.connect.clone(),
            data_dir: self.data_dir.clone(),
            storage_pool,
            log_level: self.log_level.clone(),
            force_stop,
            dev: self.dev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_image_add() {
        let args = Args::parse_from([
            "carcass", "-c", "qemu:///session", "image", "add", "debian11",
            "file:///tmp/d11.qcow2", "-p", "fast",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.connect.as_deref(), Some("qemu:///session"));
        assert_eq!(overrides.storage_pool.as_deref(), Some("fast"));
        match args.command {
            Command::Image {
                action: ImageCommand::Add { name, url, .. },
            } => {
                assert_eq!(name, "debian11");
                assert_eq!(url, "file:///tmp/d11.qcow2");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_stop_flags() {
        let args = Args::parse_from(["carcass", "stop", "-a", "-f", "--dev"]);
        assert!(args.dev);
        assert!(args.overrides().force_stop);
        assert!(matches!(args.command, Command::Stop { all: true, force: true, .. }));
    }

    #[test]
    fn test_start_requires_an_environment() {
        assert!(Args::try_parse_from(["carcass", "start"]).is_err());
    }
}
