//! Subcommand handlers.

use anyhow::{anyhow, bail, Context, Result};
use carcass_common::is_valid_name;
use carcass_hypervisor::HypervisorClient;
use carcass_infra::{
    add_provenance, remove_provenance, ControlReport, DefaultSourceOpener, Environment, Image,
    ImageStore, Settings,
};
use tracing::{info, warn};

use crate::cli::{Command, ImageCommand};

pub async fn run(client: &HypervisorClient, settings: &Settings, command: Command) -> Result<()> {
    match command {
        Command::List { all, envs } => list(client, all, envs).await,
        Command::Start { envs } => start(client, envs).await,
        Command::Stop { all, envs, .. } => stop(client, all, settings.control.force_stop, envs).await,
        Command::Image { action } => image(client, settings, action).await,
    }
}

async fn list(client: &HypervisorClient, all: bool, mut envs: Vec<String>) -> Result<()> {
    if envs.is_empty() {
        let names = Environment::list_names(client).await?;
        if !all {
            for name in names {
                println!("{}", name);
            }
            return Ok(());
        }
        envs = names;
    }

    for name in envs {
        match lookup(client, &name).await {
            Some(env) => println!("{}", env),
            None => continue,
        }
    }
    Ok(())
}

async fn start(client: &HypervisorClient, envs: Vec<String>) -> Result<()> {
    let mut report = ControlReport::default();
    let mut missing = 0;

    for name in envs {
        match lookup(client, &name).await {
            Some(env) => report.extend(env.start().await),
            None => missing += 1,
        }
    }

    conclude(report, missing)
}

async fn stop(client: &HypervisorClient, all: bool, force: bool, envs: Vec<String>) -> Result<()> {
    let envs = if all {
        Environment::list_names(client).await?
    } else {
        envs
    };

    if envs.is_empty() {
        bail!("missing environment");
    }

    let mut report = ControlReport::default();
    let mut missing = 0;

    for name in envs {
        match lookup(client, &name).await {
            Some(env) => report.extend(env.stop(force).await),
            None => missing += 1,
        }
    }

    conclude(report, missing)
}

/// Look an environment up, logging why it cannot be used.
async fn lookup(client: &HypervisorClient, name: &str) -> Option<Environment> {
    if !is_valid_name(name) {
        warn!(environment = %name, "Invalid environment name");
        return None;
    }

    match Environment::lookup(client, name).await {
        Ok(env) => Some(env),
        Err(e) => {
            warn!(environment = %name, error = %e, "Could not load environment");
            None
        }
    }
}

fn conclude(report: ControlReport, missing: usize) -> Result<()> {
    for outcome in &report.outcomes {
        println!("{}", outcome);
    }

    let failed = report.failures().count();
    if failed > 0 || missing > 0 {
        return Err(anyhow!(
            "{} machine(s) could not be controlled, {} environment(s) could not be loaded",
            failed,
            missing
        ));
    }
    Ok(())
}

async fn image(client: &HypervisorClient, settings: &Settings, action: ImageCommand) -> Result<()> {
    let store = ImageStore::new(client.clone());
    let pool = settings.storage.pool.as_str();
    let data_dir = settings.data_dir()?;

    match action {
        ImageCommand::List(_) => {
            let images = store
                .list(pool, Some(data_dir.as_path()))
                .await
                .context("Could not list volumes on hypervisor")?;
            for image in images {
                println!("{}", image);
            }
        }

        ImageCommand::Add { name, url, .. } => {
            if !is_valid_name(&name) {
                bail!("invalid image name: {}", name);
            }

            let image = Image::new(name, pool).with_source(url);
            store
                .store(&image, &DefaultSourceOpener::new())
                .await
                .context("could not add image")?;

            if let Err(e) = add_provenance(&data_dir, &image.pool, &image.name, &image.source).await {
                warn!(error = %e, "Image stored but its source was not recorded");
            }
            info!(image = %image.name, pool = %image.pool, "OS image added");
        }

        ImageCommand::Rm { name, .. } => {
            let image = Image::new(name, pool);

            if !store.exists(&image).await? {
                bail!("OS image {} does not exist in pool {}", image.name, image.pool);
            }

            if let Err(e) = remove_provenance(&data_dir, &image.pool, &image.name).await {
                warn!(error = %e, "Could not forget the source of the image");
            }

            store
                .drop_image(&image)
                .await
                .context("could not remove image")?;
            println!("OS image {} removed from pool {}", image.name, image.pool);
        }
    }
    Ok(())
}
