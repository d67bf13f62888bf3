use std::{fs::read_to_string, path::Path};

use anyhow::Context;
use clap::Parser;
use groupsync_core::{
    config::{Command, GroupSyncConfig},
    GroupMembership, HttpGroupApi, ReadOutcome, Reconciler, VERSION,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[macro_use]
extern crate tracing;

fn load_declaration(path: &Path) -> Result<GroupMembership, anyhow::Error> {
    let content = read_to_string(path)
        .with_context(|| format!("Failed to read declaration file {}", path.display()))?;
    let declaration = serde_json::from_str(&content)
        .with_context(|| format!("Invalid declaration in {}", path.display()))?;
    Ok(declaration)
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    if dotenvy::from_filename(".env.local").is_err() {
        dotenvy::dotenv().ok();
    }
    let config = GroupSyncConfig::parse();
    // initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},hyper=info", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting groupsync version v{VERSION}");
    debug!("Using config: {config:?}");

    let client = HttpGroupApi::new(
        config.api_url.clone(),
        config.api_token.clone(),
        config.page_size,
        *config.request_timeout,
    )?;
    let reconciler = Reconciler::new(client, config.engine_config());

    match &config.cmd {
        Command::Apply { declaration } => {
            let declaration = load_declaration(declaration)?;
            let observed = reconciler.update(&declaration).await?;
            println!("{}", serde_json::to_string_pretty(&observed.to_attributes())?);
        }
        Command::Plan { declaration } => {
            let declaration = load_declaration(declaration)?;
            let diff = reconciler.plan(&declaration).await?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
        }
        Command::Read { declaration } => {
            let declaration = load_declaration(declaration)?;
            match reconciler.read(&declaration).await? {
                ReadOutcome::Present(observed) => {
                    println!("{}", serde_json::to_string_pretty(&observed.to_attributes())?);
                }
                ReadOutcome::Gone => println!("null"),
            }
        }
        Command::Delete { declaration } => {
            let declaration = load_declaration(declaration)?;
            let report = reconciler.delete(&declaration).await?;
            info!(
                "Removed {} member(s) from group {}",
                report.removed.len(),
                declaration.group
            );
        }
        Command::VerifyDestroyed { group, wait } => {
            let state = match wait {
                Some(wait) => reconciler.verify_destroyed_within(group, **wait).await?,
                None => reconciler.verify_destroyed(group).await?,
            };
            println!("{state}");
        }
    }

    Ok(())
}
