//! Full CLI library for pimsync
//!

#![deny(missing_docs)]

mod apply;
mod cmd;
mod plan;

use anyhow::{Context, Result};
use clap::Parser;
use human_panic::setup_panic;

use pimsync_azure::AzureClient;
use pimsync_core::{
    cache::{CachedReader, RunCache},
    config, log_runtime,
    logging::{self, debug},
    permissions::AccessMode,
    plan::{build_plan, Plan},
    project,
};

use crate::cmd::{PimsyncArgs, PimsyncCommand, SourceArgs};

/// Main CLI entrypoint.
pub async fn cli() -> Result<()> {
    setup_panic!();
    let args = PimsyncArgs::parse();
    logging::setup(args.log_level);

    match &args.command {
        PimsyncCommand::Plan { source } => plan::plan(source).await?,
        PimsyncCommand::Apply {
            source,
            auto_approve,
        } => apply::apply(source, *auto_approve).await?,
    }

    Ok(())
}

/// Load the configuration, connect, and plan. The client comes back so the
/// plan can be applied with it.
async fn plan_changes(source: &SourceArgs, mode: AccessMode) -> Result<(Plan, AzureClient)> {
    let config_path = source
        .config
        .to_owned()
        .unwrap_or_else(project::default_config_path);
    let desired = config::load(&config_path)?;
    debug!(
        "loaded {} grants at {} targets from {}",
        desired.grants.len(),
        desired.managed_targets.len(),
        config_path.display()
    );

    let credentials_path = match &source.credentials {
        Some(p) => p.to_owned(),
        None => project::credentials_path()?,
    };
    let credentials = project::fetch_credentials(&credentials_path)?;
    let client = log_runtime!(
        "connecting to azure",
        AzureClient::new(&credentials)
            .await
            .context("connecting to Azure")?
    );

    let mut cache = RunCache::new();
    let plan = {
        let mut reader = CachedReader::new(&client, &mut cache);
        build_plan(&desired, &mut reader, mode).await?
    };
    Ok((plan, client))
}

fn print_plan(plan: &Plan) {
    println!("\nPLAN\n──────────────────");
    println!("{}", textwrap::indent(&plan.to_string(), "  "));
}
