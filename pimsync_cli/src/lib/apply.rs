//! Apply command execution

use anyhow::Result;
use colored::Colorize;
use inquire::Confirm;
use pimsync_core::{apply::apply_plan, logging::info, permissions::AccessMode};

use crate::{cmd::SourceArgs, plan_changes, print_plan};

pub(super) async fn apply(source: &SourceArgs, auto_approve: bool) -> Result<()> {
    let (plan, client) = plan_changes(source, AccessMode::Apply).await?;
    print_plan(&plan);

    // Exit early if there's nothing to do
    if plan.is_empty() {
        return Ok(());
    }

    if !auto_approve {
        let confirmed = Confirm::new(&format!("Apply these {} changes?", plan.len()))
            .with_default(false)
            .prompt()?;
        if !confirmed {
            println!("Nothing was changed.");
            return Ok(());
        }
    }

    info!("applying {} changes", plan.len());
    let summary = apply_plan(&plan, &client).await?;
    println!("\n{}", summary.to_string().green());
    Ok(())
}
