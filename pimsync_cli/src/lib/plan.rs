//! Plan command execution

use anyhow::Result;
use pimsync_core::permissions::AccessMode;

use crate::{cmd::SourceArgs, plan_changes, print_plan};

pub(super) async fn plan(source: &SourceArgs) -> Result<()> {
    let (plan, _) = plan_changes(source, AccessMode::Plan).await?;
    print_plan(&plan);
    Ok(())
}
