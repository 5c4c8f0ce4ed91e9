//! pimsync CLI
//!

#![deny(missing_docs)]

use anyhow::Result;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    pimsync_lib::cli().await
}
