//!
//! Reconcile privileged access
//!
//! Matches declared role grants and their governing policies against what a
//! remote authorization service reports, plans the minimal set of changes,
//! and applies them.
#![deny(missing_docs)]

pub use error::ReconcileError;

pub mod apply;
pub mod cache;
pub mod config;
pub mod diff;
pub mod error;
pub mod grants;
pub mod logging;
pub mod permissions;
pub mod plan;
pub mod policy;
pub mod project;
pub mod remote;
mod test_util;

#[macro_export]
/// Time the code inside the macro. Write the elapsed time to debug logs.
/// Derived from https://notes.iveselov.info/programming/time_it-a-case-study-in-rust-macros
macro_rules! log_runtime {
    ($context:literal, $($tt:tt)+) => {
        {
            debug!("{}: starting", $context);
            let timer = std::time::Instant::now();
            let x =
            $(
                $tt
            )+;
            debug!("{}: {:?}", $context, timer.elapsed());
            x
        }
    }
}
