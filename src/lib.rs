//! `relayd`: a multi-port, multi-threaded TCP port-forwarding daemon.
//!
//! The binary crate (`src/main.rs`) is a thin CLI shim; everything that
//! matters lives here so it can be driven directly from integration tests
//! without going through a subprocess.

pub mod config;
pub mod dispatch;
pub mod epoll;
pub mod install;
pub mod lifecycle;
pub mod relay;
pub mod sock;
pub mod table;

use std::path::Path;
use std::sync::Arc;

use tracing::error;

use epoll::Readiness;
use table::ConnectionTable;

/// Load `forward.conf` from `config_dir`, install every rule, and block
/// running the worker pool until a shutdown signal is observed.
///
/// Returns `Ok(())` on clean shutdown; any initialization failure (missing
/// config, malformed rule, unreachable upstream, resource exhaustion) is
/// returned as an `Err` for the caller to report and exit nonzero with.
pub fn run(config_dir: &Path) -> anyhow::Result<()> {
    let rules = config::load_rules(config_dir)?;
    if rules.is_empty() {
        anyhow::bail!("forward.conf contained no usable rules");
    }

    let readiness = Arc::new(Readiness::new()?);
    let table = Arc::new(ConnectionTable::new());

    for rule in &rules {
        if let Err(e) = install::establish_forwarding_rule(rule, &table, &readiness) {
            error!(error = %e, port = rule.listen_port, "failed to install forwarding rule");
            return Err(e);
        }
    }

    lifecycle::run_workers(readiness, table)
}
