//! Rule installer: turns one [`crate::config::ForwardingRule`] into a live
//! listener plus a permanently connected upstream.
//!
//! The upstream connect happens here, once, eagerly, not per inbound client:
//! one persistent upstream connection per rule, shared across every inbound
//! session that passes through the rule's listener.

use std::os::unix::io::RawFd;

use tracing::info;

use crate::config::ForwardingRule;
use crate::epoll::{Direction, Readiness, Tag};
use crate::sock::{bind_listener, close_quietly, connect_upstream};
use crate::table::ConnectionTable;

/// A rule's listener fd and the table slot carrying its upstream connection,
/// after successful installation.
pub struct InstalledRule {
    pub listen_fd: RawFd,
    pub slot: usize,
}

/// Install one rule: bind+listen, resolve and connect the upstream, allocate
/// its permanent slot, and register the listener for exclusive-wake
/// readiness. Any failure here is fatal at the caller (process won't start
/// with a rule it can't honor).
pub fn establish_forwarding_rule(
    rule: &ForwardingRule,
    table: &ConnectionTable,
    readiness: &Readiness,
) -> anyhow::Result<InstalledRule> {
    let listen_fd = bind_listener(rule.listen_port)
        .map_err(|e| anyhow::anyhow!("bind failed for port {}: {e}", rule.listen_port))?;

    let upstream_fd = match connect_upstream(&rule.upstream_host, &rule.upstream_service) {
        Ok(fd) => fd,
        Err(e) => {
            close_quietly(listen_fd);
            return Err(anyhow::anyhow!(
                "could not connect upstream {}:{} for port {}: {e}",
                rule.upstream_host,
                rule.upstream_service,
                rule.listen_port
            ));
        }
    };

    let slot = match table.allocate_for_rule(upstream_fd) {
        Ok(slot) => slot,
        Err(e) => {
            close_quietly(listen_fd);
            close_quietly(upstream_fd);
            return Err(anyhow::anyhow!("could not allocate connection slot: {e}"));
        }
    };

    // The upstream fd is stable for the rule's whole lifetime (it is
    // reused across every inbound client), so it is registered exactly
    // once, here, rather than on every accept.
    if let Err(e) = readiness.add(
        upstream_fd,
        Tag::Connection {
            slot,
            direction: Direction::RemoteToLocal,
        },
    ) {
        close_quietly(listen_fd);
        return Err(anyhow::anyhow!("could not register upstream in readiness set: {e}"));
    }

    if let Err(e) = readiness.add(listen_fd, Tag::Listener { listen_fd, slot }) {
        close_quietly(listen_fd);
        return Err(anyhow::anyhow!("could not register listener in readiness set: {e}"));
    }

    info!(
        port = rule.listen_port,
        upstream_host = %rule.upstream_host,
        upstream_service = %rule.upstream_service,
        "Adding forwarding on port {} to {}:{}",
        rule.listen_port,
        rule.upstream_host,
        rule.upstream_service,
    );

    Ok(InstalledRule { listen_fd, slot })
}
