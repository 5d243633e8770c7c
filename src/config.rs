//! `forward.conf` loading.
//!
//! Parses the rule table the core consumes at startup. The grammar is a
//! bespoke CSV, not a self-describing format, so this is a hand-written
//! parser rather than a `serde` deserializer — the table is loaded once and
//! its shape doesn't vary, so [`ForwardingRule`] stays a plain immutable
//! struct rather than something deserialized through `serde`.

use std::fs;
use std::path::Path;

use tracing::warn;

/// One `(listen_port, upstream_host, upstream_service)` entry from the
/// config file. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_service: String,
}

impl ForwardingRule {
    pub fn new(listen_port: u16, upstream_host: String, upstream_service: String) -> Self {
        Self {
            listen_port,
            upstream_host,
            upstream_service,
        }
    }
}

/// Read and parse `forward.conf` from `dir`. Absence of the file is fatal.
pub fn load_rules(dir: &Path) -> anyhow::Result<Vec<ForwardingRule>> {
    let path = dir.join("forward.conf");
    let text = fs::read_to_string(&path)
        .map_err(|_| anyhow::anyhow!("forward.conf could not be located"))?;
    parse_rules(&text)
}

/// Parse the contents of a `forward.conf` file.
///
/// - Blank lines and comment-like lines (no comma, non-numeric first token)
///   are skipped.
/// - A comma-bearing line whose first field isn't a valid port is fatal —
///   it was clearly attempting to encode a rule.
/// - A line missing `upstream_host` is skipped with a warning.
/// - Fields after `upstream_service` are ignored.
/// - `upstream_service` defaults to `listen_port` (as a decimal string) when
///   omitted.
pub fn parse_rules(text: &str) -> anyhow::Result<Vec<ForwardingRule>> {
    let mut rules = Vec::new();

    for (lineno, raw_line) in text.lines().enumerate() {
        // Only trim the trailing carriage return a Windows-authored file
        // might leave behind; fields themselves are kept verbatim (a host
        // field's whitespace is significant — see the malformed-host test).
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let has_comma = line.contains(',');
        let mut fields = line.split(',');
        let first = fields.next().unwrap_or("");
        let first_is_port_like = !first.is_empty() && first.chars().all(|c| c.is_ascii_digit());

        if !has_comma && !first_is_port_like {
            // A genuine comment/non-rule line (e.g. "# comment") never even
            // attempted the comma-separated rule grammar — skip it. A line
            // with a comma but a bad first field (e.g. "abc,host,80") did
            // attempt it and falls through to the fatal port-parse below.
            continue;
        }

        let listen_port: u16 = first
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid port in config file (line {})", lineno + 1))?;

        let upstream_host = match fields.next() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                warn!(line = lineno + 1, "config line missing upstream host, skipping");
                continue;
            }
        };

        let upstream_service = match fields.next() {
            Some(service) if !service.is_empty() => service.to_string(),
            _ => listen_port.to_string(),
        };

        rules.push(ForwardingRule::new(listen_port, upstream_host, upstream_service));
    }

    Ok(rules)
}
