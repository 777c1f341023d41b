//! Bastion lookup in the synchronized `connection_info` cache.

use bfh_common::{BastionEndpoint, BfhError, ErrorCode, Result};
use std::path::Path;

pub const CONNECTION_INFO_FILE: &str = "connection_info";

/// Find `name` in `<ssh_dir>/connection_info` (`<name> <domain> <port>` per line).
pub fn resolve_bastion(ssh_dir: &Path, name: &str) -> Result<BastionEndpoint> {
    let path = ssh_dir.join(CONNECTION_INFO_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BfhError::configuration_with(
                ErrorCode::BastionNotConfigured,
                format!(
                    "connection info not found at {}; resynchronize your SSH configuration",
                    path.display()
                ),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some(name))
        .ok_or_else(|| {
            BfhError::configuration_with(
                ErrorCode::BastionNotConfigured,
                format!(
                    "bastion '{name}' not found in {}; check the name or resynchronize your SSH configuration",
                    path.display()
                ),
            )
        })?;

    parse_line(line).ok_or_else(|| {
        BfhError::configuration_with(
            ErrorCode::BastionNotConfigured,
            format!("invalid connection info for '{name}': '{line}'"),
        )
    })
}

fn parse_line(line: &str) -> Option<BastionEndpoint> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?;
    let domain = parts.next()?;
    let port = parts.next()?.parse::<u16>().ok().filter(|p| *p > 0)?;
    Some(BastionEndpoint {
        name: name.to_string(),
        domain: domain.to_string(),
        port,
    })
}
