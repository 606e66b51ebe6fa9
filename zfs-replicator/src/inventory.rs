//! Volume inventory on either side.

use crate::command::Toolbox;
use crate::host::Host;
use crate::utils::errors::{ReplicationError, Result};

/// Every filesystem and zvol under `root`, in listing order.
///
/// A partial list would make present volumes look missing, so any failure
/// of the listing command is an error rather than a short result.
pub fn list_volumes(host: &dyn Host, tools: &Toolbox, root: &str) -> Result<Vec<String>> {
    let query_error = |reason: String| ReplicationError::InventoryQuery {
        side: host.side(),
        reason,
    };

    let output = host
        .execute(&tools.list_volumes(root))
        .map_err(|e| query_error(e.to_string()))?;

    if !output.success() {
        return Err(query_error(format!(
            "exit status {}: {}",
            output.exit_status,
            output.stderr.trim()
        )));
    }

    let volumes = parse_volume_list(&output.stdout);
    tracing::debug!(side = %host.side(), root, count = volumes.len(), "Listed volumes");
    Ok(volumes)
}

fn parse_volume_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}
