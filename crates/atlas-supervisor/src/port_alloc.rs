use std::{io::ErrorKind, net::TcpListener};

use atlas_db::{Registry, RegistryError};
use atlas_process::AppId;

/// Probes `port` by binding it on all interfaces and releasing it immediately.
///
/// Anything other than a successful bind (in use, permission denied, ...) is
/// reported as not free.
pub fn is_port_free(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, error = %e, "port probe failed");
            false
        }
    }
}

/// Lowest port in `[start, end)` that is neither bound on this host nor
/// recorded against another application.
///
/// `exclude` skips that application's own record so it may keep or reclaim
/// its port. Callers that persist the result must serialise through a lock;
/// two unsynchronised calls can return the same port.
pub async fn find_available_port(
    start: u16,
    end: u16,
    registry: &Registry,
    exclude: Option<AppId>,
) -> Result<Option<u16>, RegistryError> {
    if start >= end {
        return Ok(None);
    }
    let assigned = registry.assigned_ports(exclude).await?;
    Ok((start..end).find(|port| !assigned.contains(port) && is_port_free(*port)))
}
