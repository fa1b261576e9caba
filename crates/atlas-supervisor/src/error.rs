use atlas_db::RegistryError;
use atlas_process::AppId;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("application not found: {0}")]
    NotFound(AppId),
    #[error("no available ports in {start}-{end}")]
    PortExhausted { start: u16, end: u16 },
    #[error("failed to spawn application: {0}")]
    SpawnFailed(String),
    #[error("processes still alive after SIGKILL: {pids:?}")]
    TerminationFailed { pids: Vec<u32> },
    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for SupervisorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => SupervisorError::NotFound(id),
            other => SupervisorError::Registry(other),
        }
    }
}

impl SupervisorError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::PortExhausted { .. } => "port_exhausted",
            SupervisorError::SpawnFailed(_) => "spawn_failed",
            SupervisorError::TerminationFailed { .. } => "termination_failed",
            SupervisorError::Registry(_) => "registry",
        }
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
