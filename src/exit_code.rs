/// Process exit codes. These are the only channel through which the worker
/// reports terminal outcomes to whatever supervises the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    TasksComplete,
    CantLoadConfig,
    RebootRequired,
    IdleTimeout,
    InternalError,
    NonCurrentDeploymentId,
    WorkerStopped,
    WorkerShutdown,
    InvalidConfig,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        match self {
            ExitCode::TasksComplete => 0,
            ExitCode::CantLoadConfig => 64,
            ExitCode::RebootRequired => 67,
            ExitCode::IdleTimeout => 68,
            ExitCode::InternalError => 69,
            ExitCode::NonCurrentDeploymentId => 70,
            ExitCode::WorkerStopped => 71,
            ExitCode::WorkerShutdown => 72,
            ExitCode::InvalidConfig => 73,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitCode::TasksComplete => "tasks-complete",
            ExitCode::CantLoadConfig => "cant-load-config",
            ExitCode::RebootRequired => "reboot-required",
            ExitCode::IdleTimeout => "idle-timeout",
            ExitCode::InternalError => "internal-error",
            ExitCode::NonCurrentDeploymentId => "non-current-deployment-id",
            ExitCode::WorkerStopped => "worker-stopped",
            ExitCode::WorkerShutdown => "worker-shutdown",
            ExitCode::InvalidConfig => "invalid-config",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_supervisor_contract() {
        assert_eq!(ExitCode::TasksComplete.code(), 0);
        assert_eq!(ExitCode::RebootRequired.code(), 67);
        assert_eq!(ExitCode::IdleTimeout.code(), 68);
        assert_eq!(ExitCode::InternalError.code(), 69);
        assert_eq!(ExitCode::NonCurrentDeploymentId.code(), 70);
        assert_eq!(ExitCode::WorkerStopped.code(), 71);
        assert_eq!(ExitCode::WorkerShutdown.code(), 72);
    }

    #[test]
    fn manager_requested_shutdown_is_distinct() {
        let manager = ExitCode::NonCurrentDeploymentId.code();
        assert_ne!(manager, ExitCode::IdleTimeout.code());
        assert_ne!(manager, ExitCode::InternalError.code());
        assert_ne!(manager, ExitCode::WorkerShutdown.code());
    }

    #[test]
    fn display_includes_numeric_code() {
        assert_eq!(ExitCode::IdleTimeout.to_string(), "idle-timeout (68)");
    }
}
