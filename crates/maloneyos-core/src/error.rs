use std::path::PathBuf;
use thiserror::Error;

/// Result alias for installer operations.
pub type InstallResult<T> = Result<T, InstallError>;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("[MI1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[MI1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[MI1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[MI1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[MI1200] installer input missing at {path}: {reason}")]
    MissingInput { path: PathBuf, reason: String },

    #[error("[MI1201] precondition failed: {0}")]
    Precondition(String),

    #[error("[MI2000] executor error: {0}")]
    Executor(String),

    #[error("[MI2100] `{command}` exited with code {status}: {diagnostic}")]
    CommandFailed {
        command: String,
        status: i32,
        diagnostic: String,
    },

    #[error("[MI3000] pool state error: {0}")]
    PoolState(String),

    #[error("[MI3100] {failed} of {total} configuration steps failed: {steps}")]
    ConfigurationFailed {
        failed: usize,
        total: usize,
        steps: String,
    },

    #[error("[MI5000] pipeline state error: {0}")]
    State(#[from] crate::state::InvalidTransition),
}

impl InstallError {
    pub fn code(&self) -> &'static str {
        match self {
            InstallError::Io(_) => "MI1000",
            InstallError::Toml(_) => "MI1001",
            InstallError::Yaml(_) => "MI1002",
            InstallError::InvalidConfig(_) => "MI1100",
            InstallError::MissingInput { .. } => "MI1200",
            InstallError::Precondition(_) => "MI1201",
            InstallError::Executor(_) => "MI2000",
            InstallError::CommandFailed { .. } => "MI2100",
            InstallError::PoolState(_) => "MI3000",
            InstallError::ConfigurationFailed { .. } => "MI3100",
            InstallError::State(_) => "MI5000",
        }
    }

    /// Errors raised before anything destructive ran.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            InstallError::MissingInput { .. }
                | InstallError::Precondition(_)
                | InstallError::InvalidConfig(_)
        )
    }
}
