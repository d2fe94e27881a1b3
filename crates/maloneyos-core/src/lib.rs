pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod logging;
mod parse;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod render;
pub mod request;
pub mod state;
pub mod workflow;

pub use config::{InstallerConfig, DEFAULT_CONFIG_PATH};
pub use error::{InstallError, InstallResult};
pub use executor::{CommandExecutor, CommandOutput, CommandSpec, ExitPolicy, Tolerance};
pub use ledger::{FilesystemKind, MountEntry, MountLedger};
pub use pipeline::{PipelineDriver, PipelineOutcome};
pub use pool::{PartitionPlan, PoolState, StoragePool};
pub use progress::{ChannelSink, LogSink, ProgressEvent, ProgressSink, ProgressUpdate};
pub use request::InstallationRequest;
pub use state::{PipelineState, StateMachine};
