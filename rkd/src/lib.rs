pub mod config;
pub mod daemon;
pub mod error;
pub mod listener;
pub mod logging;
pub mod recovery;
pub mod supervisor;
pub mod tls;
pub mod workloads;

// re-export selected public API
pub use config::{DaemonArgs, EffectiveConfig};
pub use error::{DaemonError, RecoveryError};
pub use recovery::{RecoveryCoordinator, RecoveryReport, WorkloadManager};
pub use supervisor::{LaunchOptions, LifecycleState, Supervisor};
