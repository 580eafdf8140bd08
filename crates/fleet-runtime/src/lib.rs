pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod monitor_sync;
pub mod operations;
pub mod reconciler;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod timing;

pub use backend::{FleetBackend, StreamEvent, TerminalStream};
pub use config::RuntimeConfig;
pub use error::{BackendError, ConfigError, OperationError, SessionError};
pub use http::HttpBackend;
pub use operations::FleetOperations;
pub use reconciler::{PollOutcome, Reconciler};
pub use scheduler::{BatchReport, BatchTask, BoundedScheduler};
pub use session::{SessionEvent, SessionEventKind, SessionManager};
pub use store::{ActivityKind, FleetStore};
