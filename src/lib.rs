//! sqlfront - Session-scoped query lifecycle front end
//!
//! Sits between client transports and an execution engine. Tracks sessions
//! and the tables they cache, enforces per-statement timeouts with
//! cooperative or forceful cancellation, and turns failures into
//! transport-appropriate error messages.
//!
//! Architecture:
//!   SqlFrontend
//!     ├── SessionRegistry   (open/close, per-session options, scratch dirs)
//!     ├── CacheRegistry     (session-private and global cached tables)
//!     ├── QueryController   (timeout watchdog, cancellation directives)
//!     └── render            (classification + per-transport rendering)
//!
//! The engine is any `ExecutionEngine`; `LocalEngine` is an in-process one
//! used by the CLI and the tests.

pub mod cache;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod metrics;
pub mod render;
pub mod session;
pub mod session_manager;
pub mod statement;

pub use cache::{CacheRegistry, CacheScope};
pub use config::{CancellationMode, FrontendConfig, QuerySettings, SessionOptions};
pub use controller::{QueryController, QueryStatus, QueryTimedOut};
pub use engine::{ExecutionEngine, JobHandle, LocalEngine, ResultSet, Value};
pub use error::{FrontendError, Result};
pub use frontend::{SqlFrontend, StatementResult};
pub use metrics::{Metrics, MetricsSnapshot};
pub use render::{ErrorKind, RenderedError, Transport};
pub use session::{SessionContext, SessionId};
pub use session_manager::SessionRegistry;
