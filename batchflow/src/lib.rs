//! batchflow - client-side orchestration of remote batch runs
//!
//! Two orchestrators share one connection layer:
//! - [`pipeline`]: extract → transfer → load, each step triggered by the
//!   server's `complete` for the previous one
//! - [`fanout`]: a fixed list of task servers run one after another by the
//!   client, each awaited through a single resolver slot

pub mod config;
pub mod connection;
pub mod fanout;
pub mod history;
pub mod notify;
pub mod output_log;
pub mod pipeline;
pub mod session;
pub mod timer;
pub mod validator;

pub use config::Config;
pub use connection::{ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState};
pub use fanout::{DispatchError, FanoutDispatcher};
pub use notify::Notifier;
pub use pipeline::{PipelineError, PipelineHandle, PipelineOptions};
