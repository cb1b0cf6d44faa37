pub mod abort;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod input;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod progress;
pub mod pump;
pub mod reducer;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3;
pub mod session;
pub mod task_queue;
pub mod transport;

pub use error::*;
