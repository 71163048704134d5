use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod bootstrap;
pub mod calendar_setup;
pub mod calendar_sync;
pub mod credentials;
pub mod materializer;
pub mod scheduler;

/// Injectable clock shared by the services.
pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
