pub mod config;
pub mod errors;
pub mod load_balancer;
pub mod logging;
pub mod models;
pub mod sync;
pub mod traits;

pub use config::AppConfig;
pub use errors::{GridError, GridResult};
pub use logging::{init_logging, LogConfig, LogLevel};
