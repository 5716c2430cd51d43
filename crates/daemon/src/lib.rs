pub mod config;
pub mod host;
pub mod server;

pub use host::LoggingHostSignals;
pub use server::{build_router, AppState};
