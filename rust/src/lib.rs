//! Offline-capable web application shell: a request-interception proxy that
//! serves pages from versioned cache generations and rolls sessions forward
//! from one deployment to the next.

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;

pub use config::EngineConfig;
pub use engine::worker::ShellWorker;
pub use error::EngineError;
