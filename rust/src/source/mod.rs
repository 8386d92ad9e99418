// Network abstraction used by the worker.

pub mod http_source;
pub mod traits;
