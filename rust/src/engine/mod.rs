// Cache-and-update coordinator.

pub mod cache;
pub mod channel;
pub mod downloader;
pub mod interceptor;
pub mod lifecycle;
pub mod manifest;
pub mod policy;
pub mod stats;
pub mod worker;
