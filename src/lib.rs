pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod purge;
pub mod registry;
pub mod server;
pub mod singleflight;
pub mod storage;

pub use cache::Cache;
pub use config::Config;
pub use error::{ProxyError, Result};
pub use registry::UpstreamClient;
pub use server::{build_router, start_server, AppState};
pub use singleflight::BlobCoordinator;
