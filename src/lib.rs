pub mod config;
pub mod error;
pub mod proxy;
pub mod router;
pub mod server;
pub mod translate;
pub mod upstream;

pub use config::RouterConfig;
pub use error::{ProxyError, Result};
pub use router::ApiFlavor;
pub use server::{build_router, AppState};
pub use upstream::UpstreamClient;
