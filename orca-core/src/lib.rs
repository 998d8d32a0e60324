mod auth;
mod config_store;
mod kv;
pub mod logging;
mod manager;
mod registry;
mod services;
mod stash;

pub use auth::*;
pub use config_store::*;
pub use kv::*;
pub use manager::*;
pub use registry::*;
pub use services::*;
pub use stash::TimedStash;
