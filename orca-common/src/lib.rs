mod data;
mod error;
pub mod helpers;
mod types;
mod version;

pub use data::*;
pub use error::OrcaError;
pub use types::*;
pub use version::ssh_server_id;

pub type Result<T, E = OrcaError> = std::result::Result<T, E>;
