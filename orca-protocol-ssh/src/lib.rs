mod cidr;
mod client;
mod common;
mod compat;
mod known_hosts;
mod server;

pub use cidr::check_backend_access;
pub use client::*;
pub use common::*;
pub use known_hosts::{KnownHostValidationResult, KnownHosts};
pub use server::run_server;
