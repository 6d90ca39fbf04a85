//! HTTP front end for pilestore.

pub mod files;
pub mod peer;
pub mod server;

#[cfg(test)]
mod files_tests;

pub use peer::determine_peer;
pub use server::{build_router, start_server, AppState};
