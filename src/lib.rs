//! Native Microsoft identity bridge
//!
//! Token cache, silent and interactive acquisition, and a small host surface
//! (Rust API, JSON RPC and CLI) over an OAuth2 identity provider.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod storage;

#[cfg(test)]
mod testing;

pub use bridge::{BridgeFacade, ErrorPayload, TokenPayload};
pub use error::{BridgeError, ErrorKind};
