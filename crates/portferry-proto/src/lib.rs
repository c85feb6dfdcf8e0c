//! Shared tunnel types
//!
//! This crate defines the value types passed between the configuration layer,
//! the session providers and the forwarding engine.

pub mod endpoint;
pub mod server;
pub mod tunnel;

pub use endpoint::{Endpoint, EndpointError};
pub use server::{Credentials, ServerDescriptor, DEFAULT_SSH_PORT};
pub use tunnel::{Direction, ParseDirectionError, TunnelSpec};
