//! Courier: a multi-tenant messaging gateway.
//!
//! Each tenant session holds one connection to a chat network through a
//! pluggable [`provider`]. Outbound messages flow through a durable
//! per-session [`queue`] guarded by a [`dedup`] cache; [`campaign`]s fan one
//! message out to many recipients at a safe pace.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod types;

pub mod provider;
pub mod session;

pub mod dedup;
pub mod queue;
pub mod store;

pub mod campaign;
pub mod gateway;

pub use error::GatewayError;
pub use gateway::Gateway;
