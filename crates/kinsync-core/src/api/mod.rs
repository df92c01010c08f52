//! Remote authority access.
//!
//! The sync engine only needs the three-verb CRUD surface plus a graph fetch,
//! described by the `RemoteStore` trait. `HttpRemote` implements it over a
//! REST API; `DisconnectedRemote` stands in when no remote is configured.

pub mod client;
pub mod error;
pub mod remote;

pub use client::HttpRemote;
pub use error::ApiError;
pub use remote::{DisconnectedRemote, RemoteStore};
