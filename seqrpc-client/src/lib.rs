//! # seqrpc-client
//!
//! Client library for seqrpc.
//!
//! This crate provides:
//! - Async TCP client with codec negotiation
//! - Many concurrent calls multiplexed over one connection by sequence number
//! - Per-call timeouts
//! - Shutdown propagation to every pending call

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Call, ClientConfig, Connection};
pub use error::ClientError;
