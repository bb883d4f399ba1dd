//! # seqrpc-server
//!
//! RPC server for seqrpc.
//!
//! This crate provides:
//! - TCP accept loop with a connection limit and graceful shutdown
//! - Per-connection codec negotiation and request loop
//! - Concurrent request handling with serialized response writes
//! - The service-dispatch contract and a typed method table
//! - A built-in method set for the daemon
//! - YAML/environment configuration

pub mod builtin;
pub mod config;
pub mod error;
pub mod server;
pub mod service;
pub mod session;

pub use config::{Config, ConfigError, NetworkConfig, RpcConfig};
pub use error::{ServerError, ServiceError};
pub use server::{Server, ServerConfig, ServerStats};
pub use service::{Args, Methods, Reply, Request, Service};
pub use session::{ConnState, Session};
