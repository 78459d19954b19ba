//! SDK for Envoy callout servers.
//!
//! Provides customizable, out of the box, gRPC servers for the three Envoy
//! callout protocols:
//!
//! - ext-proc ([`ExtProcHandler`]): per-message header and body
//!   transformations on a bidirectional stream;
//! - ext-authz ([`AuthzHandler`]): unary allow/deny authorization checks;
//! - L4 network processing ([`NetworkHandler`]): per-frame byte-stream
//!   transformations with connection control.
//!
//! Implement the hooks you need on a handler type (unimplemented hooks pass
//! through), hand it to [`CalloutServer`], and call [`CalloutServer::run`].
//! The server manages the secure/plaintext gRPC listeners, an optional
//! HTTP(S) health-check endpoint, graceful shutdown, and an optional
//! multi-process worker model over shared ports.

pub mod cli;
pub mod config;
pub mod extauthz;
pub mod extproc;
mod health;
pub mod network;
pub mod protos;
pub mod server;
pub mod tools;
mod workers;

pub use config::{parse_address, ConfigError, ServerConfig, ServerConfigBuilder, TlsMaterial};
pub use extauthz::{allow_request, deny_request, request_header, AuthzHandler};
pub use extproc::{ExtProcHandler, HookResponse};
pub use network::{DataFrame, NetworkHandler};
pub use server::{BoundAddresses, CalloutServer, ServerError};
pub use tools::{
    add_body_mutation, add_header_mutation, body_contains, build_dynamic_forwarding_metadata,
    deny_callout, header_immediate_response, header_value, headers_contain,
};
