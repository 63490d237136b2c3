//! Server-side WebSocket engine: handshake, incremental frame assembly and
//! per-connection dispatch over any blocking byte stream.
#![deny(
    missing_docs,
    missing_copy_implementations,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub use http;

pub mod error;
pub mod handler;
pub mod handshake;
pub mod policy;
pub mod protocol;
mod server;
pub mod session;

pub use crate::{
    error::{Error, Result},
    handler::{Flow, Handler, WebSocketHandler},
    handshake::{AuthResult, Authenticator},
    policy::AccessPolicy,
    protocol::{DataFrame, DataState, Message, WebSocketConfig},
    server::{serve, serve_with_config},
    session::{ConnectionMode, UserContext},
};
