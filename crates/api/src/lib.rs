//! Engine control plane: the HTTP command server embedded in a running engine
//! and the client the CLI uses to talk to it.

pub mod client;
pub mod routes;
pub mod server;

pub use client::EngineClient;
pub use server::{build_app, CommandServer, ServerError};
