//! HTTP collaborators of a scenario: the echo origin and the proxied requester

pub mod client;
pub mod server;

pub use client::{EchoRequester, EchoResponse, ProxiedRequester};
pub use server::EchoServer;
