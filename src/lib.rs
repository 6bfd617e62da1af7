//! eden-proxy: intercepting HTTP/HTTPS/WebSocket forward proxy
//!
//! This crate provides a man-in-the-middle forward proxy that can decrypt
//! HTTPS traffic with forged per-host certificates, let rule hooks inspect and
//! rewrite requests and responses, bridge WebSocket sessions, and record
//! everything it sees.
//!
//! # Architecture
//!
//! - **CA**: Root certificate authority that forges leaf certificates
//! - **Proxy**: CONNECT tunnels, TLS termination, HTTP pipeline and WebSocket bridge
//! - **Recorder**: Sink for traffic records and WebSocket messages
//! - **Config**: Hierarchical TOML configuration overridden by CLI flags

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod proxy;
pub mod recorder;
