//! Feedline node-layer primitives and sessions.
//!
//! This crate wires together access control, the autoshift controller and
//! the upstream/downstream session state machines on top of pluggable
//! links, product stores and session registries.

pub mod acl;
pub mod activity;
pub mod autoshift;
pub mod cancel;
pub mod config;
pub mod downstream;
pub mod error;
pub mod host;
pub mod offer;
pub mod persistence;
pub mod registry;
pub mod requester;
pub mod requests;
pub mod server;
pub mod store;
pub mod upstream;
