//! Transport abstractions for feedline.
//!
//! Sessions only depend on the frame-oriented [`link::PeerLink`] contract
//! and the [`rpc::RpcClient`] call helper defined in this crate.

pub mod link;
pub mod rpc;
pub mod tcp;

pub use link::{InMemoryLink, LinkError, LinkHealth, PeerId, PeerLink};
pub use rpc::RpcClient;
pub use tcp::TcpLink;
