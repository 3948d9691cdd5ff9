//! Feedline wire codec.
//!
//! Defines the call/reply frames exchanged between peers and the CBOR,
//! length-prefixed encoding used on stream transports.

pub mod error;
pub mod frame;
pub mod message;

pub use error::CodecError;
pub use frame::{decode_frame, encode_frame, Frame, FrameBody, FrameDecoder, MAX_FRAME_LEN};
pub use message::{Ack, Reply, Request, PROTOCOL_V5, PROTOCOL_V6};
