use serde::{Deserialize, Serialize};

use feedline_core::{Product, ProductClass, ProductInfo, Signature};

/// Legacy protocol version: primary delivery only, no resume token.
pub const PROTOCOL_V5: u32 = 5;
/// Current protocol version.
pub const PROTOCOL_V6: u32 = 6;

/// Remote procedure calls exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// No-op call; also flushes any batched replies.
    NullProc,
    /// Upstream offers to send `class`.
    Hiya { class: ProductClass },
    /// Downstream requests products in `class`. `primary` asks for
    /// single-message delivery of small products.
    FeedMe { class: ProductClass, primary: bool },
    /// Downstream requests notifications about products in `class`.
    NotifyMe { class: ProductClass },
    /// Whether the upstream session with `id` is still running.
    IsAlive { id: u32 },
    /// Single self-contained product delivery.
    HereIs { product: Product },
    /// Announces a product that follows as chunks.
    ComingSoon { info: ProductInfo, chunk_size: u32 },
    /// One chunk of an announced product.
    BlkData {
        signature: Signature,
        offset: u32,
        data: Vec<u8>,
    },
    /// Metadata-only delivery.
    Notification { info: ProductInfo },
}

impl Request {
    /// Short procedure name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Request::NullProc => "NULLPROC",
            Request::Hiya { .. } => "HIYA",
            Request::FeedMe { .. } => "FEEDME",
            Request::NotifyMe { .. } => "NOTIFYME",
            Request::IsAlive { .. } => "IS_ALIVE",
            Request::HereIs { .. } => "HEREIS",
            Request::ComingSoon { .. } => "COMINGSOON",
            Request::BlkData { .. } => "BLKDATA",
            Request::Notification { .. } => "NOTIFICATION",
        }
    }
}

/// Payload of a successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    Empty,
    /// Accepted subscription; carries the upstream session id.
    Session(u32),
    /// Accepted offer; carries the largest product to send as a single message.
    MaxHereis(u32),
    Alive(bool),
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ok(Ack),
    /// Narrowed class the caller must re-offer.
    Reclassify(ProductClass),
    /// Resend the announced product from chunk 0.
    Restart,
    /// Receiver does not want the announced product.
    DontSend,
    /// A requested pattern does not compile.
    BadPattern,
    ShuttingDown,
    /// Generic refusal (authentication failure).
    Denied,
    /// The requested protocol version is not served.
    VersionMismatch { low: u32, high: u32 },
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Ok(Ack::Empty)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Reply::Ok(_) => "OK",
            Reply::Reclassify(_) => "RECLASS",
            Reply::Restart => "RESTART",
            Reply::DontSend => "DONT_SEND",
            Reply::BadPattern => "BADPATTERN",
            Reply::ShuttingDown => "SHUTTING_DOWN",
            Reply::Denied => "DENIED",
            Reply::VersionMismatch { .. } => "VERSION_MISMATCH",
        }
    }
}
