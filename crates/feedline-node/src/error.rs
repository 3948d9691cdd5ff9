use std::fmt;
use std::time::Duration;

use feedline_transport::LinkError;
use thiserror::Error;

use crate::registry::RegistryError;
use crate::store::StoreError;

/// Why a subscription or offer was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// A requested pattern does not compile.
    BadPattern,
    /// Nothing in the request is allowed for this peer.
    NotAllowed,
    /// The request shares nothing with what the peer may receive.
    EmptyIntersection,
    /// The peer answered with an unusable class.
    BadReclass,
    /// Reclassification did not converge.
    TooManyReclass,
    /// The peer refused without giving a reason.
    Refused,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::BadPattern => "bad pattern",
            DenyReason::NotAllowed => "request not allowed",
            DenyReason::EmptyIntersection => "request and allowed products don't intersect",
            DenyReason::BadReclass => "invalid reclassification",
            DenyReason::TooManyReclass => "too many reclassifications",
            DenyReason::Refused => "request denied",
        })
    }
}

/// Failure of one upstream or downstream session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport failed below the protocol.
    #[error("transport failure with {peer}: {source}")]
    ClientTransport {
        peer: String,
        #[source]
        source: LinkError,
    },
    /// The peer does not serve the requested protocol version.
    #[error("{peer} speaks protocol versions {low} through {high} only")]
    VersionMismatch { peer: String, low: u32, high: u32 },
    /// No traffic from the peer within the allowed interval.
    #[error("no heartbeat from {peer} for {} seconds", .after.as_secs())]
    TimedOut { peer: String, after: Duration },
    /// The peer closed the connection.
    #[error("connection to {peer} closed")]
    ConnectionClosed { peer: String },
    /// The peer refused the subscription or offer.
    #[error("{peer}: {reason}")]
    AdmissionDenied { peer: String, reason: DenyReason },
    /// The product store failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// A local system failure unrelated to the peer.
    #[error("system failure: {0}")]
    System(String),
}

impl SessionError {
    /// Maps a link failure observed while talking to `peer`.
    pub fn from_link(peer: &impl fmt::Display, err: LinkError, waited: Duration) -> Self {
        let peer = peer.to_string();
        match err {
            LinkError::Closed => SessionError::ConnectionClosed { peer },
            LinkError::TimedOut => SessionError::TimedOut {
                peer,
                after: waited,
            },
            source => SessionError::ClientTransport { peer, source },
        }
    }

    /// Errors after which the whole process must stop.
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, SessionError::Storage(_) | SessionError::System(_))
    }

    /// Whether a reconnect should wait before retrying.
    pub fn should_backoff(&self) -> bool {
        !matches!(self, SessionError::TimedOut { .. })
    }

    /// Failures that are part of normal network churn.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            SessionError::TimedOut { .. } | SessionError::ConnectionClosed { .. }
        )
    }
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        SessionError::System(err.to_string())
    }
}
