use std::fmt;
use std::future::Future;

use feedline_codec::{CodecError, Frame};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identity of the remote end of a link, as used by access control.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId {
    /// Host name (falls back to the address text when unresolved).
    pub name: String,
    /// Dotted-quad (or other textual) network address.
    pub addr: String,
}

impl PeerId {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.addr {
            f.write_str(&self.name)
        } else {
            write!(f, "{} [{}]", self.name, self.addr)
        }
    }
}

/// Errors returned by link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The peer closed the link.
    #[error("link closed by peer")]
    Closed,
    /// A call did not receive its reply in time.
    #[error("call timed out")]
    TimedOut,
    /// Could not resolve or connect to the peer.
    #[error("couldn't connect to {peer}: {reason}")]
    Connect { peer: String, reason: String },
    /// A frame arrived that the current exchange cannot accept.
    #[error("unexpected frame: {0}")]
    Unexpected(&'static str),
}

/// Coarse per-link counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkHealth {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_errors: u64,
    pub last_error: Option<String>,
}

/// Frame-oriented, ordered, reliable connection to one peer.
pub trait PeerLink: Send {
    /// Identity of the remote end.
    fn peer(&self) -> &PeerId;

    /// Sends one frame.
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Waits for the next inbound frame. `Ok(None)` means the peer closed
    /// the link cleanly.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>, LinkError>> + Send;

    /// Best-effort counters for diagnostics.
    fn health(&self) -> LinkHealth {
        LinkHealth::default()
    }
}

/// In-memory link for tests and simulations.
#[derive(Debug)]
pub struct InMemoryLink {
    peer: PeerId,
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    health: LinkHealth,
}

impl InMemoryLink {
    /// Creates two connected ends. `a` sees `b_id` as its peer and vice versa.
    pub fn pair(a_id: PeerId, b_id: PeerId) -> (InMemoryLink, InMemoryLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = InMemoryLink {
            peer: b_id,
            tx: Some(a_tx),
            rx: a_rx,
            health: LinkHealth::default(),
        };
        let b = InMemoryLink {
            peer: a_id,
            tx: Some(b_tx),
            rx: b_rx,
            health: LinkHealth::default(),
        };
        (a, b)
    }

    /// Closes the sending direction; the other end sees end-of-stream once
    /// it has drained queued frames.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

impl PeerLink for InMemoryLink {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    async fn send(&mut self, frame: Frame) -> Result<(), LinkError> {
        let Some(tx) = &self.tx else {
            self.health.send_errors += 1;
            return Err(LinkError::Closed);
        };
        if tx.send(frame).is_err() {
            self.health.send_errors += 1;
            self.health.last_error = Some("peer dropped".to_string());
            return Err(LinkError::Closed);
        }
        self.health.frames_sent += 1;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>, LinkError> {
        let frame = self.rx.recv().await;
        if frame.is_some() {
            self.health.frames_received += 1;
        }
        Ok(frame)
    }

    fn health(&self) -> LinkHealth {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use feedline_codec::{Frame, Reply, Request, PROTOCOL_V6};

    use super::{InMemoryLink, LinkError, PeerId, PeerLink};

    #[tokio::test]
    async fn pair_delivers_in_order_and_reports_close() {
        let (mut a, mut b) = InMemoryLink::pair(
            PeerId::new("down.example", "10.0.0.2"),
            PeerId::new("up.example", "10.0.0.1"),
        );
        assert_eq!(a.peer().name, "up.example");
        assert_eq!(b.peer().name, "down.example");

        a.send(Frame::call(PROTOCOL_V6, 1, Request::NullProc))
            .await
            .expect("send");
        a.send(Frame::reply(PROTOCOL_V6, 2, Reply::ok()))
            .await
            .expect("send");
        a.close();

        assert_eq!(b.recv().await.expect("recv").map(|f| f.xid), Some(1));
        assert_eq!(b.recv().await.expect("recv").map(|f| f.xid), Some(2));
        assert!(b.recv().await.expect("recv").is_none());
        assert_eq!(b.health().frames_received, 2);
        assert!(matches!(
            a.send(Frame::call(PROTOCOL_V6, 3, Request::NullProc)).await,
            Err(LinkError::Closed)
        ));
    }

    #[test]
    fn peer_id_display_omits_duplicate_address() {
        assert_eq!(PeerId::new("10.0.0.1", "10.0.0.1").to_string(), "10.0.0.1");
        assert_eq!(
            PeerId::new("up.example", "10.0.0.1").to_string(),
            "up.example [10.0.0.1]"
        );
    }
}
