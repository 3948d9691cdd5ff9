//! Single-connection service loop for the receiving side of a session.

use std::time::Duration;

use feedline_codec::{Frame, FrameBody, Reply, Request};
use feedline_transport::{rpc::send_reply, LinkError, PeerLink};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::{CancelFlag, CANCEL_POLL};
use crate::error::SessionError;

/// Why the loop returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// Nothing arrived within the inactivity timeout.
    TimedOut,
    /// The peer closed the connection.
    Reset,
    /// The dispatcher asked for a transfer-mode change.
    SwitchRequested,
    /// A cancellation flag was set.
    Cancelled,
}

/// Handles calls arriving on a connection.
pub trait Dispatcher {
    /// Handles one inbound call and returns its reply.
    fn dispatch(&mut self, request: Request) -> Result<Reply, SessionError>;

    /// Checked after every dispatched call.
    fn should_switch(&self) -> bool {
        false
    }
}

/// Result of waiting for the next frame.
#[derive(Debug)]
pub enum NextFrame {
    Frame(Frame),
    /// The deadline passed first.
    TimedOut,
    /// The peer closed the connection.
    Closed,
    Cancelled,
}

/// Waits for a frame until `deadline`, re-checking the cancellation flags
/// at a fixed granularity.
pub async fn next_frame<L: PeerLink>(
    link: &mut L,
    deadline: Instant,
    cancel: &[&CancelFlag],
    waited: Duration,
) -> Result<NextFrame, SessionError> {
    loop {
        if cancel.iter().any(|flag| flag.is_cancelled()) {
            return Ok(NextFrame::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(NextFrame::TimedOut);
        }
        let wake = deadline.min(now + CANCEL_POLL);
        match tokio::time::timeout_at(wake, link.recv()).await {
            Err(_) => {}
            Ok(Ok(Some(frame))) => return Ok(NextFrame::Frame(frame)),
            Ok(Ok(None)) => return Ok(NextFrame::Closed),
            Ok(Err(err)) => return Err(SessionError::from_link(link.peer(), err, waited)),
        }
    }
}

/// Serves inbound calls until the peer goes quiet, closes, or the
/// dispatcher asks to switch. Every received frame restarts the
/// inactivity timer.
pub async fn run_activity_loop<L, D>(
    link: &mut L,
    inactive_timeout: Duration,
    cancel: &[&CancelFlag],
    dispatcher: &mut D,
) -> Result<ActivityOutcome, SessionError>
where
    L: PeerLink,
    D: Dispatcher + Send,
{
    loop {
        let deadline = Instant::now() + inactive_timeout;
        let frame = match next_frame(link, deadline, cancel, inactive_timeout).await? {
            NextFrame::Frame(frame) => frame,
            NextFrame::TimedOut => return Ok(ActivityOutcome::TimedOut),
            NextFrame::Closed => return Ok(ActivityOutcome::Reset),
            NextFrame::Cancelled => return Ok(ActivityOutcome::Cancelled),
        };

        match frame.body {
            FrameBody::Call(request) => {
                let name = request.name();
                let reply = dispatcher.dispatch(request)?;
                debug!("{} from {}: {}", name, link.peer(), reply.name());
                match send_reply(link, frame.version, frame.xid, reply).await {
                    Ok(()) => {}
                    Err(LinkError::Closed) => return Ok(ActivityOutcome::Reset),
                    Err(err) => {
                        return Err(SessionError::from_link(link.peer(), err, inactive_timeout));
                    }
                }
            }
            FrameBody::Reply(reply) => {
                warn!("Ignoring unsolicited {} reply from {}", reply.name(), link.peer());
            }
        }

        if dispatcher.should_switch() {
            return Ok(ActivityOutcome::SwitchRequested);
        }
    }
}
