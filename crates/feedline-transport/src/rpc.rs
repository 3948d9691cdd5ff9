use std::time::Duration;

use feedline_codec::{Frame, FrameBody, Reply, Request};
use tracing::debug;

use crate::link::{LinkError, PeerLink};

/// Call side of the request/reply exchange over a [`PeerLink`].
#[derive(Debug, Clone)]
pub struct RpcClient {
    version: u32,
    next_xid: u32,
    timeout: Option<Duration>,
}

impl RpcClient {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            next_xid: 1,
            timeout: None,
        }
    }

    /// Bounds the wait for each reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn take_xid(&mut self) -> u32 {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1).max(1);
        xid
    }

    /// Sends `request` and waits for the reply with the matching id.
    pub async fn call<L: PeerLink>(
        &mut self,
        link: &mut L,
        request: Request,
    ) -> Result<Reply, LinkError> {
        let xid = self.take_xid();
        let name = request.name();
        link.send(Frame::call(self.version, xid, request)).await?;
        let wait = async {
            loop {
                let Some(frame) = link.recv().await? else {
                    return Err(LinkError::Closed);
                };
                match frame.body {
                    FrameBody::Reply(reply) if frame.xid == xid => return Ok(reply),
                    FrameBody::Reply(reply) => {
                        debug!("discarding stale {} reply {} to {}", reply.name(), frame.xid, name);
                    }
                    FrameBody::Call(_) => {
                        return Err(LinkError::Unexpected("call received while awaiting a reply"))
                    }
                }
            }
        };
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| LinkError::TimedOut)?,
            None => wait.await,
        }
    }
}

/// Answers the call identified by `xid`.
pub async fn send_reply<L: PeerLink>(
    link: &mut L,
    version: u32,
    xid: u32,
    reply: Reply,
) -> Result<(), LinkError> {
    link.send(Frame::reply(version, xid, reply)).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use feedline_codec::{Ack, Frame, FrameBody, Reply, Request, PROTOCOL_V6};

    use super::{send_reply, RpcClient};
    use crate::link::{InMemoryLink, LinkError, PeerId, PeerLink};

    fn pair() -> (InMemoryLink, InMemoryLink) {
        InMemoryLink::pair(PeerId::new("a", "10.0.0.1"), PeerId::new("b", "10.0.0.2"))
    }

    #[tokio::test]
    async fn call_skips_stale_replies() {
        let (mut client_link, mut server_link) = pair();
        let server = tokio::spawn(async move {
            let frame = server_link.recv().await.expect("recv").expect("frame");
            assert!(matches!(frame.body, FrameBody::Call(Request::IsAlive { id: 4 })));
            server_link
                .send(Frame::reply(PROTOCOL_V6, frame.xid + 100, Reply::ok()))
                .await
                .expect("stale");
            send_reply(&mut server_link, PROTOCOL_V6, frame.xid, Reply::Ok(Ack::Alive(true)))
                .await
                .expect("reply");
            server_link
        });
        let mut rpc = RpcClient::new(PROTOCOL_V6);
        let reply = rpc
            .call(&mut client_link, Request::IsAlive { id: 4 })
            .await
            .expect("call");
        assert_eq!(reply, Reply::Ok(Ack::Alive(true)));
        server.await.expect("server task");
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_without_reply() {
        let (mut client_link, _server_link) = pair();
        let mut rpc = RpcClient::new(PROTOCOL_V6).with_timeout(Duration::from_secs(5));
        let err = rpc
            .call(&mut client_link, Request::NullProc)
            .await
            .expect_err("no reply");
        assert!(matches!(err, LinkError::TimedOut));
    }

    #[tokio::test]
    async fn call_reports_closed_link() {
        let (mut client_link, server_link) = pair();
        drop(server_link);
        let mut rpc = RpcClient::new(PROTOCOL_V6);
        let err = rpc
            .call(&mut client_link, Request::NullProc)
            .await
            .expect_err("closed");
        assert!(matches!(err, LinkError::Closed));
    }
}
