use std::time::Duration;

use feedline_codec::{encode_frame, Frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::link::{LinkError, LinkHealth, PeerId, PeerLink};

const READ_CHUNK: usize = 16 * 1024;

/// Length-prefixed CBOR frames over a TCP stream.
#[derive(Debug)]
pub struct TcpLink {
    peer: PeerId,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    health: LinkHealth,
}

impl TcpLink {
    /// Wraps an accepted or connected stream. `name` overrides the peer
    /// name, which otherwise is the address text.
    pub fn from_stream(stream: TcpStream, name: Option<String>) -> Result<Self, LinkError> {
        let addr = stream.peer_addr()?.ip().to_string();
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            peer: PeerId::new(name.unwrap_or_else(|| addr.clone()), addr),
            reader,
            writer,
            decoder: FrameDecoder::new(),
            read_buf: vec![0_u8; READ_CHUNK],
            health: LinkHealth::default(),
        })
    }

    /// Connects to `host:port`, giving up after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, LinkError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(LinkError::Connect {
                    peer: format!("{host}:{port}"),
                    reason: err.to_string(),
                })
            }
            Err(_) => return Err(LinkError::TimedOut),
        };
        Self::from_stream(stream, Some(host.to_string()))
    }
}

impl PeerLink for TcpLink {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    async fn send(&mut self, frame: Frame) -> Result<(), LinkError> {
        let bytes = encode_frame(&frame)?;
        if let Err(err) = self.writer.write_all(&bytes).await {
            self.health.send_errors += 1;
            self.health.last_error = Some(err.to_string());
            return Err(err.into());
        }
        self.health.frames_sent += 1;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>, LinkError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                self.health.frames_received += 1;
                return Ok(Some(frame));
            }
            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    return Err(LinkError::Unexpected("stream ended inside a frame"));
                }
                return Ok(None);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    fn health(&self) -> LinkHealth {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use feedline_codec::{Frame, FrameBody, Reply, Request, PROTOCOL_V6};
    use feedline_core::ProductClass;
    use tokio::net::TcpListener;

    use super::TcpLink;
    use crate::link::PeerLink;

    #[tokio::test]
    async fn frames_cross_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut link = TcpLink::from_stream(stream, None).expect("link");
            assert_eq!(link.peer().addr, "127.0.0.1");
            let frame = link.recv().await.expect("recv").expect("frame");
            assert!(matches!(frame.body, FrameBody::Call(Request::FeedMe { .. })));
            link.send(Frame::reply(PROTOCOL_V6, frame.xid, Reply::ok()))
                .await
                .expect("reply");
            assert!(link.recv().await.expect("eof").is_none());
        });

        let mut link = TcpLink::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .expect("connect");
        link.send(Frame::call(
            PROTOCOL_V6,
            11,
            Request::FeedMe {
                class: ProductClass::everything(),
                primary: true,
            },
        ))
        .await
        .expect("send");
        let reply = link.recv().await.expect("recv").expect("reply");
        assert_eq!(reply.xid, 11);
        assert_eq!(reply.body, FrameBody::Reply(Reply::ok()));
        drop(link);
        server.await.expect("server");
    }
}
