//! TCP transport for gossip exchanges
//!
//! A [`Connection`] carries framed exchange messages. Every call takes a
//! deadline so a hung peer can never pin the caller.

use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::messages::{GossipRequest, GossipResponse, MessageError};
use crate::peer::PeerAddr;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Encode error: {0}")]
    Encode(#[from] postcard::Error),
    #[error("Could not resolve {0}")]
    Unresolved(PeerAddr),
}

impl TransportError {
    /// The peer sent bytes that could not be decoded
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            TransportError::Message(_)
                | TransportError::Frame(FrameError::UnknownType(_))
                | TransportError::Frame(FrameError::TooLarge { .. })
                | TransportError::Frame(FrameError::Empty)
        )
    }
}

/// Framed connection to a peer
pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Wrap an accepted stream
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, codec: FrameCodec) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, "Failed to set TCP_NODELAY: {}", e);
        }
        Self {
            framed: Framed::new(stream, codec),
            peer_addr,
        }
    }

    /// Dial a peer, trying each resolved address in turn
    pub async fn connect(
        addr: &PeerAddr,
        deadline: Duration,
        codec: FrameCodec,
    ) -> Result<Self, TransportError> {
        let candidates = timeout(deadline, addr.resolve())
            .await
            .map_err(|_| TransportError::Timeout(deadline))??;

        let mut last_err = None;
        for socket_addr in candidates {
            match timeout(deadline, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => return Ok(Self::new(stream, socket_addr, codec)),
                Ok(Err(e)) => last_err = Some(TransportError::Io(e)),
                Err(_) => last_err = Some(TransportError::Timeout(deadline)),
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::Unresolved(addr.clone())))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one frame
    pub async fn send(&mut self, frame: Frame, deadline: Duration) -> Result<(), TransportError> {
        timeout(deadline, self.framed.send(frame))
            .await
            .map_err(|_| TransportError::Timeout(deadline))??;
        Ok(())
    }

    /// Receive one frame; `None` when the peer closed the stream cleanly
    pub async fn recv(&mut self, deadline: Duration) -> Result<Option<Frame>, TransportError> {
        match timeout(deadline, self.framed.next()).await {
            Err(_) => Err(TransportError::Timeout(deadline)),
            Ok(None) => Ok(None),
            Ok(Some(frame)) => Ok(Some(frame?)),
        }
    }

    /// Perform one exchange round as the initiator
    pub async fn exchange(
        &mut self,
        request: &GossipRequest,
        deadline: Duration,
    ) -> Result<GossipResponse, TransportError> {
        self.send(request.to_frame()?, deadline).await?;
        loop {
            let frame = self
                .recv(deadline)
                .await?
                .ok_or(TransportError::ConnectionClosed)?;
            match frame.frame_type {
                // Keepalives may interleave with the response
                FrameType::Ping => self.send(Frame::pong(), deadline).await?,
                FrameType::Pong => trace!(peer = %self.peer_addr, "pong"),
                _ => return Ok(GossipResponse::from_frame(&frame)?),
            }
        }
    }

    /// Check that the peer is alive
    pub async fn ping(&mut self, deadline: Duration) -> Result<(), TransportError> {
        self.send(Frame::ping(), deadline).await?;
        match self.recv(deadline).await? {
            Some(frame) if frame.frame_type == FrameType::Pong => Ok(()),
            Some(_) | None => Err(TransportError::ConnectionClosed),
        }
    }
}
