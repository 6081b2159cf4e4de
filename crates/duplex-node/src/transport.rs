//! TCP transport between Duplex nodes.
//!
//! Each frame is a big-endian `u32` length followed by a JSON [`Frame`].
//! Both sides open with a `Hello` naming their address; after that every
//! frame carries one protocol envelope. Inbound traffic and connection
//! changes are reported as [`NetworkEvent`]s to the node event loop.

use async_trait::async_trait;
use dashmap::DashMap;
use duplex_core::{Addr, Envelope};
use duplex_engine::{Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
enum Frame {
    Hello { addr: Addr },
    Envelope(Envelope),
}

/// What the transport reports to the node.
#[derive(Debug)]
pub enum NetworkEvent {
    PeerConnected(Addr),
    PeerDisconnected(Addr),
    Message { peer: Addr, envelope: Envelope },
}

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<Envelope>,
}

pub struct TcpTransport {
    me: Addr,
    sessions: DashMap<Addr, Session>,
    next_session: AtomicU64,
    events: mpsc::Sender<NetworkEvent>,
}

impl TcpTransport {
    pub fn new(me: Addr, events: mpsc::Sender<NetworkEvent>) -> Arc<Self> {
        Arc::new(Self {
            me,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(0),
            events,
        })
    }

    /// Bind and accept peers in a background task. Returns the bound address.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.handshake(stream, None).await {
                                tracing::warn!(%remote, error = %e, "inbound handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                }
            }
        });
        tracing::info!(%local, "transport listening");
        Ok(local)
    }

    /// Dial a peer and complete the handshake.
    pub async fn connect(self: &Arc<Self>, peer: Addr, endpoint: &str) -> anyhow::Result<()> {
        if self.is_connected(&peer) {
            return Ok(());
        }
        let stream = TcpStream::connect(endpoint).await?;
        self.handshake(stream, Some(peer)).await
    }

    pub fn connected_peers(&self) -> Vec<Addr> {
        self.sessions.iter().map(|s| *s.key()).collect()
    }

    async fn handshake(self: &Arc<Self>, stream: TcpStream, expected: Option<Addr>) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::Hello { addr: self.me }).await?;
        let peer = match read_frame(&mut reader).await? {
            Frame::Hello { addr } => addr,
            Frame::Envelope(_) => anyhow::bail!("expected hello"),
        };
        if let Some(expected) = expected {
            if peer != expected {
                anyhow::bail!("dialed {expected} but peer says {peer}");
            }
        }
        if peer == self.me {
            anyhow::bail!("connected to self");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = self.sessions.insert(peer, Session { id, outbound: tx }) {
            tracing::info!(peer = %peer, old = old.id, "replacing existing session");
        }
        tracing::info!(peer = %peer, session = id, "peer session established");

        tokio::spawn(write_loop(peer, writer, rx));
        let transport = self.clone();
        tokio::spawn(async move { transport.read_loop(peer, id, reader).await });

        self.emit(NetworkEvent::PeerConnected(peer)).await;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, peer: Addr, id: u64, mut reader: OwnedReadHalf) {
        loop {
            match read_frame(&mut reader).await {
                Ok(Frame::Envelope(envelope)) => {
                    self.emit(NetworkEvent::Message { peer, envelope }).await;
                }
                Ok(Frame::Hello { .. }) => {
                    tracing::warn!(peer = %peer, "unexpected hello on open session");
                }
                Err(e) => {
                    tracing::info!(peer = %peer, error = %e, "peer stream closed");
                    break;
                }
            }
        }
        // A newer session for the same peer stays in place.
        if self.sessions.remove_if(&peer, |_, s| s.id == id).is_some() {
            self.emit(NetworkEvent::PeerDisconnected(peer)).await;
        }
    }

    async fn emit(&self, event: NetworkEvent) {
        if self.events.send(event).await.is_err() {
            tracing::warn!("node event loop gone, dropping network event");
        }
    }
}

async fn write_loop(peer: Addr, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &Frame::Envelope(envelope)).await {
            tracing::warn!(peer = %peer, error = %e, "write to peer failed");
            break;
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> anyhow::Result<()> {
    let body = serde_json::to_vec(frame)?;
    let len = u32::try_from(body.len())?;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> anyhow::Result<Frame> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_message(&self, peer: &Addr, envelope: Envelope) -> Result<(), TransportError> {
        let session = self
            .sessions
            .get(peer)
            .ok_or(TransportError::NotConnected(*peer))?;
        session
            .outbound
            .send(envelope)
            .map_err(|_| TransportError::Io {
                peer: *peer,
                reason: "session writer stopped".into(),
            })
    }

    fn is_connected(&self, peer: &Addr) -> bool {
        self.sessions.contains_key(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::{Message, PayId};
    use std::time::Duration;

    fn addr(b: u8) -> Addr {
        Addr([b; 32])
    }

    async fn next_event(rx: &mut mpsc::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_connect_and_deliver() {
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        let a = TcpTransport::new(addr(1), a_tx);
        let b = TcpTransport::new(addr(2), b_tx);

        let b_addr = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        a.connect(addr(2), &b_addr.to_string()).await.unwrap();

        assert!(matches!(next_event(&mut a_rx).await, NetworkEvent::PeerConnected(p) if p == addr(2)));
        assert!(matches!(next_event(&mut b_rx).await, NetworkEvent::PeerConnected(p) if p == addr(1)));
        assert!(a.is_connected(&addr(2)));

        let envelope = Envelope::new(Message::RevealSecret {
            pay_id: PayId([7; 32]),
            secret: vec![1, 2, 3],
        });
        a.write_message(&addr(2), envelope.clone()).await.unwrap();
        match next_event(&mut b_rx).await {
            NetworkEvent::Message { peer, envelope: got } => {
                assert_eq!(peer, addr(1));
                assert_eq!(got, envelope);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_peer_address_rejected() {
        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, _b_rx) = mpsc::channel(16);
        let a = TcpTransport::new(addr(1), a_tx);
        let b = TcpTransport::new(addr(2), b_tx);

        let b_addr = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let result = a.connect(addr(3), &b_addr.to_string()).await;
        assert!(result.is_err());
        assert!(!a.is_connected(&addr(3)));
    }

    #[tokio::test]
    async fn test_write_to_unknown_peer() {
        let (tx, _rx) = mpsc::channel(16);
        let a = TcpTransport::new(addr(1), tx);
        let envelope = Envelope::new(Message::RevealSecret {
            pay_id: PayId([7; 32]),
            secret: vec![1, 2, 3],
        });
        let result = a.write_message(&addr(9), envelope).await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));
    }
}
