//! The Duplex node orchestrator.
//!
//! Wires the protocol engine to RocksDB, the TCP transport and the admin
//! API, then runs the event loop that feeds network events and API
//! commands into the engine.

use anyhow::Result;
use duplex_core::{
    Addr, ChannelState, ConditionalPay, OnChainBalance, PayId, PayNote, SettleReason,
};
use duplex_crypto::{KeyPair, KeyPairSigner};
use duplex_engine::{Engine, EngineError, OfflineRegistry, PaymentCallbacks};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chain::EstimatedBlockOracle;
use crate::commands::{CommandError, NodeCommand, PayResponse};
use crate::config::NodeConfig;
use crate::routing::ConfigRouter;
use crate::state::NodeState;
use crate::storage::RocksKvStore;
use crate::transport::{NetworkEvent, TcpTransport};

/// Logs every payment outcome.
struct LoggingCallbacks;

impl PaymentCallbacks for LoggingCallbacks {
    fn handle_receiving_start(&self, pay_id: PayId, _pay: &ConditionalPay, _note: Option<&PayNote>) {
        tracing::info!(pay_id = %pay_id, "incoming pay started");
    }

    fn handle_receiving_done(
        &self,
        pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        reason: SettleReason,
    ) {
        tracing::info!(pay_id = %pay_id, reason = %reason, "incoming pay settled");
    }

    fn handle_send_complete(
        &self,
        pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        reason: SettleReason,
    ) {
        tracing::info!(pay_id = %pay_id, reason = %reason, "outgoing pay settled");
    }

    fn handle_send_fail(&self, pay_id: PayId, _pay: &ConditionalPay, _note: Option<&PayNote>, error: &str) {
        tracing::warn!(pay_id = %pay_id, error, "outgoing pay failed");
    }

    fn handle_destination_unreachable(
        &self,
        pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
    ) {
        tracing::warn!(pay_id = %pay_id, "pay destination unreachable");
    }
}

pub struct DuplexNode {
    config: NodeConfig,
    /// Taken by `start`, which moves it into the engine's signer.
    keypair: Option<KeyPair>,
    address: Addr,
    engine: Option<Arc<Engine>>,
    transport: Option<Arc<TcpTransport>>,
    command_rx: Option<mpsc::Receiver<NodeCommand>>,
    event_rx: Option<mpsc::Receiver<NetworkEvent>>,
}

impl DuplexNode {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let keypair = load_or_generate_keypair(&config.node.key_path)?;
        let address = keypair.addr();
        tracing::info!(address = %address, "Duplex node created");
        Ok(Self {
            config,
            keypair: Some(keypair),
            address,
            engine: None,
            transport: None,
            command_rx: None,
            event_rx: None,
        })
    }

    pub fn address(&self) -> Addr {
        self.address
    }

    /// Open storage, build the engine and start the transport and the API.
    pub async fn start(&mut self) -> Result<()> {
        let keypair = self
            .keypair
            .take()
            .ok_or_else(|| anyhow::anyhow!("node already started"))?;

        let store = RocksKvStore::open(&self.config.storage.data_dir)?;
        tracing::info!(path = %self.config.storage.data_dir.display(), "storage initialized");

        let (event_tx, event_rx) = mpsc::channel::<NetworkEvent>(1024);
        let transport = TcpTransport::new(self.address, event_tx);
        let router = ConfigRouter::from_config(&self.config.network.routes)?;
        tracing::info!(routes = router.len(), "static routes loaded");

        let engine = Arc::new(
            Engine::builder(
                Arc::new(KeyPairSigner::new(keypair)),
                Arc::new(store),
                transport.clone(),
                Arc::new(EstimatedBlockOracle::new(&self.config.chain)),
            )
            .registry(Arc::new(OfflineRegistry))
            .router(Arc::new(router))
            .callbacks(Arc::new(LoggingCallbacks))
            .config(Arc::new(self.config.engine.clone()))
            .build(),
        );
        engine.start_dispatcher();

        let listen_addr = transport.listen(self.config.p2p_addr()?).await?;
        tracing::info!(%listen_addr, block = engine.current_block(), "transport started");

        let (command_tx, command_rx) = mpsc::channel::<NodeCommand>(256);
        let node_state = Arc::new(NodeState::new(engine.clone(), transport.clone(), command_tx));
        let api_addr = self.config.api_addr()?;
        tokio::spawn(async move {
            if let Err(e) = crate::api::start_api_server(api_addr, node_state).await {
                tracing::error!(error = %e, "admin API server error");
            }
        });

        for peer in &self.config.network.bootstrap_peers {
            let addr = Addr::from_hex(&peer.addr)?;
            let endpoint = peer.endpoint.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.connect(addr, &endpoint).await {
                    tracing::warn!(peer = %addr, %endpoint, error = %e, "bootstrap dial failed");
                }
            });
        }

        self.engine = Some(engine);
        self.transport = Some(transport);
        self.command_rx = Some(command_rx);
        self.event_rx = Some(event_rx);
        Ok(())
    }

    /// Run the node's main event loop: processes network events and API commands.
    pub async fn run(&mut self) -> Result<()> {
        let mut event_rx = self
            .event_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        let engine = self
            .engine
            .clone()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;

        tracing::info!("entering main event loop");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(ev) => Self::handle_network_event(&engine, ev).await,
                        None => {
                            tracing::info!("network event channel closed");
                            break;
                        }
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(c) => {
                            let engine = engine.clone();
                            let transport = transport.clone();
                            tokio::spawn(async move {
                                Self::handle_api_command(c, &engine, &transport).await;
                            });
                        }
                        None => {
                            tracing::info!("API command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down Duplex node");
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
        self.transport = None;
        tracing::info!("Duplex node shut down");
        Ok(())
    }

    /// Inbound messages are handled in arrival order.
    async fn handle_network_event(engine: &Engine, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected(peer) => {
                let added = match engine.add_peer(&peer).await {
                    // A replaced session: rebuild the queues so unacked
                    // messages go out on the new stream.
                    Err(EngineError::PeerAlreadyAdded(_)) => {
                        if let Err(e) = engine.remove_peer(&peer) {
                            tracing::warn!(peer = %peer, error = %e, "cannot drop stale queues");
                        }
                        engine.add_peer(&peer).await
                    }
                    other => other,
                };
                match added {
                    Ok(()) => tracing::info!(peer = %peer, "peer connected"),
                    Err(e) => tracing::error!(peer = %peer, error = %e, "cannot add peer"),
                }
            }
            NetworkEvent::PeerDisconnected(peer) => {
                if let Err(e) = engine.remove_peer(&peer) {
                    tracing::warn!(peer = %peer, error = %e, "cannot remove peer");
                }
                tracing::info!(peer = %peer, "peer disconnected");
            }
            NetworkEvent::Message { peer, envelope } => {
                let kind = envelope.message.kind();
                if let Err(e) = engine.handle_message(&peer, envelope).await {
                    tracing::warn!(peer = %peer, kind, error = %e, "message handling failed");
                }
            }
        }
    }

    async fn handle_api_command(cmd: NodeCommand, engine: &Engine, transport: &Arc<TcpTransport>) {
        match cmd {
            NodeCommand::OpenChannel {
                peer,
                token,
                cid,
                my_deposit,
                peer_deposit,
                reply,
            } => {
                let balance = OnChainBalance {
                    my_deposit,
                    peer_deposit,
                    ..Default::default()
                };
                let result = engine
                    .open_channel(&peer, &token, &cid, balance, ChannelState::TrustOpened)
                    .await
                    .map_err(CommandError::from);
                let _ = reply.send(result);
            }
            NodeCommand::SendDirectPay {
                dest,
                token,
                amount,
                reply,
            } => {
                tracing::info!(dest = %dest, token = %token, %amount, "sending direct pay");
                let result = engine
                    .send_direct_pay(&dest, &token, amount, None)
                    .await
                    .map(|pay_id| PayResponse { pay_id })
                    .map_err(CommandError::from);
                let _ = reply.send(result);
            }
            NodeCommand::SendConditionalPay {
                dest,
                token,
                amount,
                timeout,
                reply,
            } => {
                tracing::info!(dest = %dest, token = %token, %amount, timeout, "sending conditional pay");
                let secret = duplex_crypto::random_secret();
                let result = engine
                    .send_conditional_pay(&dest, &token, amount, &secret, timeout, None)
                    .await
                    .map(|pay_id| PayResponse { pay_id })
                    .map_err(CommandError::from);
                let _ = reply.send(result);
            }
            NodeCommand::ConnectPeer {
                peer,
                endpoint,
                reply,
            } => {
                let result = transport
                    .connect(peer, &endpoint)
                    .await
                    .map_err(|e| CommandError::Rejected(e.to_string()));
                let _ = reply.send(result);
            }
        }
    }
}

/// Load a hex secret key from disk, or generate and save a new one.
fn load_or_generate_keypair(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)?;
        let keypair = KeyPair::from_hex(&contents)
            .map_err(|e| anyhow::anyhow!("failed to decode key: {}", e))?;
        tracing::info!(path = %path.display(), "loaded key from disk");
        Ok(keypair)
    } else {
        let keypair = KeyPair::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, keypair.secret_hex().as_bytes())?;
        tracing::info!(path = %path.display(), "generated and saved new key");
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("duplex-node-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_config(dir: &Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.key_path = dir.join("node.key");
        config.storage.data_dir = dir.join("db");
        config.network.listen_addr = "127.0.0.1".into();
        config.network.port = 0;
        config.api.port = 0;
        config
    }

    #[test]
    fn test_keypair_persisted() {
        let dir = temp_dir();
        let path = dir.join("keys").join("node.key");
        let first = load_or_generate_keypair(&path).unwrap();
        let second = load_or_generate_keypair(&path).unwrap();
        assert_eq!(first.addr(), second.addr());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_node_creation() {
        let dir = temp_dir();
        let node = DuplexNode::new(test_config(&dir)).unwrap();
        assert!(!node.address().is_zero());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_node_start_and_shutdown() {
        let dir = temp_dir();
        let mut node = DuplexNode::new(test_config(&dir)).unwrap();
        node.start().await.expect("start failed");
        assert!(node.start().await.is_err());
        node.shutdown().await.expect("shutdown failed");
        std::fs::remove_dir_all(&dir).ok();
    }
}
