//! Shared node state for cross-task communication.

use duplex_engine::Engine;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::commands::NodeCommand;
use crate::transport::TcpTransport;

/// Shared state for the running node, accessible from HTTP handlers.
pub struct NodeState {
    pub engine: Arc<Engine>,
    pub transport: Arc<TcpTransport>,
    pub start_time: Instant,
    /// Channel to send commands to the event loop.
    pub command_tx: mpsc::Sender<NodeCommand>,
}

impl NodeState {
    pub fn new(
        engine: Arc<Engine>,
        transport: Arc<TcpTransport>,
        command_tx: mpsc::Sender<NodeCommand>,
    ) -> Self {
        Self {
            engine,
            transport,
            start_time: Instant::now(),
            command_tx,
        }
    }
}
