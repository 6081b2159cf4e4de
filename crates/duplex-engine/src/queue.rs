//! Per-channel ordered delivery of state-updating messages.
//!
//! Every outgoing request that offers a new simplex state gets the next
//! sequence number of its channel and is logged before it is queued. The
//! queue keeps three counters per channel:
//!
//! - `acked`: highest sequence the peer co-signed or rejected
//! - `sent`: highest sequence written to the transport
//! - `added`: highest sequence handed to the queue
//!
//! A single dispatcher task drains channels that have unsent messages.
//! Messages stay in the queue until acked, so a peer reconnect or an
//! out-of-order nack can rewind `sent` and replay them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use duplex_core::{Addr, ChannelId, ChannelSeqNums, Envelope};
use duplex_storage::Dal;
use tokio::sync::Notify;

use crate::error::EngineError;
use crate::ledger;
use crate::traits::Transport;

/// Messages kept in memory per channel. Older ones are read back from the
/// message log when needed.
const MAX_IN_MEMORY: usize = 256;

#[derive(Debug)]
struct ChannelQueue {
    peer: Addr,
    acked: u64,
    sent: u64,
    added: u64,
    msgs: BTreeMap<u64, Envelope>,
}

impl ChannelQueue {
    fn insert(&mut self, seq: u64, envelope: Envelope) {
        if self.msgs.len() < MAX_IN_MEMORY || self.msgs.contains_key(&seq) {
            self.msgs.insert(seq, envelope);
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Channels with messages that are added but not yet sent.
    work: BTreeSet<ChannelId>,
    queues: HashMap<ChannelId, ChannelQueue>,
    peer_cids: HashMap<Addr, Vec<ChannelId>>,
    /// Last channel served, so batches rotate through the work set.
    cursor: Option<ChannelId>,
}

impl QueueState {
    /// Returns true when the work set went from empty to non-empty.
    fn mark_work(&mut self, cid: ChannelId) -> bool {
        let was_empty = self.work.is_empty();
        self.work.insert(cid);
        was_empty
    }

    fn next_batch(&mut self, size: usize) -> Vec<ChannelId> {
        let start = match self.cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        let mut batch: Vec<ChannelId> = self
            .work
            .range((start, Bound::Unbounded))
            .take(size)
            .copied()
            .collect();
        for cid in &self.work {
            if batch.len() >= size {
                break;
            }
            if !batch.contains(cid) {
                batch.push(*cid);
            }
        }
        self.cursor = batch.last().copied();
        batch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    /// Nothing left to send on the channel.
    Idle,
    Failed,
}

/// Delivery counters of one channel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub acked: u64,
    pub sent: u64,
    pub added: u64,
}

pub struct MsgQueue {
    dal: Dal,
    transport: Arc<dyn Transport>,
    me: Addr,
    batch_size: usize,
    retry_delay: Duration,
    state: Mutex<QueueState>,
    dispatcher: Notify,
}

impl MsgQueue {
    pub fn new(
        dal: Dal,
        transport: Arc<dyn Transport>,
        me: Addr,
        batch_size: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            dal,
            transport,
            me,
            batch_size: batch_size.max(1),
            retry_delay,
            state: Mutex::new(QueueState::default()),
            dispatcher: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Counters change in single critical sections, so a poisoned state is
        // still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self, was_empty: bool) {
        if was_empty {
            self.dispatcher.notify_one();
        }
    }

    /// Drain channels with unsent messages until the task is aborted.
    pub async fn run_dispatcher(self: Arc<Self>) {
        tracing::info!(batch = self.batch_size, "message queue dispatcher started");
        loop {
            let batch = self.lock().next_batch(self.batch_size);
            if batch.is_empty() {
                self.dispatcher.notified().await;
                continue;
            }
            let results = futures::future::join_all(batch.iter().map(|cid| self.send_next(cid))).await;
            if results.iter().all(|r| *r == SendOutcome::Failed) {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
    }

    /// Send the next unsent message of `cid`.
    async fn send_next(&self, cid: &ChannelId) -> SendOutcome {
        let (peer, seq, cached) = {
            let mut st = self.lock();
            let next = match st.queues.get(cid) {
                Some(q) if q.sent < q.added => {
                    let seq = q.sent + 1;
                    Some((q.peer, seq, q.msgs.get(&seq).cloned()))
                }
                _ => None,
            };
            match next {
                Some(next) => next,
                None => {
                    st.work.remove(cid);
                    return SendOutcome::Idle;
                }
            }
        };

        let envelope = match cached {
            Some(envelope) => envelope,
            None => match self.load_logged(cid, seq).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Skip it; the peer will nack and the sender resends.
                    tracing::error!(cid = %cid, seq, error = %e, "queued message unavailable, skipping");
                    if let Some(q) = self.lock().queues.get_mut(cid) {
                        if q.sent + 1 == seq {
                            q.sent = seq;
                        }
                    }
                    return SendOutcome::Failed;
                }
            },
        };

        if let Err(e) = self.transport.write_message(&peer, envelope).await {
            tracing::warn!(cid = %cid, peer = %peer, seq, error = %e, "send queued message failed");
            return SendOutcome::Failed;
        }
        tracing::debug!(cid = %cid, peer = %peer, seq, "queued message sent");
        if let Some(q) = self.lock().queues.get_mut(cid) {
            if q.sent + 1 == seq {
                q.sent = seq;
            }
        }
        SendOutcome::Sent
    }

    async fn load_logged(&self, cid: &ChannelId, seq: u64) -> Result<Envelope, EngineError> {
        self.dal
            .transactional(|tx| -> Result<_, EngineError> {
                tx.get_message(cid, seq)?
                    .ok_or(EngineError::MessageNotFound { cid: *cid, seq })
            })
            .await
    }

    /// Queue a logged message for delivery to `peer`.
    pub fn add_msg(
        &self,
        peer: &Addr,
        cid: &ChannelId,
        seq: u64,
        envelope: Envelope,
    ) -> Result<(), EngineError> {
        let mut st = self.lock();
        if !st.peer_cids.contains_key(peer) {
            return Err(EngineError::PeerNotConnected(*peer));
        }
        if !st.queues.contains_key(cid) {
            if seq != 1 {
                return Err(EngineError::QueueNotFound(*cid));
            }
            st.queues.insert(
                *cid,
                ChannelQueue {
                    peer: *peer,
                    acked: 0,
                    sent: 0,
                    added: 0,
                    msgs: BTreeMap::new(),
                },
            );
            if let Some(cids) = st.peer_cids.get_mut(peer) {
                cids.push(*cid);
            }
            tracing::debug!(cid = %cid, peer = %peer, "message queue created");
        }
        let Some(q) = st.queues.get_mut(cid) else {
            return Err(EngineError::QueueNotFound(*cid));
        };
        q.added = q.added.max(seq);
        q.insert(seq, envelope);
        let was_empty = st.mark_work(*cid);
        drop(st);
        self.wake(was_empty);
        Ok(())
    }

    /// Record the peer's response up to `ack`; `nack` is the highest
    /// sequence it rejected.
    pub fn ack_msg(&self, cid: &ChannelId, ack: u64, nack: u64) -> Result<(), EngineError> {
        if nack != 0 && ack == nack {
            tracing::error!(cid = %cid, ack, "ack and nack carry the same sequence");
        }
        let mut st = self.lock();
        let q = st
            .queues
            .get_mut(cid)
            .ok_or(EngineError::QueueNotFound(*cid))?;
        if nack > q.sent {
            q.sent = nack;
        }
        if ack <= q.acked {
            return Ok(());
        }
        if ack > q.sent {
            q.sent = ack;
        }
        let stale: Vec<u64> = q.msgs.range(q.acked + 1..=ack).map(|(s, _)| *s).collect();
        for seq in stale {
            q.msgs.remove(&seq);
        }
        q.acked = ack;
        if q.acked >= q.added {
            st.work.remove(cid);
        }
        Ok(())
    }

    /// Rewind delivery so `seq` is sent again.
    pub fn resend(&self, cid: &ChannelId, seq: u64) -> Result<(), EngineError> {
        let mut st = self.lock();
        let q = st
            .queues
            .get_mut(cid)
            .ok_or(EngineError::QueueNotFound(*cid))?;
        if seq <= q.acked {
            return Err(EngineError::StaleResend {
                cid: *cid,
                seq,
                acked: q.acked,
            });
        }
        if seq - 1 < q.sent {
            tracing::debug!(cid = %cid, seq, sent = q.sent, "rewinding queue for resend");
            q.sent = seq - 1;
            let was_empty = st.mark_work(*cid);
            drop(st);
            self.wake(was_empty);
        }
        Ok(())
    }

    /// A queued message still held in memory.
    pub fn get_msg(&self, cid: &ChannelId, seq: u64) -> Option<Envelope> {
        self.lock().queues.get(cid)?.msgs.get(&seq).cloned()
    }

    pub fn status(&self, cid: &ChannelId) -> Option<QueueStatus> {
        self.lock().queues.get(cid).map(|q| QueueStatus {
            acked: q.acked,
            sent: q.sent,
            added: q.added,
        })
    }

    pub fn has_peer(&self, peer: &Addr) -> bool {
        self.lock().peer_cids.contains_key(peer)
    }

    /// Restore the queues of every active channel with `peer`.
    ///
    /// Unacked messages are reloaded from the message log and sent again
    /// from the highest sequence the peer already answered.
    pub async fn add_peer(&self, peer: &Addr) -> Result<(), EngineError> {
        if self.has_peer(peer) {
            return Err(EngineError::PeerAlreadyAdded(*peer));
        }
        let cids = self.active_cids(peer).await?;

        let mut loaded = Vec::with_capacity(cids.len());
        for cid in cids {
            match self.load_queue(&cid, peer).await {
                Ok(q) => loaded.push((cid, q)),
                Err(e) => {
                    tracing::warn!(cid = %cid, peer = %peer, error = %e, "cannot restore message queue")
                }
            }
        }

        let mut st = self.lock();
        if st.peer_cids.contains_key(peer) {
            return Err(EngineError::PeerAlreadyAdded(*peer));
        }
        let mut was_empty = false;
        let mut cids = Vec::with_capacity(loaded.len());
        for (cid, q) in loaded {
            if q.sent < q.added {
                was_empty |= st.mark_work(cid);
            }
            st.queues.insert(cid, q);
            cids.push(cid);
        }
        tracing::info!(peer = %peer, channels = cids.len(), "peer message queues added");
        st.peer_cids.insert(*peer, cids);
        drop(st);
        self.wake(was_empty);
        Ok(())
    }

    pub fn remove_peer(&self, peer: &Addr) -> Result<(), EngineError> {
        let mut st = self.lock();
        let cids = st
            .peer_cids
            .remove(peer)
            .ok_or(EngineError::PeerNotConnected(*peer))?;
        for cid in &cids {
            st.queues.remove(cid);
            st.work.remove(cid);
        }
        tracing::info!(peer = %peer, channels = cids.len(), "peer message queues removed");
        Ok(())
    }

    async fn active_cids(&self, peer: &Addr) -> Result<Vec<ChannelId>, EngineError> {
        self.dal
            .transactional(|tx| -> Result<_, EngineError> {
                if let Some(cids) = tx.get_peer_active_cids(peer)? {
                    return Ok(cids);
                }
                let cids: Vec<ChannelId> = tx
                    .list_channels()?
                    .into_iter()
                    .filter(|(_, info)| info.peer == *peer && !info.state.is_final())
                    .map(|(cid, _)| cid)
                    .collect();
                tracing::info!(peer = %peer, channels = cids.len(), "recovered active channels");
                tx.put_peer_active_cids(peer, &cids)?;
                Ok(cids)
            })
            .await
    }

    async fn load_queue(&self, cid: &ChannelId, peer: &Addr) -> Result<ChannelQueue, EngineError> {
        let me = self.me;
        let (seq_nums, msgs) = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let seq_nums = match tx.get_seq_nums(cid)? {
                    Some(s) => s,
                    None => {
                        let s = ledger::seq_nums(tx, cid, &me)?;
                        tx.put_seq_nums(cid, &s)?;
                        s
                    }
                };
                let ChannelSeqNums {
                    last_acked,
                    last_used,
                    ..
                } = seq_nums;
                if last_acked > last_used {
                    return Err(EngineError::CorruptedSeqNums {
                        cid: *cid,
                        acked: last_acked,
                        used: last_used,
                    });
                }
                let mut msgs = BTreeMap::new();
                for seq in (last_acked + 1..=last_used).take(MAX_IN_MEMORY) {
                    if let Some(envelope) = tx.get_message(cid, seq)? {
                        msgs.insert(seq, envelope);
                    }
                }
                Ok((seq_nums, msgs))
            })
            .await?;

        let sent = seq_nums.delivered().min(seq_nums.last_used);
        tracing::debug!(
            cid = %cid,
            acked = seq_nums.last_acked,
            sent,
            added = seq_nums.last_used,
            "message queue restored"
        );
        Ok(ChannelQueue {
            peer: *peer,
            acked: seq_nums.last_acked,
            sent,
            added: seq_nums.last_used,
            msgs,
        })
    }
}
