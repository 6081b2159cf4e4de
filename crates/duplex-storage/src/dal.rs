//! Typed data-access layer over a [`KvStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use duplex_core::{
    Addr, ChannelId, ChannelSeqNums, DelegationProof, Envelope, OnChainBalance, PayDirection,
    PayId, PayState, SignedSimplexState,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, TxError};
use crate::kv::{KvStore, KvTransaction};
use crate::records::{
    ChannelInfo, DelegatedPayRecord, LeaseRecord, PayStateRecord, SecretRecord, StoredPay,
};

const T_CHANNEL: &str = "ch";
const T_PEER_TOKEN_CID: &str = "ptc";
const T_PEER_ACTIVE_CIDS: &str = "pac";
const T_SIMPLEX: &str = "ss";
const T_ON_CHAIN_BALANCE: &str = "onb";
const T_SEQ_NUMS: &str = "csn";
const T_MESSAGE_LOG: &str = "cmq";
const T_PAY: &str = "cp";
const T_PAY_STATE: &str = "pst";
const T_SECRET: &str = "sr";
const T_DELEGATED_PAY: &str = "dp";
const T_DELEGATION: &str = "dlg";
const T_RECEIPT_SIGNER: &str = "rs";
const T_LEASE: &str = "ls";

/// Shared handle to the store plus the conflict retry policy.
#[derive(Clone)]
pub struct Dal {
    store: Arc<dyn KvStore>,
    max_retry: u32,
    retry_delay: Duration,
}

impl Dal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            max_retry: 10,
            retry_delay: Duration::from_millis(10),
        }
    }

    pub fn with_retry(mut self, max_retry: u32, retry_delay: Duration) -> Self {
        self.max_retry = max_retry.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Run `body` in one transaction and commit it.
    ///
    /// On a write conflict the transaction is discarded and `body` runs again
    /// after `retry_delay`, up to `max_retry` attempts. Any other error
    /// discards the transaction and is returned as is.
    pub async fn transactional<T, E, F>(&self, mut body: F) -> Result<T, E>
    where
        F: FnMut(&mut DalTx<'_>) -> Result<T, E> + Send,
        E: TxError,
    {
        for attempt in 1..=self.max_retry {
            match self.run_once(&mut body) {
                Err(e) if e.is_conflict() => {
                    tracing::debug!(attempt, "transaction conflict, retrying");
                }
                other => return other,
            }
            tokio::time::sleep(self.retry_delay).await;
        }
        tracing::error!(retries = self.max_retry, "transaction retries exhausted");
        Err(StorageError::RetriesExhausted(self.max_retry).into())
    }

    fn run_once<T, E, F>(&self, body: &mut F) -> Result<T, E>
    where
        F: FnMut(&mut DalTx<'_>) -> Result<T, E>,
        E: TxError,
    {
        let mut tx = self.begin()?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.discard();
                Err(e)
            }
        }
    }

    /// Open a transaction without retry handling.
    pub fn begin(&self) -> Result<DalTx<'_>, StorageError> {
        Ok(DalTx {
            inner: self.store.begin()?,
        })
    }
}

/// A transaction with typed accessors for every logical table.
pub struct DalTx<'a> {
    inner: Box<dyn KvTransaction + 'a>,
}

fn key(table: &str, parts: &[&dyn std::fmt::Display]) -> Vec<u8> {
    let mut k = table.to_string();
    for part in parts {
        k.push('/');
        k.push_str(&part.to_string());
    }
    k.into_bytes()
}

fn seq_key(seq: u64) -> String {
    format!("{seq:020}")
}

impl<'a> DalTx<'a> {
    pub fn commit(self) -> Result<(), StorageError> {
        self.inner.commit()
    }

    pub fn discard(self) {
        self.inner.discard()
    }

    fn get_json<T: DeserializeOwned>(&mut self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.inner.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&mut self, key: &[u8], value: &T) -> Result<(), StorageError> {
        self.inner.put(key, serde_json::to_vec(value)?)
    }

    fn get_proto<M: prost::Message + Default>(&mut self, key: &[u8]) -> Result<Option<M>, StorageError> {
        match self.inner.get(key)? {
            Some(bytes) => Ok(Some(M::decode(bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    fn put_proto<M: prost::Message>(&mut self, key: &[u8], value: &M) -> Result<(), StorageError> {
        self.inner.put(key, value.encode_to_vec())
    }

    fn exists(&mut self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.inner.get(key)?.is_some())
    }

    // channel info

    pub fn get_channel(&mut self, cid: &ChannelId) -> Result<Option<ChannelInfo>, StorageError> {
        self.get_json(&key(T_CHANNEL, &[cid]))
    }

    pub fn put_channel(&mut self, cid: &ChannelId, info: &ChannelInfo) -> Result<(), StorageError> {
        self.put_json(&key(T_CHANNEL, &[cid]), info)
    }

    pub fn list_channels(&mut self) -> Result<Vec<(ChannelId, ChannelInfo)>, StorageError> {
        let prefix = key(T_CHANNEL, &[&""]);
        let mut out = Vec::new();
        for (k, v) in self.inner.scan_prefix(&prefix)? {
            let hex_cid = String::from_utf8_lossy(&k[prefix.len()..]).to_string();
            let cid = ChannelId::from_hex(&hex_cid)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            out.push((cid, serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    pub fn get_cid_by_peer_token(
        &mut self,
        peer: &Addr,
        token: &Addr,
    ) -> Result<Option<ChannelId>, StorageError> {
        self.get_json(&key(T_PEER_TOKEN_CID, &[peer, token]))
    }

    pub fn put_cid_by_peer_token(
        &mut self,
        peer: &Addr,
        token: &Addr,
        cid: &ChannelId,
    ) -> Result<(), StorageError> {
        self.put_json(&key(T_PEER_TOKEN_CID, &[peer, token]), cid)
    }

    pub fn get_peer_active_cids(&mut self, peer: &Addr) -> Result<Option<Vec<ChannelId>>, StorageError> {
        self.get_json(&key(T_PEER_ACTIVE_CIDS, &[peer]))
    }

    pub fn put_peer_active_cids(&mut self, peer: &Addr, cids: &[ChannelId]) -> Result<(), StorageError> {
        self.put_json(&key(T_PEER_ACTIVE_CIDS, &[peer]), &cids)
    }

    // simplex states

    pub fn get_simplex_state(
        &mut self,
        cid: &ChannelId,
        peer_from: &Addr,
    ) -> Result<Option<SignedSimplexState>, StorageError> {
        self.get_proto(&key(T_SIMPLEX, &[cid, peer_from]))
    }

    pub fn put_simplex_state(
        &mut self,
        cid: &ChannelId,
        peer_from: &Addr,
        state: &SignedSimplexState,
    ) -> Result<(), StorageError> {
        self.put_proto(&key(T_SIMPLEX, &[cid, peer_from]), state)
    }

    pub fn get_on_chain_balance(&mut self, cid: &ChannelId) -> Result<Option<OnChainBalance>, StorageError> {
        self.get_json(&key(T_ON_CHAIN_BALANCE, &[cid]))
    }

    pub fn put_on_chain_balance(&mut self, cid: &ChannelId, balance: &OnChainBalance) -> Result<(), StorageError> {
        self.put_json(&key(T_ON_CHAIN_BALANCE, &[cid]), balance)
    }

    pub fn get_seq_nums(&mut self, cid: &ChannelId) -> Result<Option<ChannelSeqNums>, StorageError> {
        self.get_json(&key(T_SEQ_NUMS, &[cid]))
    }

    pub fn put_seq_nums(&mut self, cid: &ChannelId, seq_nums: &ChannelSeqNums) -> Result<(), StorageError> {
        self.put_json(&key(T_SEQ_NUMS, &[cid]), seq_nums)
    }

    // durable per-channel message log

    pub fn get_message(&mut self, cid: &ChannelId, seq: u64) -> Result<Option<Envelope>, StorageError> {
        self.get_json(&key(T_MESSAGE_LOG, &[cid, &seq_key(seq)]))
    }

    pub fn put_message(&mut self, cid: &ChannelId, seq: u64, msg: &Envelope) -> Result<(), StorageError> {
        self.put_json(&key(T_MESSAGE_LOG, &[cid, &seq_key(seq)]), msg)
    }

    pub fn delete_message(&mut self, cid: &ChannelId, seq: u64) -> Result<(), StorageError> {
        self.inner.delete(&key(T_MESSAGE_LOG, &[cid, &seq_key(seq)]))
    }

    /// Logged messages of a channel in sequence order.
    pub fn list_messages(&mut self, cid: &ChannelId) -> Result<Vec<(u64, Envelope)>, StorageError> {
        let prefix = key(T_MESSAGE_LOG, &[cid, &""]);
        let mut out = Vec::new();
        for (k, v) in self.inner.scan_prefix(&prefix)? {
            let seq = String::from_utf8_lossy(&k[prefix.len()..])
                .parse::<u64>()
                .map_err(|e| StorageError::Serialization(format!("bad message log key: {e}")))?;
            out.push((seq, serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    // pays

    pub fn get_pay(&mut self, pay_id: &PayId) -> Result<Option<StoredPay>, StorageError> {
        self.get_json(&key(T_PAY, &[pay_id]))
    }

    pub fn put_pay(&mut self, pay_id: &PayId, pay: &StoredPay) -> Result<(), StorageError> {
        self.put_json(&key(T_PAY, &[pay_id]), pay)
    }

    pub fn has_pay(&mut self, pay_id: &PayId) -> Result<bool, StorageError> {
        self.exists(&key(T_PAY, &[pay_id]))
    }

    pub fn get_pay_state(
        &mut self,
        pay_id: &PayId,
        dir: PayDirection,
    ) -> Result<Option<PayStateRecord>, StorageError> {
        self.get_json(&key(T_PAY_STATE, &[pay_id, &dir]))
    }

    pub fn put_pay_state(
        &mut self,
        pay_id: &PayId,
        dir: PayDirection,
        cid: &ChannelId,
        state: PayState,
    ) -> Result<(), StorageError> {
        let record = PayStateRecord {
            cid: *cid,
            state,
            updated_at: Utc::now(),
        };
        self.put_json(&key(T_PAY_STATE, &[pay_id, &dir]), &record)
    }

    pub fn has_pay_state(&mut self, pay_id: &PayId, dir: PayDirection) -> Result<bool, StorageError> {
        self.exists(&key(T_PAY_STATE, &[pay_id, &dir]))
    }

    // secrets, keyed by hash lock

    pub fn get_secret(&mut self, hash: &[u8]) -> Result<Option<SecretRecord>, StorageError> {
        self.get_json(&key(T_SECRET, &[&hex::encode(hash)]))
    }

    pub fn put_secret(&mut self, hash: &[u8], preimage: &[u8], pay_id: &PayId) -> Result<(), StorageError> {
        let record = SecretRecord {
            preimage: preimage.to_vec(),
            pay_id: *pay_id,
        };
        self.put_json(&key(T_SECRET, &[&hex::encode(hash)]), &record)
    }

    pub fn delete_secret(&mut self, hash: &[u8]) -> Result<(), StorageError> {
        self.inner.delete(&key(T_SECRET, &[&hex::encode(hash)]))
    }

    // delegation

    pub fn get_delegated_pay(&mut self, pay_id: &PayId) -> Result<Option<DelegatedPayRecord>, StorageError> {
        self.get_json(&key(T_DELEGATED_PAY, &[pay_id]))
    }

    pub fn put_delegated_pay(&mut self, pay_id: &PayId, record: &DelegatedPayRecord) -> Result<(), StorageError> {
        self.put_json(&key(T_DELEGATED_PAY, &[pay_id]), record)
    }

    pub fn delete_delegated_pay(&mut self, pay_id: &PayId) -> Result<(), StorageError> {
        self.inner.delete(&key(T_DELEGATED_PAY, &[pay_id]))
    }

    pub fn list_delegated_pays(&mut self) -> Result<Vec<(PayId, DelegatedPayRecord)>, StorageError> {
        let prefix = key(T_DELEGATED_PAY, &[&""]);
        let mut out = Vec::new();
        for (k, v) in self.inner.scan_prefix(&prefix)? {
            let pay_id = PayId::from_hex(&String::from_utf8_lossy(&k[prefix.len()..]))
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            out.push((pay_id, serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    pub fn get_delegation(
        &mut self,
        delegator: &Addr,
        token: &Addr,
    ) -> Result<Option<DelegationProof>, StorageError> {
        self.get_proto(&key(T_DELEGATION, &[delegator, token]))
    }

    pub fn put_delegation(
        &mut self,
        delegator: &Addr,
        token: &Addr,
        proof: &DelegationProof,
    ) -> Result<(), StorageError> {
        self.put_proto(&key(T_DELEGATION, &[delegator, token]), proof)
    }

    pub fn get_receipt_signer(&mut self, pay_id: &PayId) -> Result<Option<Addr>, StorageError> {
        self.get_json(&key(T_RECEIPT_SIGNER, &[pay_id]))
    }

    pub fn put_receipt_signer(&mut self, pay_id: &PayId, signer: &Addr) -> Result<(), StorageError> {
        self.put_json(&key(T_RECEIPT_SIGNER, &[pay_id]), signer)
    }

    // leases

    pub fn get_lease(&mut self, id: &str) -> Result<Option<LeaseRecord>, StorageError> {
        self.get_json(&key(T_LEASE, &[&id]))
    }

    pub fn put_lease(&mut self, id: &str, lease: &LeaseRecord) -> Result<(), StorageError> {
        self.put_json(&key(T_LEASE, &[&id]), lease)
    }

    pub fn delete_lease(&mut self, id: &str) -> Result<(), StorageError> {
        self.inner.delete(&key(T_LEASE, &[&id]))
    }
}
