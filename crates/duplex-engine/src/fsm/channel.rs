//! Channel lifecycle transitions over a storage transaction.

use chrono::Utc;
use duplex_core::{Addr, ChannelId, ChannelState, CoreError};
use duplex_storage::{ChannelInfo, DalTx};

use crate::error::EngineError;

fn load(tx: &mut DalTx<'_>, cid: &ChannelId) -> Result<ChannelInfo, EngineError> {
    tx.get_channel(cid)?
        .ok_or_else(|| CoreError::ChannelNotFound(*cid).into())
}

fn set_state(
    tx: &mut DalTx<'_>,
    cid: &ChannelId,
    mut info: ChannelInfo,
    to: ChannelState,
) -> Result<(), EngineError> {
    tracing::debug!(cid = %cid, from = %info.state, to = %to, "channel state transition");
    info.state = to;
    info.state_ts = Utc::now();
    tx.put_channel(cid, &info)?;
    Ok(())
}

fn invalid(state: ChannelState, operation: &'static str) -> EngineError {
    CoreError::InvalidChannelState { state, operation }.into()
}

/// Record a newly opened channel and index it under its peer.
///
/// `state` is `TrustOpened` for a channel opened before on-chain backing and
/// `Opened` for one already instantiated.
pub fn on_auth_open(
    tx: &mut DalTx<'_>,
    cid: &ChannelId,
    peer: &Addr,
    token: &Addr,
    state: ChannelState,
) -> Result<(), EngineError> {
    if tx.get_channel(cid)?.is_some() {
        return Err(CoreError::ChannelExists { cid: *cid }.into());
    }
    if !matches!(state, ChannelState::TrustOpened | ChannelState::Opened) {
        return Err(invalid(state, "open"));
    }
    let info = ChannelInfo {
        peer: *peer,
        token: *token,
        state,
        state_ts: Utc::now(),
    };
    tx.put_channel(cid, &info)?;
    tx.put_cid_by_peer_token(peer, token, cid)?;

    let mut cids = tx.get_peer_active_cids(peer)?.unwrap_or_default();
    if !cids.contains(cid) {
        cids.push(*cid);
    }
    tx.put_peer_active_cids(peer, &cids)?;
    tracing::debug!(cid = %cid, peer = %peer, state = %state, "channel opened");
    Ok(())
}

pub fn on_instantiate(tx: &mut DalTx<'_>, cid: &ChannelId) -> Result<(), EngineError> {
    let info = load(tx, cid)?;
    match info.state {
        ChannelState::TrustOpened => set_state(tx, cid, info, ChannelState::Instantiating),
        ChannelState::Instantiating => Ok(()),
        state => Err(invalid(state, "instantiate")),
    }
}

pub fn on_instantiated(tx: &mut DalTx<'_>, cid: &ChannelId) -> Result<(), EngineError> {
    let info = load(tx, cid)?;
    match info.state {
        ChannelState::Instantiating => set_state(tx, cid, info, ChannelState::Opened),
        ChannelState::Opened => Ok(()),
        state => Err(invalid(state, "instantiated")),
    }
}

pub fn on_intend_settle(tx: &mut DalTx<'_>, cid: &ChannelId) -> Result<(), EngineError> {
    let info = load(tx, cid)?;
    match info.state {
        ChannelState::Opened => set_state(tx, cid, info, ChannelState::Settling),
        ChannelState::Settling => Ok(()),
        state => Err(invalid(state, "intend settle")),
    }
}

/// Close the channel and drop it from its peer's active set.
pub fn on_confirm_settle(tx: &mut DalTx<'_>, cid: &ChannelId) -> Result<(), EngineError> {
    let info = load(tx, cid)?;
    if info.state == ChannelState::Closed {
        return Ok(());
    }
    let peer = info.peer;
    if let Some(mut cids) = tx.get_peer_active_cids(&peer)? {
        cids.retain(|c| c != cid);
        tx.put_peer_active_cids(&peer, &cids)?;
    }
    set_state(tx, cid, info, ChannelState::Closed)
}

/// Guard run by every step that changes a simplex state of the channel.
pub fn on_update_simplex(tx: &mut DalTx<'_>, cid: &ChannelId) -> Result<ChannelInfo, EngineError> {
    let info = load(tx, cid)?;
    if !info.state.accepts_payments() {
        tracing::error!(cid = %cid, state = %info.state, "simplex update on inactive channel");
        return Err(invalid(info.state, "update simplex"));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_storage::{Dal, MemKvStore};
    use std::sync::Arc;

    const CID: ChannelId = ChannelId([1; 32]);
    const PEER: Addr = Addr([2; 32]);

    async fn run<T, F>(dal: &Dal, body: F) -> Result<T, EngineError>
    where
        F: FnMut(&mut DalTx<'_>) -> Result<T, EngineError> + Send,
    {
        dal.transactional(body).await
    }

    async fn opened(state: ChannelState) -> Dal {
        let dal = Dal::new(Arc::new(MemKvStore::new()));
        run(&dal, |tx| on_auth_open(tx, &CID, &PEER, &Addr::ZERO, state))
            .await
            .unwrap();
        dal
    }

    async fn state_of(dal: &Dal) -> ChannelState {
        run(dal, |tx| load(tx, &CID)).await.unwrap().state
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let dal = opened(ChannelState::Opened).await;
        let err = run(&dal, |tx| {
            on_auth_open(tx, &CID, &PEER, &Addr::ZERO, ChannelState::Opened)
        })
        .await
        .unwrap_err();
        assert!(err.is_core(&CoreError::ChannelExists { cid: CID }));
        let cids = run(&dal, |tx| Ok(tx.get_peer_active_cids(&PEER)?)).await.unwrap();
        assert_eq!(cids, Some(vec![CID]));
    }

    #[tokio::test]
    async fn test_trust_open_to_opened() {
        let dal = opened(ChannelState::TrustOpened).await;
        assert!(run(&dal, |tx| on_intend_settle(tx, &CID)).await.is_err());
        run(&dal, |tx| on_instantiate(tx, &CID)).await.unwrap();
        run(&dal, |tx| on_instantiate(tx, &CID)).await.unwrap();
        assert_eq!(state_of(&dal).await, ChannelState::Instantiating);
        run(&dal, |tx| on_instantiated(tx, &CID)).await.unwrap();
        assert_eq!(state_of(&dal).await, ChannelState::Opened);
    }

    #[tokio::test]
    async fn test_settle_flow() {
        let dal = opened(ChannelState::Opened).await;
        run(&dal, |tx| on_update_simplex(tx, &CID)).await.unwrap();
        run(&dal, |tx| on_intend_settle(tx, &CID)).await.unwrap();
        run(&dal, |tx| on_intend_settle(tx, &CID)).await.unwrap();
        assert!(matches!(
            run(&dal, |tx| on_update_simplex(tx, &CID)).await,
            Err(EngineError::Core(CoreError::InvalidChannelState {
                state: ChannelState::Settling,
                ..
            }))
        ));
        run(&dal, |tx| on_confirm_settle(tx, &CID)).await.unwrap();
        run(&dal, |tx| on_confirm_settle(tx, &CID)).await.unwrap();
        assert_eq!(state_of(&dal).await, ChannelState::Closed);
        let cids = run(&dal, |tx| Ok(tx.get_peer_active_cids(&PEER)?)).await.unwrap();
        assert_eq!(cids, Some(vec![]));
        assert!(run(&dal, |tx| on_intend_settle(tx, &CID)).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let dal = Dal::new(Arc::new(MemKvStore::new()));
        assert!(matches!(
            run(&dal, |tx| on_update_simplex(tx, &CID)).await,
            Err(EngineError::Core(CoreError::ChannelNotFound(_)))
        ));
    }
}
