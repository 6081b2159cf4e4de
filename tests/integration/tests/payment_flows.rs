//! End-to-end payment flows between in-process engines.
//!
//! Every node has its own in-memory store and a capturing transport. The
//! `Net` pump moves captured messages between nodes until the network is
//! quiet, optionally dropping some of them.

use std::sync::Arc;
use std::time::Duration;

use duplex_core::{
    Addr, Amount, ChannelId, ChannelState, DelegationProof, EngineConfig, Envelope, Message,
    OnChainBalance, PayDirection, PayId, PayState, SettleReason,
};
use duplex_crypto::{KeyPair, KeyPairSigner};
use duplex_engine::testing::{
    CallbackEvent, ManualBlockOracle, MemTransport, RecordingCallbacks, StaticPayRegistry,
    StaticRouter,
};
use duplex_engine::Engine;
use duplex_storage::MemKvStore;

const TOKEN: Addr = Addr::ZERO;
const DEPOSIT: Amount = 100;
const START_BLOCK: u64 = 100;

struct Node {
    addr: Addr,
    keypair: KeyPair,
    engine: Engine,
    transport: Arc<MemTransport>,
    oracle: Arc<ManualBlockOracle>,
    callbacks: Arc<RecordingCallbacks>,
    router: Arc<StaticRouter>,
}

fn node(seed: u8) -> Node {
    node_with_config(seed, EngineConfig::default())
}

fn node_with_config(seed: u8, config: EngineConfig) -> Node {
    let keypair = KeyPair::from_seed(&[seed; 32]);
    let addr = keypair.addr();
    let transport = Arc::new(MemTransport::new());
    let oracle = Arc::new(ManualBlockOracle::new(START_BLOCK));
    let callbacks = Arc::new(RecordingCallbacks::default());
    let router = Arc::new(StaticRouter::default());
    let engine = Engine::builder(
        Arc::new(KeyPairSigner::new(KeyPair::from_seed(&[seed; 32]))),
        Arc::new(MemKvStore::new()),
        transport.clone(),
        oracle.clone(),
    )
    .registry(Arc::new(StaticPayRegistry::default()))
    .router(router.clone())
    .callbacks(callbacks.clone())
    .config(Arc::new(config))
    .build();
    engine.start_dispatcher();
    Node {
        addr,
        keypair,
        engine,
        transport,
        oracle,
        callbacks,
        router,
    }
}

fn balance() -> OnChainBalance {
    OnChainBalance {
        my_deposit: DEPOSIT,
        peer_deposit: DEPOSIT,
        ..Default::default()
    }
}

/// Open a channel on both sides and, when `online`, connect the peers.
async fn open(a: &Node, b: &Node, cid: ChannelId, online: bool) {
    a.engine
        .open_channel(&b.addr, &TOKEN, &cid, balance(), ChannelState::Opened)
        .await
        .expect("open on a");
    b.engine
        .open_channel(&a.addr, &TOKEN, &cid, balance(), ChannelState::Opened)
        .await
        .expect("open on b");
    if online {
        connect(a, b).await;
    }
}

async fn connect(a: &Node, b: &Node) {
    a.transport.connect(b.addr);
    b.transport.connect(a.addr);
    a.engine.add_peer(&b.addr).await.expect("add peer on a");
    b.engine.add_peer(&a.addr).await.expect("add peer on b");
}

struct Net<'a> {
    nodes: Vec<&'a Node>,
}

impl<'a> Net<'a> {
    fn new(nodes: &[&'a Node]) -> Self {
        Self {
            nodes: nodes.to_vec(),
        }
    }

    async fn pump(&self) {
        self.pump_filtered(|_, _, _| true).await;
    }

    /// Deliver captured messages until five consecutive rounds move nothing.
    /// Messages for which `keep` returns false are dropped.
    async fn pump_filtered(&self, mut keep: impl FnMut(&Addr, &Addr, &Envelope) -> bool) {
        let mut quiet = 0;
        for _ in 0..500 {
            let mut moved = false;
            for from in &self.nodes {
                for (to, envelope) in from.transport.take() {
                    moved = true;
                    if !keep(&from.addr, &to, &envelope) {
                        continue;
                    }
                    if let Some(target) = self.nodes.iter().find(|n| n.addr == to) {
                        // Rejections are part of the flows under test.
                        let _ = target.engine.handle_message(&from.addr, envelope).await;
                    }
                }
            }
            if moved {
                quiet = 0;
            } else {
                quiet += 1;
                if quiet >= 5 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Wait until the dispatcher of `node` has written `count` messages.
async fn wait_outbox(node: &Node, count: usize) {
    for _ in 0..200 {
        if node.transport.pending() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("outbox never reached {count} messages");
}

fn is_kind(envelope: &Envelope, kind: &str) -> bool {
    envelope.message.kind() == kind
}

// =========================================================================
// Direct pays
// =========================================================================

#[tokio::test]
async fn test_direct_pay() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;
    let net = Net::new(&[&a, &b]);

    let pay_id = a
        .engine
        .send_direct_pay(&b.addr, &TOKEN, 30, None)
        .await
        .expect("send direct pay");
    net.pump().await;

    let mine = a.engine.channel_balance(&cid).await.unwrap();
    assert_eq!(mine.my_free, 70);
    assert_eq!(mine.peer_free, 130);
    let theirs = b.engine.channel_balance(&cid).await.unwrap();
    assert_eq!(theirs.my_free, 130);

    assert_eq!(
        a.callbacks.events(),
        vec![CallbackEvent::SendComplete(pay_id, SettleReason::PayPaidMax)]
    );
    assert_eq!(
        b.callbacks.events(),
        vec![CallbackEvent::ReceivingDone(pay_id, SettleReason::PayPaidMax)]
    );
    assert_eq!(
        a.engine.pay_state(&pay_id, PayDirection::Egress).await.unwrap(),
        Some(PayState::CoSignedPaid)
    );
    assert_eq!(a.engine.queue_status(&cid).unwrap().acked, 1);
}

#[tokio::test]
async fn test_direct_pay_needs_direct_channel() {
    let a = node(1);
    let b = node(2);
    let c = node(3);
    open(&a, &b, ChannelId([10; 32]), true).await;

    let result = a.engine.send_direct_pay(&c.addr, &TOKEN, 5, None).await;
    assert!(result.is_err());
    assert!(a.engine.send_direct_pay(&a.addr, &TOKEN, 5, None).await.is_err());
}

#[tokio::test]
async fn test_direct_pay_over_balance_rejected() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;

    let result = a.engine.send_direct_pay(&b.addr, &TOKEN, DEPOSIT + 1, None).await;
    assert!(result.is_err());
    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_free, DEPOSIT);
}

#[tokio::test]
async fn test_lost_request_is_resent() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;
    let net = Net::new(&[&a, &b]);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(a.engine.send_direct_pay(&b.addr, &TOKEN, 10, None).await.unwrap());
    }
    wait_outbox(&a, 3).await;

    // The first request is lost; the other two arrive out of sequence.
    let mut sent = a.transport.take().into_iter();
    sent.next();
    for (_, envelope) in sent {
        let _ = b.engine.handle_message(&a.addr, envelope).await;
    }
    net.pump().await;

    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_free, 70);
    assert_eq!(b.engine.channel_balance(&cid).await.unwrap().my_free, 130);
    let completed: Vec<PayId> = a
        .callbacks
        .events()
        .into_iter()
        .filter_map(|e| match e {
            CallbackEvent::SendComplete(id, SettleReason::PayPaidMax) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(completed, ids);
    let received = b
        .callbacks
        .events()
        .iter()
        .filter(|e| matches!(e, CallbackEvent::ReceivingDone(..)))
        .count();
    assert_eq!(received, 3);
}

#[tokio::test]
async fn test_request_accepted_when_response_cannot_be_written() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;

    let pay_id = a.engine.send_direct_pay(&b.addr, &TOKEN, 10, None).await.unwrap();
    wait_outbox(&a, 1).await;
    b.transport.disconnect(&a.addr);
    for (_, envelope) in a.transport.take() {
        b.engine.handle_message(&a.addr, envelope).await.unwrap();
    }

    assert_eq!(b.transport.pending(), 0);
    assert_eq!(b.engine.channel_balance(&cid).await.unwrap().my_free, 110);
    assert_eq!(
        b.engine.pay_state(&pay_id, PayDirection::Ingress).await.unwrap(),
        Some(PayState::CoSignedPaid)
    );
}

#[tokio::test]
async fn test_duplicate_response_is_ignored() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;

    a.engine.send_direct_pay(&b.addr, &TOKEN, 10, None).await.unwrap();
    wait_outbox(&a, 1).await;
    for (_, envelope) in a.transport.take() {
        b.engine.handle_message(&a.addr, envelope).await.unwrap();
    }
    let responses = b.transport.take();
    assert_eq!(responses.len(), 1);
    let (_, response) = responses[0].clone();
    a.engine.handle_message(&b.addr, response.clone()).await.unwrap();
    a.engine.handle_message(&b.addr, response).await.unwrap();

    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_free, 90);
    assert_eq!(a.callbacks.events().len(), 1);
    assert_eq!(a.engine.queue_status(&cid).unwrap().acked, 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_responses_settle_once() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;

    let pay_id = a.engine.send_direct_pay(&b.addr, &TOKEN, 10, None).await.unwrap();
    wait_outbox(&a, 1).await;
    for (_, envelope) in a.transport.take() {
        b.engine.handle_message(&a.addr, envelope).await.unwrap();
    }
    let responses = b.transport.take();
    assert_eq!(responses.len(), 1);
    let (_, response) = responses[0].clone();

    let results = futures::future::join_all(
        (0..4).map(|_| a.engine.handle_message(&b.addr, response.clone())),
    )
    .await;
    for result in results {
        result.expect("duplicate response handled");
    }

    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_free, 90);
    let completed = a
        .callbacks
        .events()
        .into_iter()
        .filter(|e| matches!(e, CallbackEvent::SendComplete(..)))
        .collect::<Vec<_>>();
    assert_eq!(
        completed,
        vec![CallbackEvent::SendComplete(pay_id, SettleReason::PayPaidMax)]
    );
    assert_eq!(a.engine.queue_status(&cid).unwrap().acked, 1);
}

// =========================================================================
// Refused offers
// =========================================================================

#[tokio::test]
async fn test_nacked_pay_canceled_and_later_pays_resent() {
    let a = node(1);
    let b = node_with_config(
        2,
        EngineConfig {
            pay_resolver: Addr([9; 32]),
            ..EngineConfig::default()
        },
    );
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;
    let net = Net::new(&[&a, &b]);

    let first = a.engine.send_direct_pay(&b.addr, &TOKEN, 10, None).await.unwrap();
    let secret = duplex_crypto::random_secret();
    let refused = a
        .engine
        .send_conditional_pay(&b.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    let last = a.engine.send_direct_pay(&b.addr, &TOKEN, 10, None).await.unwrap();
    // All three requests are on the wire before b refuses the second.
    wait_outbox(&a, 3).await;
    net.pump().await;

    let events = a.callbacks.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallbackEvent::SendFail(id, _) if *id == refused)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, CallbackEvent::SendComplete(id, _) if *id == refused)));
    assert_eq!(
        a.engine.pay_state(&refused, PayDirection::Egress).await.unwrap(),
        Some(PayState::CoSignedCanceled)
    );
    for paid in [first, last] {
        assert_eq!(
            a.engine.pay_state(&paid, PayDirection::Egress).await.unwrap(),
            Some(PayState::CoSignedPaid)
        );
    }

    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_free, 80);
    assert_eq!(b.engine.channel_balance(&cid).await.unwrap().my_free, 120);
    let status = a.engine.queue_status(&cid).unwrap();
    assert_eq!(status.acked, 4);
    assert_eq!(status.sent, 4);
}

#[tokio::test]
async fn test_refreshed_deposit_admits_pay() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    a.engine
        .open_channel(&b.addr, &TOKEN, &cid, balance(), ChannelState::Opened)
        .await
        .unwrap();
    // b has not seen most of a's deposit yet.
    let stale = OnChainBalance {
        my_deposit: DEPOSIT,
        peer_deposit: 5,
        ..Default::default()
    };
    b.engine
        .open_channel(&a.addr, &TOKEN, &cid, stale, ChannelState::Opened)
        .await
        .unwrap();
    connect(&a, &b).await;
    let net = Net::new(&[&a, &b]);

    let secret = duplex_crypto::random_secret();
    let refused = a
        .engine
        .send_conditional_pay(&b.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    net.pump().await;
    assert!(a
        .callbacks
        .events()
        .iter()
        .any(|e| matches!(e, CallbackEvent::SendFail(id, _) if *id == refused)));
    assert_eq!(b.engine.channel_balance(&cid).await.unwrap().peer_free, 5);

    b.engine.update_on_chain_balance(&cid, balance()).await.unwrap();
    let secret = duplex_crypto::random_secret();
    let paid = a
        .engine
        .send_conditional_pay(&b.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    net.pump().await;

    assert!(a
        .callbacks
        .events()
        .contains(&CallbackEvent::SendComplete(paid, SettleReason::PayPaidMax)));
    assert_eq!(
        a.engine.pay_state(&refused, PayDirection::Egress).await.unwrap(),
        Some(PayState::CoSignedCanceled)
    );
    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_free, 90);
    assert_eq!(b.engine.channel_balance(&cid).await.unwrap().my_free, 110);
}

// =========================================================================
// Hash-locked pays over several hops
// =========================================================================

#[tokio::test]
async fn test_multi_hop_conditional_pay() {
    let a = node(1);
    let b = node(2);
    let c = node(3);
    let ab = ChannelId([10; 32]);
    let bc = ChannelId([11; 32]);
    open(&a, &b, ab, true).await;
    open(&b, &c, bc, true).await;
    a.router.set_route(c.addr, TOKEN, ab, b.addr);
    let net = Net::new(&[&a, &b, &c]);

    let secret = duplex_crypto::random_secret();
    let pay_id = a
        .engine
        .send_conditional_pay(&c.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .expect("send conditional pay");
    net.pump().await;

    assert_eq!(a.engine.channel_balance(&ab).await.unwrap().my_free, 90);
    assert_eq!(b.engine.channel_balance(&ab).await.unwrap().my_free, 110);
    assert_eq!(b.engine.channel_balance(&bc).await.unwrap().my_free, 90);
    let c_balance = c.engine.channel_balance(&bc).await.unwrap();
    assert_eq!(c_balance.my_free, 110);
    assert_eq!(c_balance.peer_locked, 0);

    assert_eq!(
        a.callbacks.events(),
        vec![CallbackEvent::SendComplete(pay_id, SettleReason::PayPaidMax)]
    );
    assert_eq!(
        c.callbacks.events(),
        vec![
            CallbackEvent::ReceivingStart(pay_id),
            CallbackEvent::ReceivingDone(pay_id, SettleReason::PayPaidMax),
        ]
    );
    assert_eq!(
        b.engine.pay_state(&pay_id, PayDirection::Ingress).await.unwrap(),
        Some(PayState::CoSignedPaid)
    );
    assert_eq!(
        b.engine.pay_state(&pay_id, PayDirection::Egress).await.unwrap(),
        Some(PayState::CoSignedPaid)
    );
}

#[tokio::test]
async fn test_in_flight_pay_locks_funds_on_every_hop() {
    let a = node(1);
    let b = node(2);
    let c = node(3);
    let ab = ChannelId([10; 32]);
    let bc = ChannelId([11; 32]);
    open(&a, &b, ab, true).await;
    open(&b, &c, bc, true).await;
    a.router.set_route(c.addr, TOKEN, ab, b.addr);
    let net = Net::new(&[&a, &b, &c]);

    let secret = duplex_crypto::random_secret();
    let pay_id = a
        .engine
        .send_conditional_pay(&c.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    // Without the receipt the secret stays hidden and the pay stays pending.
    net.pump_filtered(|_, _, e| !is_kind(e, "cond_pay_receipt"))
        .await;

    let sender = a.engine.channel_balance(&ab).await.unwrap();
    assert_eq!(sender.my_free, 90);
    assert_eq!(sender.my_locked, 10);
    assert_eq!(sender.my_free + sender.my_locked, DEPOSIT);

    let hub_in = b.engine.channel_balance(&ab).await.unwrap();
    assert_eq!(hub_in.my_free, DEPOSIT);
    assert_eq!(hub_in.peer_locked, 10);
    assert_eq!(hub_in.peer_free + hub_in.peer_locked, DEPOSIT);

    let hub_out = b.engine.channel_balance(&bc).await.unwrap();
    assert_eq!(hub_out.my_free, 90);
    assert_eq!(hub_out.my_locked, 10);
    assert_eq!(hub_out.peer_locked, 0);

    let dest = c.engine.channel_balance(&bc).await.unwrap();
    assert_eq!(dest.my_free, DEPOSIT);
    assert_eq!(dest.peer_locked, 10);
    assert_eq!(dest.peer_free + dest.peer_locked, DEPOSIT);

    assert_eq!(
        b.engine.pay_state(&pay_id, PayDirection::Ingress).await.unwrap(),
        Some(PayState::CoSignedPending)
    );
    assert_eq!(
        b.engine.pay_state(&pay_id, PayDirection::Egress).await.unwrap(),
        Some(PayState::CoSignedPending)
    );
    assert!(a.callbacks.events().is_empty());
}

#[tokio::test]
async fn test_expired_pay_is_canceled() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;
    let net = Net::new(&[&a, &b]);

    let secret = duplex_crypto::random_secret();
    let pay_id = a
        .engine
        .send_conditional_pay(&b.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    // Lose the receipt so the secret is never revealed.
    net.pump_filtered(|_, _, e| !is_kind(e, "cond_pay_receipt"))
        .await;
    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_locked, 10);

    assert!(a.engine.settle_expired_pays(&cid).await.unwrap().is_empty());
    a.oracle.set(START_BLOCK + 30);
    b.oracle.set(START_BLOCK + 30);
    let settled = a.engine.settle_expired_pays(&cid).await.unwrap();
    assert_eq!(settled, vec![pay_id]);
    net.pump().await;

    let mine = a.engine.channel_balance(&cid).await.unwrap();
    assert_eq!(mine.my_free, DEPOSIT);
    assert_eq!(mine.my_locked, 0);
    assert_eq!(
        a.callbacks.events(),
        vec![CallbackEvent::SendComplete(pay_id, SettleReason::PayExpired)]
    );
    assert_eq!(
        b.callbacks.events(),
        vec![CallbackEvent::ReceivingDone(pay_id, SettleReason::PayExpired)]
    );
}

#[tokio::test]
async fn test_rejected_pay_is_canceled() {
    let a = node(1);
    let b = node(2);
    let cid = ChannelId([10; 32]);
    open(&a, &b, cid, true).await;
    let net = Net::new(&[&a, &b]);

    let secret = duplex_crypto::random_secret();
    let pay_id = a
        .engine
        .send_conditional_pay(&b.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    net.pump_filtered(|_, _, e| !is_kind(e, "cond_pay_receipt"))
        .await;

    b.engine.reject_incoming_pay(&pay_id).await.unwrap();
    net.pump().await;

    assert_eq!(a.engine.channel_balance(&cid).await.unwrap().my_free, DEPOSIT);
    assert_eq!(
        a.callbacks.events(),
        vec![CallbackEvent::SendComplete(pay_id, SettleReason::PayRejected)]
    );
    assert_eq!(
        b.engine.pay_state(&pay_id, PayDirection::Ingress).await.unwrap(),
        Some(PayState::CoSignedCanceled)
    );
}

// =========================================================================
// Route loops
// =========================================================================

#[tokio::test]
async fn test_route_loop_cancels_pay() {
    let a = node(1);
    let b = node(2);
    let c = node(3);
    let d = node(4);
    let ab = ChannelId([10; 32]);
    let bc = ChannelId([11; 32]);
    open(&a, &b, ab, true).await;
    open(&b, &c, bc, true).await;
    // C routes the pay straight back to B.
    a.router.set_route(d.addr, TOKEN, ab, b.addr);
    b.router.set_route(d.addr, TOKEN, bc, c.addr);
    c.router.set_route(d.addr, TOKEN, bc, b.addr);
    let net = Net::new(&[&a, &b, &c]);

    let secret = duplex_crypto::random_secret();
    let pay_id = a
        .engine
        .send_conditional_pay(&d.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    net.pump().await;

    assert_eq!(
        a.callbacks.events(),
        vec![
            CallbackEvent::DestUnreachable(pay_id),
            CallbackEvent::SendComplete(pay_id, SettleReason::PayDestUnreachable),
        ]
    );
    let mine = a.engine.channel_balance(&ab).await.unwrap();
    assert_eq!(mine.my_free, DEPOSIT);
    assert_eq!(mine.my_locked, 0);
    for cid in [&ab, &bc] {
        let hub = b.engine.channel_balance(cid).await.unwrap();
        assert_eq!(hub.my_locked, 0);
        assert_eq!(hub.peer_locked, 0);
    }
}

// =========================================================================
// Delegated receiving
// =========================================================================

fn delegation(delegator: &Node, delegatee: &Node, expires: u64) -> DelegationProof {
    let mut proof = DelegationProof {
        delegator: delegator.addr.to_vec(),
        delegatee: delegatee.addr.to_vec(),
        token: TOKEN.to_vec(),
        expires_at_block: expires,
        delegator_sig: Vec::new(),
    };
    proof.delegator_sig = duplex_crypto::sign(&proof.signing_bytes(), &delegator.keypair).to_vec();
    proof
}

#[tokio::test]
async fn test_accept_delegation_checks_proof() {
    let b = node(2);
    let c = node(3);
    let d = node(4);

    assert!(b.engine.accept_delegation(delegation(&c, &d, 1000)).await.is_err());
    assert!(b.engine.accept_delegation(delegation(&c, &b, START_BLOCK - 1)).await.is_err());
    let mut forged = delegation(&c, &b, 1000);
    forged.expires_at_block = 2000;
    assert!(b.engine.accept_delegation(forged).await.is_err());
    b.engine.accept_delegation(delegation(&c, &b, 1000)).await.unwrap();
}

#[tokio::test]
async fn test_delegated_pay_handed_over_on_reconnect() {
    let a = node(1);
    let b = node(2);
    let c = node(3);
    let ab = ChannelId([10; 32]);
    let bc = ChannelId([11; 32]);
    open(&a, &b, ab, true).await;
    open(&b, &c, bc, false).await;
    a.router.set_route(c.addr, TOKEN, ab, b.addr);
    b.engine.accept_delegation(delegation(&c, &b, 1000)).await.unwrap();
    let net = Net::new(&[&a, &b, &c]);

    let secret = duplex_crypto::random_secret();
    let pay_id = a
        .engine
        .send_conditional_pay(&c.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();
    net.pump().await;

    assert_eq!(
        a.callbacks.events(),
        vec![CallbackEvent::SendComplete(pay_id, SettleReason::PayPaidMax)]
    );
    assert_eq!(b.engine.channel_balance(&ab).await.unwrap().my_free, 110);
    assert_eq!(c.engine.channel_balance(&bc).await.unwrap().my_free, DEPOSIT);

    connect(&b, &c).await;
    net.pump().await;

    assert_eq!(b.engine.channel_balance(&bc).await.unwrap().my_free, 90);
    assert_eq!(c.engine.channel_balance(&bc).await.unwrap().my_free, 110);
    let handed_over = c
        .callbacks
        .events()
        .iter()
        .filter(|e| matches!(e, CallbackEvent::ReceivingDone(_, SettleReason::PayPaidMax)))
        .count();
    assert_eq!(handed_over, 1);

    // A second reconnect has nothing left to hand over.
    b.engine.remove_peer(&c.addr).unwrap();
    b.engine.add_peer(&c.addr).await.unwrap();
    net.pump().await;
    assert_eq!(c.engine.channel_balance(&bc).await.unwrap().my_free, 110);
}

#[tokio::test]
async fn test_relayed_receipt_keeps_destination() {
    let a = node(1);
    let b = node(2);
    let c = node(3);
    let ab = ChannelId([10; 32]);
    let bc = ChannelId([11; 32]);
    open(&a, &b, ab, true).await;
    open(&b, &c, bc, true).await;
    a.router.set_route(c.addr, TOKEN, ab, b.addr);
    let net = Net::new(&[&a, &b, &c]);

    let secret = duplex_crypto::random_secret();
    a.engine
        .send_conditional_pay(&c.addr, &TOKEN, 10, &secret, 20, None)
        .await
        .unwrap();

    let mut relayed = Vec::new();
    net.pump_filtered(|from, to, e| {
        if let Message::CondPayReceipt { .. } = e.message {
            relayed.push((*from, *to, e.to_addr));
        }
        true
    })
    .await;
    assert_eq!(
        relayed,
        vec![
            (c.addr, b.addr, Some(a.addr)),
            (b.addr, a.addr, Some(a.addr)),
        ]
    );
}
