//! End-to-end sidechannel relay and broadcast behavior: ttl decrements by
//! exactly one per relay; duplicates within the seen-set TTL are dropped.

use async_trait::async_trait;
use serde_json::json;
use sidechannel::clock::ManualClock;
use sidechannel::{
    Connection, DropReason, MessageHandler, Outcome, Payload, SidechannelConfig, SidechannelEngine,
    Swarm, Verifier, Wallet,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct StubWallet(&'static str);
impl Wallet for StubWallet {
    fn public_key_hex(&self) -> String {
        self.0.to_string()
    }
    fn sign(&self, _bytes: &[u8]) -> Vec<u8> {
        vec![]
    }
}

struct AlwaysOkVerifier;
impl Verifier for AlwaysOkVerifier {
    fn verify(&self, _sig: &[u8], _msg: &[u8], _pubkey_hex: &str) -> bool {
        true
    }
}

struct NoopSwarm;
#[async_trait]
impl Swarm for NoopSwarm {
    async fn join(&self, _topic: [u8; 32]) {}
    async fn flush(&self) {}
    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        vec![]
    }
}

struct CountingHandler(AtomicUsize);
impl MessageHandler for CountingHandler {
    fn on_message(&self, _channel: &str, _payload: &Payload, _from: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn data_payload(channel: &str, from: &str, id: &str, ttl: i32) -> Payload {
    Payload {
        kind: "sidechannel".to_string(),
        id: id.to_string(),
        channel: channel.to_string(),
        from: Some(from.to_string()),
        origin: Some(from.to_string()),
        message: json!({"hello": "world"}),
        ts: 0,
        ttl,
        invite: None,
        pow: None,
        relayed_by: None,
    }
}

fn new_engine(config: SidechannelConfig) -> (SidechannelEngine, Arc<CountingHandler>) {
    let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
    let engine = SidechannelEngine::new(
        config,
        Arc::new(ManualClock::new(0)),
        Arc::new(StubWallet("owner")),
        Arc::new(AlwaysOkVerifier),
        Arc::new(NoopSwarm),
        handler.clone(),
    );
    (engine, handler)
}

#[tokio::test]
async fn relay_with_zero_ttl_is_a_no_op() {
    let mut cfg = SidechannelConfig::default();
    cfg.welcome_required = false;
    let (engine, _handler) = new_engine(cfg);

    let payload = data_payload("entry", "peer1", "m1", 0);
    // Should not panic and should simply skip relaying; no assertions
    // possible on the no-op swarm beyond it not erroring.
    engine.relay(&payload, "peer1").await;
}

#[tokio::test]
async fn admitted_payload_is_delivered_once() {
    let mut cfg = SidechannelConfig::default();
    cfg.welcome_required = false;
    let (engine, handler) = new_engine(cfg);

    let payload = data_payload("entry", "peer1", "m1", 3);
    let outcome = engine.handle_inbound("peer1", payload.clone()).await;
    assert_eq!(outcome, Outcome::DeliveredData);
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);

    let repeat = engine.handle_inbound("peer1", payload).await;
    assert_eq!(repeat, Outcome::Dropped(DropReason::Duplicate));
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broadcast_rejects_oversized_payload() {
    let mut cfg = SidechannelConfig::default();
    cfg.welcome_required = false;
    cfg.max_message_bytes = 10;
    let (engine, _handler) = new_engine(cfg);

    let result = engine.broadcast("entry", json!({"payload": "way too large for the limit"}), None).await;
    assert!(result.is_err());
}
