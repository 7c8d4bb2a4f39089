//! The Sidechannel message loop: the core event-driven reactor.
//!
//! Mutation of all sidechannel state is confined to methods on
//! `SidechannelEngine`, driven from a single task under the engine's
//! cooperative concurrency model — callers must not share one engine across
//! OS threads without external serialization (a single-consumer command
//! channel, as autopost does for its per-job queue).

use crate::channel::{ChannelEntry, ChannelMessage, ChannelRecord, ChannelRegistry, Multiplexer};
use crate::config::SidechannelConfig;
use crate::error::BroadcastError;
use crate::invite::{Invite, InviteState, InviteVerifier, Verifier, Welcome};
use crate::message::{Control, Payload, PAYLOAD_TYPE};
use crate::pow;
use crate::rate_limit::RateLimiter;
use crate::seen::SeenSet;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Signing/verifying key wallet: `peer.wallet`.
pub trait Wallet: Send + Sync {
    fn public_key_hex(&self) -> String;
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;
}

/// A connected peer's transport handle: `conn`.
#[async_trait]
pub trait Connection: Send + Sync {
    fn remote_public_key_hex(&self) -> String;
    fn multiplexer(&self) -> Option<Arc<dyn Multiplexer>>;
}

/// `peer.swarm`: surfaces connections and topic membership.
#[async_trait]
pub trait Swarm: Send + Sync {
    async fn join(&self, topic: [u8; 32]);
    async fn flush(&self);
    fn connections(&self) -> Vec<Arc<dyn Connection>>;
}

/// Host callback invoked for admitted, non-control application payloads.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, channel: &str, payload: &Payload, from_connection: &str);
}

#[derive(Debug, PartialEq, Eq)]
pub enum DropReason {
    Blocked,
    Unserializable,
    InviteRequired,
    PowRequired,
    RateLimited,
    OwnerWriteOnly,
    Duplicate,
    WelcomeRequired,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Dropped(DropReason),
    DeliveredData,
    HandledControl,
}

struct ConnectionState {
    rate: crate::rate_limit::ConnectionRateLimit,
    channels: HashMap<String, ChannelRecord>,
}

struct EngineState {
    registry: ChannelRegistry,
    seen: SeenSet,
    invites: InviteState,
    connections: HashMap<String, ConnectionState>,
}

pub struct SidechannelEngine {
    config: SidechannelConfig,
    clock: Arc<dyn crate::clock::Clock>,
    wallet: Arc<dyn Wallet>,
    verifier: Arc<dyn Verifier>,
    swarm: Arc<dyn Swarm>,
    handler: Arc<dyn MessageHandler>,
    rate_limiter: RateLimiter,
    state: Mutex<EngineState>,
}

impl SidechannelEngine {
    pub fn new(
        config: SidechannelConfig,
        clock: Arc<dyn crate::clock::Clock>,
        wallet: Arc<dyn Wallet>,
        verifier: Arc<dyn Verifier>,
        swarm: Arc<dyn Swarm>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            clock.clone(),
            config.rate_burst_bytes,
            config.rate_bytes_per_second,
            config.max_strikes,
            config.strike_window_ms,
            config.block_ms,
        );
        let state = Mutex::new(EngineState {
            registry: ChannelRegistry::new(),
            seen: SeenSet::new(config.max_seen, config.seen_ttl_ms),
            invites: InviteState::new(),
            connections: HashMap::new(),
        });
        Self { config, clock, wallet, verifier, swarm, handler, rate_limiter, state }
    }

    fn invite_verifier<'a>(&'a self) -> InviteVerifier<'a> {
        InviteVerifier { config: &self.config, verifier: self.verifier.as_ref() }
    }

    fn local_pubkey(&self) -> String {
        self.wallet.public_key_hex()
    }

    /// `registerChannel(name)`: deny if invite is required and the
    /// local peer is neither an inviter nor locally invited.
    pub async fn register_channel(&self, name: &str) -> Option<ChannelEntry> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if self.config.channel_requires_invite(name) {
            let mut state = self.state.lock().await;
            let is_inviter = self.config.inviter_keys.contains(&self.local_pubkey());
            let is_invited = state
                .invites
                .local_invite_for(name, self.clock.now_ms() as i64)
                .is_some();
            if !is_inviter && !is_invited {
                debug!(channel = name, "channel registration denied: invite required");
                return None;
            }
            return Some(state.registry.register(name));
        }
        let mut state = self.state.lock().await;
        Some(state.registry.register(name))
    }

    /// `addChannel(name)`: register, join the topic, flush, then open
    /// the protocol channel on every existing connection.
    pub async fn add_channel(&self, name: &str) -> Option<ChannelEntry> {
        let entry = self.register_channel(name).await?;
        self.swarm.join(entry.topic).await;
        self.swarm.flush().await;
        Some(entry)
    }

    /// The full admission pipeline for one inbound payload.
    pub async fn handle_inbound(&self, remote_key: &str, payload: Payload) -> Outcome {
        let now_ms = self.clock.now_ms();
        let now_i64 = now_ms as i64;
        let channel = payload.channel.clone();

        {
            let mut state = self.state.lock().await;
            let conn = state
                .connections
                .entry(remote_key.to_string())
                .or_insert_with(|| ConnectionState {
                    rate: self.rate_limiter.new_connection_state(),
                    channels: HashMap::new(),
                });
            if conn.rate.is_blocked(now_ms) {
                return Outcome::Dropped(DropReason::Blocked);
            }
        }

        let serialized = match serde_json::to_string(&payload) {
            Ok(s) => s,
            Err(_) => return Outcome::Dropped(DropReason::Unserializable),
        };
        let payload_bytes = serialized.len() as f64;

        if self.config.channel_requires_invite(&channel) {
            let verified = self.verify_inbound_invite(&payload, &channel, now_i64).await;
            if !verified {
                let mut state = self.state.lock().await;
                let is_inviter = self.config.inviter_keys.contains(remote_key);
                let is_invitee = state.invites.is_invitee(&channel, remote_key, now_i64);
                if !is_inviter && !is_invitee {
                    return Outcome::Dropped(DropReason::InviteRequired);
                }
            }
        }

        if pow::is_required(&self.config, &channel) {
            let ok = pow::check(
                &payload.id,
                &channel,
                payload.from.as_deref(),
                payload.origin.as_deref(),
                &payload.message,
                payload.ts,
                payload.pow.as_ref(),
                self.config.pow_difficulty,
            );
            if !ok {
                return Outcome::Dropped(DropReason::PowRequired);
            }
        }

        {
            let mut state = self.state.lock().await;
            let conn = state.connections.get_mut(remote_key).expect("inserted above");
            if !conn.rate.admit(payload_bytes, now_ms) {
                return Outcome::Dropped(DropReason::RateLimited);
            }
        }

        let control = payload.control();
        let is_auth = control.as_ref().map(|c| c.is_auth()).unwrap_or(false);

        if self.config.channel_is_owner_write_only(&channel) && !is_auth {
            let owner = self.config.owner_for_channel(&channel);
            if payload.from.as_deref() != owner {
                return Outcome::Dropped(DropReason::OwnerWriteOnly);
            }
        }

        let payload_id = payload.effective_id();
        {
            let mut state = self.state.lock().await;
            if state.seen.check_and_insert(&payload_id, now_ms) {
                return Outcome::Dropped(DropReason::Duplicate);
            }
        }

        if self.config.channel_requires_welcome(&channel) {
            let already_welcomed = {
                let state = self.state.lock().await;
                state.invites.is_welcomed(&channel)
            };
            if !already_welcomed {
                match payload.embedded_welcome() {
                    Some(w) => {
                        let verified = self.invite_verifier().verify_welcome(&w, &channel);
                        match verified {
                            Some(_) => {
                                let mut state = self.state.lock().await;
                                state.invites.mark_welcomed(&channel);
                            }
                            None => return Outcome::Dropped(DropReason::WelcomeRequired),
                        }
                    }
                    None => return Outcome::Dropped(DropReason::WelcomeRequired),
                }
            }
        }

        if let Some(ctrl) = control {
            self.dispatch_control(&ctrl, &channel, remote_key, now_i64).await;
            return Outcome::HandledControl;
        }

        self.handler.on_message(&channel, &payload, remote_key);
        self.relay(&payload, remote_key).await;
        Outcome::DeliveredData
    }

    async fn verify_inbound_invite(&self, payload: &Payload, channel: &str, now_ms: i64) -> bool {
        let Some(invite) = payload.embedded_invite() else { return false };
        let Some(verified) = self.invite_verifier().verify_invite(&invite, channel, now_ms) else {
            return false;
        };
        let mut state = self.state.lock().await;
        state
            .invites
            .record_invitee(channel, &verified.invitee_pub_key, verified.expires_at);
        true
    }

    async fn dispatch_control(&self, control: &Control, channel: &str, remote_key: &str, now_ms: i64) {
        match control {
            Control::OpenChannel { channel: target, invite, welcome } => {
                if !self.config.allow_remote_open {
                    return;
                }
                if self.config.channel_requires_welcome(target) {
                    let Some(w) = welcome else { return };
                    if self.invite_verifier().verify_welcome(w, target).is_none() {
                        return;
                    }
                }
                if self.config.channel_requires_invite(target) {
                    let Some(inv) = invite else { return };
                    if self.invite_verifier().verify_invite(inv, target, now_ms).is_none() {
                        return;
                    }
                }
                if self.config.auto_join_on_open {
                    self.add_channel(target).await;
                } else {
                    debug!(channel = target.as_str(), "remote requested open_channel, logging only");
                }
            }
            Control::Auth { .. } => {
                // Already verified in the invite-check step; nothing further to do.
            }
            Control::Welcome { .. } => {
                let mut state = self.state.lock().await;
                state.invites.mark_welcomed(channel);
                let _ = remote_key;
            }
        }
    }

    /// Relay: decrement TTL, mark `relayedBy`, forward to every
    /// connection other than the origin that is authorized for the channel.
    pub async fn relay(&self, payload: &Payload, origin_key: &str) {
        if !self.config.relay_enabled {
            return;
        }
        if let Some(ctrl) = payload.control() {
            if ctrl.is_auth() || ctrl.is_welcome() {
                return;
            }
        }
        if payload.ttl <= 0 {
            return;
        }

        let mut relayed = payload.clone();
        relayed.ttl -= 1;
        relayed.relayed_by = Some(self.local_pubkey());

        let connections = self.swarm.connections();
        let now_i64 = self.clock.now_ms() as i64;
        for conn in connections {
            let key = conn.remote_public_key_hex();
            if key == origin_key {
                continue;
            }
            if self.config.channel_requires_invite(&payload.channel) {
                let state = self.state.lock().await;
                let is_inviter = self.config.inviter_keys.contains(&key);
                let is_invitee = state.invites.is_invitee(&payload.channel, &key, now_i64);
                if !is_inviter && !is_invitee {
                    continue;
                }
            }
            self.send_to_connection(&key, &relayed).await;
        }
    }

    async fn send_to_connection(&self, remote_key: &str, payload: &Payload) {
        let state = self.state.lock().await;
        let Some(conn) = state.connections.get(remote_key) else { return };
        let Some(record) = conn.channels.get(&payload.channel) else { return };
        if let Ok(bytes) = serde_json::to_vec(payload) {
            record.message.send(&bytes);
        }
    }

    /// `broadcast(name, message, {invite?})`.
    pub async fn broadcast(
        &self,
        channel: &str,
        message: Value,
        invite: Option<Invite>,
    ) -> Result<String, BroadcastError> {
        let is_auth = message
            .get("control")
            .and_then(|c| c.as_str())
            .map(|c| c == "auth")
            .unwrap_or(false);

        if self.config.channel_is_owner_write_only(channel) && !is_auth {
            return Err(BroadcastError::ChannelDenied(channel.to_string()));
        }

        if let Some(inv) = invite {
            let mut state = self.state.lock().await;
            state.invites.accept_local_invite(inv);
        }

        self.register_channel(channel).await;

        let id = new_message_id();
        let now = self.clock.now_ms() as i64;
        let from = self.local_pubkey();
        let mut payload = Payload {
            kind: PAYLOAD_TYPE.to_string(),
            id: id.clone(),
            channel: channel.to_string(),
            from: Some(from.clone()),
            origin: Some(from.clone()),
            message,
            ts: now,
            ttl: self.config.relay_ttl as i32,
            invite: None,
            pow: None,
            relayed_by: None,
        };

        if pow::is_required(&self.config, channel) {
            let proof = pow::attach(
                &payload.id,
                &payload.channel,
                payload.from.as_deref(),
                payload.origin.as_deref(),
                &payload.message,
                payload.ts,
                self.config.pow_difficulty,
                self.config.pow_max_attempts,
            )?;
            payload.pow = Some(proof);
        }

        let encoded = serde_json::to_vec(&payload)
            .map_err(|e| BroadcastError::Encoding(e.to_string()))?;
        if encoded.len() > self.config.max_message_bytes {
            return Err(BroadcastError::TooLarge {
                actual: encoded.len(),
                max: self.config.max_message_bytes,
            });
        }

        {
            let mut state = self.state.lock().await;
            state.seen.check_and_insert(&id, now as u64);
        }

        let connections: Vec<String> = {
            let state = self.state.lock().await;
            state.connections.keys().cloned().collect()
        };
        for remote_key in connections {
            self.send_to_connection(&remote_key, &payload).await;
        }

        Ok(id)
    }

    /// `requestOpen(target, via?, invite?, welcome?)`.
    pub async fn request_open(
        &self,
        target: &str,
        via: Option<&str>,
        invite: Option<Invite>,
        welcome: Option<Welcome>,
    ) -> Result<String, BroadcastError> {
        if let Some(w) = &welcome {
            if self.invite_verifier().verify_welcome(w, target).is_none() {
                return Err(BroadcastError::ChannelDenied(target.to_string()));
            }
        }
        let via_channel = via.unwrap_or(&self.config.entry_channel).to_string();
        let message = serde_json::json!({
            "control": "open_channel",
            "channel": target,
            "invite": invite,
            "welcome": welcome,
        });
        self.broadcast(&via_channel, message, None).await
    }

    pub async fn on_connection_closed(&self, remote_key: &str) {
        let mut state = self.state.lock().await;
        state.connections.remove(remote_key);
    }

    /// Read-only per-connection counters for host observability; not part
    /// of the wire protocol.
    pub async fn connection_stats(&self) -> Vec<ConnectionStats> {
        let state = self.state.lock().await;
        let now_ms = self.clock.now_ms();
        state
            .connections
            .iter()
            .map(|(remote_key, conn)| ConnectionStats {
                remote_key: remote_key.clone(),
                blocked: conn.rate.is_blocked(now_ms),
                channels_open: conn.channels.len(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub remote_key: String,
    pub blocked: bool,
    pub channels_open: usize,
}

fn new_message_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullWallet;
    impl Wallet for NullWallet {
        fn public_key_hex(&self) -> String {
            "owner".to_string()
        }
        fn sign(&self, _bytes: &[u8]) -> Vec<u8> {
            vec![]
        }
    }

    struct AlwaysOk;
    impl Verifier for AlwaysOk {
        fn verify(&self, _sig: &[u8], _msg: &[u8], _pubkey_hex: &str) -> bool {
            true
        }
    }

    struct NullSwarm;
    #[async_trait]
    impl Swarm for NullSwarm {
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

    fn engine(config: SidechannelConfig) -> (SidechannelEngine, Arc<CountingHandler>) {
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let engine = SidechannelEngine::new(
            config,
            Arc::new(ManualClock::new(0)),
            Arc::new(NullWallet),
            Arc::new(AlwaysOk),
            Arc::new(NullSwarm),
            handler.clone(),
        );
        (engine, handler)
    }

    fn data_payload(channel: &str, from: &str) -> Payload {
        Payload {
            kind: PAYLOAD_TYPE.to_string(),
            id: format!("id-{channel}-{from}"),
            channel: channel.to_string(),
            from: Some(from.to_string()),
            origin: Some(from.to_string()),
            message: json!({"hello": "world"}),
            ts: 0,
            ttl: 3,
            invite: None,
            pow: None,
            relayed_by: None,
        }
    }

    #[tokio::test]
    async fn plain_data_on_open_channel_is_delivered() {
        let mut cfg = SidechannelConfig::default();
        cfg.welcome_required = false;
        let (engine, handler) = engine(cfg);
        let outcome = engine.handle_inbound("peer1", data_payload("entry", "peer1")).await;
        assert_eq!(outcome, Outcome::DeliveredData);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_dropped() {
        let mut cfg = SidechannelConfig::default();
        cfg.welcome_required = false;
        let (engine, _handler) = engine(cfg);
        let p = data_payload("entry", "peer1");
        assert_eq!(engine.handle_inbound("peer1", p.clone()).await, Outcome::DeliveredData);
        assert_eq!(engine.handle_inbound("peer1", p).await, Outcome::Dropped(DropReason::Duplicate));
    }

    #[tokio::test]
    async fn owner_write_only_channel_rejects_non_owner() {
        let mut cfg = SidechannelConfig::default();
        cfg.welcome_required = false;
        cfg.owner_write_only = true;
        cfg.default_owner_key = Some("owner".to_string());
        let (engine, _handler) = engine(cfg);
        let outcome = engine.handle_inbound("peer1", data_payload("entry", "not-owner")).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::OwnerWriteOnly));
    }

    #[tokio::test]
    async fn owner_write_only_channel_accepts_owner() {
        let mut cfg = SidechannelConfig::default();
        cfg.welcome_required = false;
        cfg.owner_write_only = true;
        cfg.default_owner_key = Some("owner".to_string());
        let (engine, _handler) = engine(cfg);
        let outcome = engine.handle_inbound("peer1", data_payload("entry", "owner")).await;
        assert_eq!(outcome, Outcome::DeliveredData);
    }

    #[tokio::test]
    async fn welcome_required_channel_without_welcome_is_dropped() {
        let cfg = SidechannelConfig::default();
        let (engine, _handler) = engine(cfg);
        let outcome = engine.handle_inbound("peer1", data_payload("non-entry", "peer1")).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::WelcomeRequired));
    }
}
