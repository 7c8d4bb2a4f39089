//! Channel registry and multiplex opener.
//!
//! Mirrors the host's connection-manager retry discipline: bounded attempts,
//! linear backoff, give up silently past the ceiling.

use crate::crypto::sha256_hex_bytes;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

pub const MULTIPLEX_OPEN_RETRIES: u32 = 5;
pub const MULTIPLEX_OPEN_BACKOFF_MS: u64 = 100;
pub const MULTIPLEXER_LOOKUP_RETRIES: u32 = 5;
pub const MULTIPLEXER_LOOKUP_DELAY_MS: u64 = 50;

/// A registered logical channel: name, derived topic, and protocol id.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub name: String,
    pub topic: [u8; 32],
    pub protocol: String,
}

impl ChannelEntry {
    pub fn new(name: &str) -> Self {
        let topic_hex = sha256_hex_bytes(format!("sidechannel:{name}").as_bytes());
        let mut topic = [0u8; 32];
        let decoded = hex::decode(&topic_hex).expect("sha256 hex is always 64 valid hex chars");
        topic.copy_from_slice(&decoded);
        Self {
            name: name.to_string(),
            topic,
            protocol: format!("sidechannel/{name}"),
        }
    }
}

/// A per-(connection, channel) handle: the multiplex transport channel, its
/// JSON message slot, an open-retry counter, and whether `auth` has been
/// sent on it yet.
pub struct ChannelRecord {
    pub channel: Arc<dyn MultiplexChannel>,
    pub message: Arc<dyn ChannelMessage>,
    pub open_retries: u32,
    pub auth_sent: bool,
}

/// Host multiplexer collaborator: pairs a protocol once per
/// connection, then creates named transport channels over it.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn pair(&self, protocol: &str);
    fn create_channel(&self, protocol: &str) -> Arc<dyn MultiplexChannel>;
}

#[async_trait]
pub trait MultiplexChannel: Send + Sync {
    fn open(&self);
    async fn fully_opened(&self) -> bool;
    fn close(&self);
    fn add_message(&self) -> Arc<dyn ChannelMessage>;
}

pub trait ChannelMessage: Send + Sync {
    fn send(&self, payload: &[u8]);
}

/// Registers logical channels and tracks which connections have which
/// channel already paired, guarding against concurrent double-open.
pub struct ChannelRegistry {
    entries: HashMap<String, ChannelEntry>,
    paired_protocols: std::collections::HashSet<String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), paired_protocols: std::collections::HashSet::new() }
    }

    /// `registerChannel(name)`: return the existing entry if present,
    /// otherwise register and return a new one. Invite-policy denial is the
    /// caller's responsibility (it needs local invite state this registry
    /// does not hold) — callers should deny before calling this.
    pub fn register(&mut self, name: &str) -> ChannelEntry {
        self.entries
            .entry(name.trim().to_string())
            .or_insert_with(|| ChannelEntry::new(name.trim()))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<&ChannelEntry> {
        self.entries.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &ChannelEntry> {
        self.entries.values()
    }

    /// Ensure the protocol is paired on this connection's multiplexer
    /// exactly once.
    pub async fn ensure_paired(&mut self, multiplexer: &dyn Multiplexer, protocol: &str) {
        if self.paired_protocols.insert(protocol.to_string()) {
            multiplexer.pair(protocol).await;
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a named channel for a connection, with bounded retry and linear
/// backoff. Returns `None` if the multiplexer never appears or the
/// channel never reports fully-opened within the retry budget.
pub async fn open_channel_for_connection(
    multiplexer_lookup: impl Fn() -> Option<Arc<dyn Multiplexer>>,
    protocol: &str,
) -> Option<Arc<dyn MultiplexChannel>> {
    let multiplexer = find_multiplexer(multiplexer_lookup).await?;
    multiplexer.pair(protocol).await;
    let channel = multiplexer.create_channel(protocol);
    channel.open();

    let mut retries = 0u32;
    loop {
        if channel.fully_opened().await {
            return Some(channel);
        }
        retries += 1;
        if retries >= MULTIPLEX_OPEN_RETRIES {
            warn!(protocol, retries, "multiplex channel never fully opened, giving up");
            return None;
        }
        let backoff = MULTIPLEX_OPEN_BACKOFF_MS * retries as u64;
        sleep(Duration::from_millis(backoff)).await;
    }
}

async fn find_multiplexer(
    lookup: impl Fn() -> Option<Arc<dyn Multiplexer>>,
) -> Option<Arc<dyn Multiplexer>> {
    for attempt in 0..MULTIPLEXER_LOOKUP_RETRIES {
        if let Some(m) = lookup() {
            return Some(m);
        }
        debug!(attempt, "multiplexer not yet available on connection, retrying");
        sleep(Duration::from_millis(MULTIPLEXER_LOOKUP_DELAY_MS)).await;
    }
    None
}
