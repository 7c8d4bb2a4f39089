//! Typed configuration for the sidechannel overlay and the price oracle.
//!
//! Heterogeneous "Map | Array | Object" construction shapes are normalized
//! away: callers build these structs directly (or via
//! `serde_json::from_value`), there is no polymorphic constructor.

use std::collections::{HashMap, HashSet};

/// Per-channel or default owner key, hex-lowercase.
pub type PubKeyHex = String;

#[derive(Debug, Clone)]
pub struct SidechannelConfig {
    /// Max serialized payload size accepted for broadcast/relay.
    pub max_message_bytes: usize,
    /// Pre-configured bootstrap channel; bypasses invite and welcome gates.
    pub entry_channel: String,
    /// Whether `open_channel` control messages from peers are honored.
    pub allow_remote_open: bool,
    /// Auto-join + open channels to all connections on remote `open_channel`.
    pub auto_join_on_open: bool,

    pub relay_enabled: bool,
    pub relay_ttl: u32,

    pub max_seen: usize,
    pub seen_ttl_ms: u64,

    pub rate_bytes_per_second: f64,
    pub rate_burst_bytes: f64,
    pub max_strikes: u32,
    pub strike_window_ms: u64,
    pub block_ms: u64,

    pub pow_enabled: bool,
    pub pow_difficulty: u32,
    /// If true, only the entry channel requires PoW.
    pub pow_require_entry: bool,
    /// If non-empty, exactly these channels require PoW (overrides
    /// `pow_require_entry`); if both are empty, all channels require PoW
    /// once `pow_enabled` and `pow_difficulty > 0`.
    pub pow_required_channels: HashSet<String>,
    /// Upper bound on the PoW nonce search.
    pub pow_max_attempts: u64,

    pub invite_required: bool,
    pub invite_required_channels: HashSet<String>,
    pub invite_required_prefixes: Vec<String>,
    pub inviter_keys: HashSet<PubKeyHex>,
    pub invite_ttl_ms: u64,

    pub owner_write_only: bool,
    pub owner_write_channels: HashSet<String>,
    pub owner_keys: HashMap<String, PubKeyHex>,
    pub default_owner_key: Option<PubKeyHex>,

    pub welcome_required: bool,
    pub welcome_by_channel: HashMap<String, bool>,
}

impl Default for SidechannelConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 1_000_000,
            entry_channel: "entry".to_string(),
            allow_remote_open: true,
            auto_join_on_open: false,

            relay_enabled: true,
            relay_ttl: 3,

            max_seen: 5_000,
            seen_ttl_ms: 120_000,

            rate_bytes_per_second: 64_000.0,
            rate_burst_bytes: 256_000.0,
            max_strikes: 3,
            strike_window_ms: 5_000,
            block_ms: 30_000,

            pow_enabled: false,
            pow_difficulty: 0,
            pow_require_entry: false,
            pow_required_channels: HashSet::new(),
            pow_max_attempts: 50_000_000,

            invite_required: false,
            invite_required_channels: HashSet::new(),
            invite_required_prefixes: Vec::new(),
            inviter_keys: HashSet::new(),
            invite_ttl_ms: 7 * 24 * 3600 * 1000,

            owner_write_only: false,
            owner_write_channels: HashSet::new(),
            owner_keys: HashMap::new(),
            default_owner_key: None,

            welcome_required: true,
            welcome_by_channel: HashMap::new(),
        }
    }
}

impl SidechannelConfig {
    pub fn channel_requires_invite(&self, channel: &str) -> bool {
        if channel == self.entry_channel {
            return false;
        }
        if !self.invite_required {
            return false;
        }
        if !self.invite_required_channels.is_empty() {
            return self.invite_required_channels.contains(channel);
        }
        if !self.invite_required_prefixes.is_empty() {
            return self
                .invite_required_prefixes
                .iter()
                .any(|p| channel.starts_with(p.as_str()));
        }
        true
    }

    pub fn channel_requires_welcome(&self, channel: &str) -> bool {
        if channel == self.entry_channel {
            return false;
        }
        if let Some(&explicit) = self.welcome_by_channel.get(channel) {
            return explicit;
        }
        self.welcome_required
    }

    pub fn channel_requires_pow(&self, channel: &str) -> bool {
        if !self.pow_enabled || self.pow_difficulty == 0 {
            return false;
        }
        if !self.pow_required_channels.is_empty() {
            return self.pow_required_channels.contains(channel);
        }
        if self.pow_require_entry {
            return channel == self.entry_channel;
        }
        true
    }

    pub fn channel_is_owner_write_only(&self, channel: &str) -> bool {
        if self.owner_write_only {
            return true;
        }
        self.owner_write_channels.contains(channel)
    }

    pub fn owner_for_channel(&self, channel: &str) -> Option<&str> {
        self.owner_keys
            .get(channel)
            .map(|s| s.as_str())
            .or(self.default_owner_key.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub pairs: Vec<String>,
    pub providers: Vec<String>,
    pub required_providers: usize,
    pub min_ok: usize,
    pub min_agree: usize,
    pub max_deviation_bps: f64,
    pub timeout_ms: u64,
    pub static_prices: HashMap<String, f64>,
    pub static_count: usize,
    /// Interval between automatic `tick()` rounds when run under
    /// `PriceOracle::run_ticker`.
    pub poll_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            providers: Vec::new(),
            required_providers: 1,
            min_ok: 1,
            min_agree: 1,
            max_deviation_bps: 50.0,
            timeout_ms: 5_000,
            static_prices: HashMap::new(),
            static_count: 0,
            poll_ms: 30_000,
        }
    }
}
