//! Invite and Welcome credential types, normalization, and verification.
//!
//! Signing input is the UTF-8 bytes of the canonical serialization of the
//! normalized payload. Verification of the cryptographic signature
//! itself is delegated to the `Verifier` collaborator trait; this module
//! owns field normalization, expiry, and per-channel authorization state.

use crate::config::SidechannelConfig;
use crate::crypto::{canonicalize, normalize_hex_key};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

pub const INVITE_VERSION: u32 = 1;
pub const WELCOME_VERSION: u32 = 1;

/// Verifies a detached signature over a message with a given public key.
/// Backed by the host wallet's static `verify` collaborator.
pub trait Verifier: Send + Sync {
    fn verify(&self, sig: &[u8], msg: &[u8], pubkey_hex: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub channel: String,
    pub invitee_pub_key: String,
    pub inviter_pub_key: String,
    pub inviter_address: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    pub nonce: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub welcome: Option<Welcome>,
    /// Detached signature, hex-encoded. Excluded from the signing payload by
    /// the explicit field list in `signing_payload()`, not by serde.
    #[serde(rename = "signature", skip_serializing_if = "Option::is_none")]
    pub signature_hex: Option<String>,
}

impl Invite {
    /// Normalize: keys trimmed/lowercased, integers coerced.
    pub fn normalize(mut self) -> Result<Self, String> {
        self.channel = self.channel.trim().to_string();
        if self.channel.is_empty() {
            return Err("invite.channel must be non-empty".to_string());
        }
        self.invitee_pub_key = normalize_hex_key(&self.invitee_pub_key)
            .map_err(|e| e.to_string())?;
        self.inviter_pub_key = normalize_hex_key(&self.inviter_pub_key)
            .map_err(|e| e.to_string())?;
        self.version = INVITE_VERSION;
        Ok(self)
    }

    /// Canonical signing payload: the normalized fields only,
    /// excluding the signature and any embedded welcome.
    pub fn signing_payload(&self) -> serde_json::Value {
        json!({
            "channel": self.channel,
            "inviteePubKey": self.invitee_pub_key,
            "inviterPubKey": self.inviter_pub_key,
            "inviterAddress": self.inviter_address,
            "issuedAt": self.issued_at,
            "expiresAt": self.expires_at,
            "nonce": self.nonce,
            "version": self.version,
        })
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        canonicalize(&self.signing_payload()).into_bytes()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub channel: String,
    pub owner_pub_key: String,
    pub text: String,
    pub issued_at: i64,
    pub version: u32,
    /// Detached signature, hex-encoded. Excluded from the signing payload by
    /// the explicit field list in `signing_payload()`, not by serde.
    #[serde(rename = "signature", skip_serializing_if = "Option::is_none")]
    pub signature_hex: Option<String>,
}

impl Welcome {
    pub fn normalize(mut self) -> Result<Self, String> {
        self.channel = self.channel.trim().to_string();
        if self.channel.is_empty() {
            return Err("welcome.channel must be non-empty".to_string());
        }
        self.owner_pub_key = normalize_hex_key(&self.owner_pub_key)
            .map_err(|e| e.to_string())?;
        self.version = WELCOME_VERSION;
        Ok(self)
    }

    pub fn signing_payload(&self) -> serde_json::Value {
        json!({
            "channel": self.channel,
            "ownerPubKey": self.owner_pub_key,
            "text": self.text,
            "issuedAt": self.issued_at,
            "version": self.version,
        })
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        canonicalize(&self.signing_payload()).into_bytes()
    }
}

/// Per-channel authorization state: invitee map, local-invite map, and
/// welcomed-channels set.
#[derive(Default)]
pub struct InviteState {
    /// (channel, remote pubkey hex) -> expiresAt, populated on successful
    /// remote-invite verification.
    invitees: HashMap<(String, String), i64>,
    /// channel -> (expiresAt, full accepted invite), populated on local
    /// acceptance for later `auth` handshakes.
    local_invites: HashMap<String, (i64, Invite)>,
    welcomed_channels: std::collections::HashSet<String>,
}

impl InviteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invitee(&mut self, channel: &str, remote_key: &str, expires_at: i64) {
        self.invitees
            .insert((channel.to_string(), remote_key.to_string()), expires_at);
    }

    pub fn is_invitee(&self, channel: &str, remote_key: &str, now_ms: i64) -> bool {
        self.invitees
            .get(&(channel.to_string(), remote_key.to_string()))
            .map(|&exp| now_ms < exp)
            .unwrap_or(false)
    }

    pub fn accept_local_invite(&mut self, invite: Invite) {
        self.local_invites
            .insert(invite.channel.clone(), (invite.expires_at, invite));
    }

    pub fn local_invite_for(&self, channel: &str, now_ms: i64) -> Option<&Invite> {
        self.local_invites.get(channel).and_then(|(exp, inv)| {
            if now_ms < *exp {
                Some(inv)
            } else {
                None
            }
        })
    }

    pub fn mark_welcomed(&mut self, channel: &str) {
        self.welcomed_channels.insert(channel.to_string());
    }

    pub fn is_welcomed(&self, channel: &str) -> bool {
        self.welcomed_channels.contains(channel)
    }
}

/// Errors are folded to `None` by callers per the admission-drop policy
/// Verification here never raises, it only confirms or denies.
pub struct InviteVerifier<'a> {
    pub config: &'a SidechannelConfig,
    pub verifier: &'a dyn Verifier,
}

impl<'a> InviteVerifier<'a> {
    /// Verify an invite for `channel`, claimed to have been issued by
    /// `inviter_pub_key`. Returns the normalized invite on success.
    pub fn verify_invite(&self, invite: &Invite, channel: &str, now_ms: i64) -> Option<Invite> {
        let normalized = invite.clone().normalize().ok()?;
        if normalized.channel != channel {
            return None;
        }
        if !self.config.inviter_keys.is_empty()
            && !self.config.inviter_keys.contains(&normalized.inviter_pub_key)
        {
            return None;
        }
        if normalized.is_expired(now_ms) {
            return None;
        }
        let sig = normalized.signature_hex.as_ref()?;
        let sig_bytes = hex::decode(sig).ok()?;
        let msg = normalized.signing_bytes();
        if !self
            .verifier
            .verify(&sig_bytes, &msg, &normalized.inviter_pub_key)
        {
            return None;
        }
        Some(normalized)
    }

    /// Verify a welcome for `channel`. Owner is resolved by per-channel
    /// override, else default owner.
    pub fn verify_welcome(&self, welcome: &Welcome, channel: &str) -> Option<Welcome> {
        let normalized = welcome.clone().normalize().ok()?;
        if normalized.channel != channel {
            return None;
        }
        let expected_owner = self.config.owner_for_channel(channel)?;
        if normalized.owner_pub_key != expected_owner {
            return None;
        }
        let sig = normalized.signature_hex.as_ref()?;
        let sig_bytes = hex::decode(sig).ok()?;
        let msg = normalized.signing_bytes();
        if !self
            .verifier
            .verify(&sig_bytes, &msg, &normalized.owner_pub_key)
        {
            return None;
        }
        Some(normalized)
    }
}
