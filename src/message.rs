//! Wire payload and the `Control` tagged variant.
//!
//! Dispatch on a free-form `control` string field is decoded once into a
//! tagged variant; call sites dispatch over that instead of re-inspecting
//! the field every time.

use crate::invite::{Invite, Welcome};
use crate::pow::PowProof;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub channel: String,
    pub from: Option<String>,
    pub origin: Option<String>,
    pub message: Value,
    pub ts: i64,
    pub ttl: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite: Option<Invite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pow: Option<PowProof>,
    #[serde(rename = "relayedBy", skip_serializing_if = "Option::is_none")]
    pub relayed_by: Option<String>,
}

pub const PAYLOAD_TYPE: &str = "sidechannel";

impl Payload {
    /// Stable fallback id for payloads that omit one: `from:ts:channel`.
    pub fn synthetic_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.from.as_deref().unwrap_or(""),
            self.ts,
            self.channel
        )
    }

    pub fn effective_id(&self) -> String {
        if self.id.is_empty() {
            self.synthetic_id()
        } else {
            self.id.clone()
        }
    }

    /// An embedded invite can live at `payload.invite` or
    /// `payload.message.invite`.
    pub fn embedded_invite(&self) -> Option<Invite> {
        if let Some(inv) = &self.invite {
            return Some(inv.clone());
        }
        self.message
            .get("invite")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// An embedded welcome can live at `message.welcome | welcome |
    /// invite.welcome | message.invite.welcome`.
    pub fn embedded_welcome(&self) -> Option<Welcome> {
        if let Some(w) = self.message.get("welcome") {
            if let Ok(w) = serde_json::from_value::<Welcome>(w.clone()) {
                return Some(w);
            }
        }
        if let Some(w) = self.message.get("message").and_then(|m| m.get("welcome")) {
            if let Ok(w) = serde_json::from_value::<Welcome>(w.clone()) {
                return Some(w);
            }
        }
        if let Some(inv) = &self.invite {
            if let Some(w) = &inv.welcome {
                return Some(w.clone());
            }
        }
        if let Some(inv) = self.embedded_invite() {
            if let Some(w) = inv.welcome {
                return Some(w);
            }
        }
        None
    }

    /// Decode the control variant from `message.control`, if recognized.
    pub fn control(&self) -> Option<Control> {
        let control_name = self.message.get("control")?.as_str()?;
        match control_name {
            "open_channel" => {
                let channel = self
                    .message
                    .get("channel")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)?;
                let invite = self
                    .message
                    .get("invite")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                let welcome = self
                    .message
                    .get("welcome")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                Some(Control::OpenChannel { channel, invite, welcome })
            }
            "auth" => {
                let invite = self
                    .message
                    .get("invite")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())?;
                Some(Control::Auth { invite })
            }
            "welcome" => {
                let welcome = self
                    .message
                    .get("welcome")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())?;
                Some(Control::Welcome { welcome })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Control {
    OpenChannel {
        channel: String,
        invite: Option<Invite>,
        welcome: Option<Welcome>,
    },
    Auth {
        invite: Invite,
    },
    Welcome {
        welcome: Welcome,
    },
}

impl Control {
    pub fn is_auth(&self) -> bool {
        matches!(self, Control::Auth { .. })
    }

    pub fn is_welcome(&self) -> bool {
        matches!(self, Control::Welcome { .. })
    }
}
