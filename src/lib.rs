//! Authenticated, invite-gated pub/sub overlay for a swarm-connected trading
//! peer, plus the autopost scheduler and price oracle that share its
//! admission discipline.

pub mod autopost;
pub mod channel;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod invite;
pub mod message;
pub mod oracle;
pub mod pow;
pub mod rate_limit;
pub mod seen;
pub mod sidechannel;

pub use autopost::{AutopostManager, SchedulerStats, StartRequest, StopReason, Tool, ToolRunner};
pub use channel::{ChannelEntry, ChannelRegistry, Multiplexer, MultiplexChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OracleConfig, SidechannelConfig};
pub use error::{AutopostError, BroadcastError, ChannelError, CryptoError, PowError};
pub use invite::{Invite, InviteState, Verifier, Welcome};
pub use message::{Control, Payload};
pub use oracle::{OracleStats, PriceOracle, PriceProvider, Snapshot};
pub use sidechannel::{
    Connection, ConnectionStats, DropReason, MessageHandler, Outcome, SidechannelEngine, Swarm, Wallet,
};
