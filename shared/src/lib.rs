//! Types shared by every node on the message bus: channel addressing, the
//! datagram codec, message type numbers, the dclass schema and the transport
//! bridge.

pub mod bridge;
pub mod channel;
pub mod datagram;
pub mod dclass;
pub mod msgtypes;

pub use bridge::{Bridge, BridgeError, Inbound, Outbox, POLL_WAIT};
pub use channel::{AllocError, Channel, ClientChannelRange, DoId, IdAllocator, SenderIdentity};
pub use datagram::{hex, Datagram, DatagramError, DatagramHeader, DatagramIterator};
pub use dclass::{ClassDef, FieldDef, FieldFlags, ParamType, Schema, SchemaError, Value};

// Well-known channels
pub const CONTROL_CHANNEL: Channel = 4001;
pub const STATESERVERS_CHANNEL: Channel = 4002;
pub const DBSERVERS_CHANNEL: Channel = 4003;

/// Channels and object ids issued by an AI node, `[min, max)`.
pub const AI_CHANNEL_MIN: Channel = 4_000_000;
pub const AI_CHANNEL_MAX: Channel = 5_000_000;

/// Object ids issued by the database server, `[min, max)`.
pub const DB_ID_MIN: DoId = 100_000_000;
pub const DB_ID_MAX: DoId = 200_000_000;

/// Channels of connected clients, inclusive on both ends.
pub const CLIENT_CHANNEL_MIN: Channel = 1 << 32;
pub const CLIENT_CHANNEL_MAX: Channel = (1 << 48) - 1;

/// Zones handed out at runtime, `[min, max)`.
pub const DYNAMIC_ZONE_MIN: u64 = 61_000;
pub const DYNAMIC_ZONE_MAX: u64 = 1 << 20;

/// Root object every district is parented to.
pub const OTP_DO_ID_TOONTOWN: DoId = 4618;
pub const OTP_ZONE_ID_MANAGEMENT: u32 = 2;
pub const OTP_ZONE_ID_DISTRICTS: u32 = 3;

pub const DEFAULT_MD_HOST: &str = "127.0.0.1";
pub const DEFAULT_MD_PORT: u16 = 7100;
