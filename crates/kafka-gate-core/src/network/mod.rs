//! Listener, codec and relay plumbing.
//!
//! - [`port_pool`] — bounded port allocation for dynamic listeners
//! - [`directory`] — broker-id → listener mapping and listener lifecycle
//! - [`codec`] — length-prefixed Kafka frame codecs
//! - [`dialer`] — outbound broker dialing, dial overrides, forward proxies
//! - [`pipeline`] — per-connection authenticate/dial/relay state machine

pub mod codec;
pub mod dialer;
pub mod directory;
pub mod pipeline;
pub mod port_pool;

pub use codec::{BrokerResponseFrame, FrameEncoder, RequestCodec, RequestFrame, ResponseCodec};
pub use dialer::{BrokerDialer, SocketTuning};
pub use directory::{
    AdvertisedAddress, BrokerEndpoint, ConnectionService, ListenerDirectory, ListenerMapping,
};
pub use pipeline::{AuthStack, ConnectionPipeline};
pub use port_pool::{PortLease, PortPool};
