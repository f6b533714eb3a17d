//! Common media-transport primitives shared by the publisher and listener.
//!
//! This crate provides the RTP/RTCP wire codec, sequence/timestamp cycle
//! tracking, the sorted packet store, session configuration and the
//! observability stack used by both SFU roles.

pub mod channel;
pub mod cli;
pub mod config;
pub mod cycle;
pub mod error;
pub mod keyframe;
pub mod observability;
pub mod ring;
pub mod rtcp;
pub mod rtp;
pub mod store;

pub use channel::{try_forward, try_forward_counted};
pub use cli::{ColorArg, ColorWhen, EndpointArgs};
pub use config::{Bitrate, Bitrates, Mode, RembAlgorithm, SessionConfig};
pub use cycle::{CycleRule, CycleTracker};
pub use error::{Error, Result};
pub use keyframe::VideoCodec;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use ring::Ring;
pub use rtcp::RtcpPacket;
pub use rtp::RtpPacket;
pub use store::{PushError, SortedStore, UnsortedBuffer};
