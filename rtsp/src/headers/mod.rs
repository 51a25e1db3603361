//! Typed RTSP header values with `FromStr`/`Display` round-trips.

pub mod range;
pub mod rtp_info;
pub mod session;
pub mod transport;

pub use range::{NptRange, NptTime};
pub use rtp_info::{RtpInfo, RtpInfoEntry};
pub use session::SessionHeader;
pub use transport::{Delivery, TransportHeader, TransportKind, TransportMode, TransportProtocol};
