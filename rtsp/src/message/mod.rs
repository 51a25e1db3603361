//! The RTSP wire codec: request/response messages and interleaved binary
//! frames sharing one connection (RFC 2326 §4, §10.12).

mod decoder;
mod header_map;
mod interleaved;
mod method;
mod request;
mod response;
mod status;

pub use decoder::{Item, MessageDecoder};
pub use header_map::HeaderMap;
pub use interleaved::{FRAME_HEADER_LEN, Frame};
pub use method::Method;
pub use request::Request;
pub use response::Response;
pub use status::StatusCode;

pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Default ceiling for an interleaved frame payload: one UDP-sized packet.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1472;

/// Ceiling for a message body (SDP, parameter blobs).
pub const MAX_BODY_LEN: usize = 256 * 1024;

/// Ceiling for the request line plus header block.
pub(crate) const MAX_HEAD_LEN: usize = 16 * 1024;
