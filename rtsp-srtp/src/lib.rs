#![warn(rust_2018_idioms)]

pub mod context;
pub mod kdf;
pub mod mikey;

pub use context::Context;
pub use mikey::MikeyMessage;

/// SRTP master key length for AES-CM-128 (RFC 3711 §8.2).
pub const MASTER_KEY_LEN: usize = 16;
/// SRTP master salt length (RFC 3711 §8.2).
pub const MASTER_SALT_LEN: usize = 14;
/// HMAC-SHA1-80 authentication tag length.
pub const AUTH_TAG_LEN: usize = 10;
/// Replay window size shared by SRTP and SRTCP (RFC 3711 §3.3.2).
pub const REPLAY_WINDOW: u64 = 64;
