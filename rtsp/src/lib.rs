#![warn(rust_2018_idioms)]
//! An RTSP 1.0 (RFC 2326) client and server carrying RTP/RTCP media over
//! UDP unicast, UDP multicast, or interleaved on the control connection,
//! with optional TLS on the control channel and optional SRTP keyed by
//! MIKEY-in-SDP.

pub mod auth;
pub mod client;
mod conn;
pub mod headers;
pub mod message;
pub mod report;
pub mod server;
mod udp;

pub use shared::error::{Error, Result};

pub use {rtcp, rtp, sdp, srtp};

pub use auth::Authenticator;
pub use client::{Client, ClientOptions, Credentials};
pub use headers::transport::{TransportHeader, TransportKind, TransportMode};
pub use message::{Frame, HeaderMap, Method, Request, Response, StatusCode};
pub use server::{DescribeAnswer, Server, ServerBuilder, ServerStream, SetupAnswer};
