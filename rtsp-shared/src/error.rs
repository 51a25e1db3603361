use std::io;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //RTSP wire codec errors
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("malformed header {0}: {1}")]
    MalformedHeader(String, String),
    #[error("interleaved frame of {0} bytes exceeds ceiling of {1}")]
    FrameTooLarge(usize, usize),
    #[error("message body of {0} bytes exceeds ceiling of {1}")]
    BodyTooLarge(usize, usize),
    #[error("CSeq header is missing")]
    MissingCseq,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    //SDP errors
    #[error("invalid SDP: {0}")]
    InvalidSdp(String),
    #[error("media {0} has an empty control token")]
    MissingControl(usize),
    #[error("two medias share the control token {0}")]
    DuplicateControl(String),
    #[error("SAVP media announced without a key-mgmt attribute")]
    MissingKeyMgmt,
    #[error("payload type {0} declared twice in one media")]
    DuplicatePayloadType(u8),

    //authentication errors
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("no supported authentication scheme in {0}")]
    UnsupportedAuthScheme(String),

    //protocol state errors
    #[error("method {0} not valid in state {1}")]
    MethodNotValidInThisState(String, String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("unsupported transport")]
    UnsupportedTransport,
    #[error("server returned {0} ({1})")]
    BadStatus(u16, String),
    #[error("too many redirects")]
    TooManyRedirects,

    //RTP/RTCP codec errors
    #[error("packet too short to be read")]
    PacketTooShort,
    #[error("buffer too short to be written")]
    BufferTooShort,
    #[error("invalid packet version")]
    BadVersion,
    #[error("wrong packet type")]
    WrongType,
    #[error("too many reports")]
    TooManyReports,
    #[error("invalid total lost count")]
    InvalidTotalLost,

    //media decode errors, recoverable per packet
    #[error("RTP/RTCP packet of {0} bytes exceeds the read buffer")]
    PacketOversize(usize),
    #[error("unknown payload type {0}")]
    UnknownPayloadType(u8),
    #[error("wrong SSRC: got {got:#010x}, expected {expected:#010x}")]
    WrongSsrc { got: u32, expected: u32 },

    //SRTP errors
    #[error("srtp: authentication tag mismatch")]
    SrtpAuthFailed,
    #[error("srtp: replayed or stale packet index")]
    SrtpReplay,
    #[error("srtp: invalid master key or salt length")]
    SrtpBadKeyLength,
    #[error("mikey: {0}")]
    Mikey(String),

    //io and lifecycle errors
    #[error("i/o timeout: {0}")]
    IoTimeout(String),
    #[error("write queue full")]
    WriteQueueFull,
    #[error("terminated")]
    Terminated,
    #[error("session closed")]
    SessionClosed,
    #[error("address {0} already bound by another session")]
    AddrInUseBySession(SocketAddr),
    #[error("no free multicast group in the configured range")]
    MulticastExhausted,
    #[error("no free UDP port pair")]
    PortPairExhausted,

    #[error("io error: {0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<ParseIntError> for Error {
    fn from(e: ParseIntError) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<FromUtf8Error> for Error {
    fn from(e: FromUtf8Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl Error {
    /// Whether the error only affects a single media packet and must be
    /// reported through the decode-error callback instead of closing the
    /// session.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::PacketOversize(_)
                | Error::UnknownPayloadType(_)
                | Error::WrongSsrc { .. }
                | Error::PacketTooShort
                | Error::BadVersion
                | Error::SrtpAuthFailed
                | Error::SrtpReplay
        )
    }
}
