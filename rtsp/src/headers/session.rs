use std::fmt;
use std::str::FromStr;

use shared::error::{Error, Result};

/// A `Session:` header value: opaque identifier plus the optional
/// `timeout=` parameter in seconds (RFC 2326 §12.37).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout: Option<u64>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>) -> Self {
        SessionHeader {
            id: id.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }
}

impl FromStr for SessionHeader {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let id = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::MalformedHeader("Session".to_owned(), s.to_owned()))?;

        let mut timeout = None;
        for part in parts {
            if let Some(v) = part.trim().strip_prefix("timeout=") {
                timeout = Some(
                    v.parse()
                        .map_err(|_| Error::MalformedHeader("Session".to_owned(), s.to_owned()))?,
                );
            }
        }

        Ok(SessionHeader {
            id: id.to_owned(),
            timeout,
        })
    }
}

impl fmt::Display for SessionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timeout {
            Some(t) => write!(f, "{};timeout={t}", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
