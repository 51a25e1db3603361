//! Basic and Digest authentication (RFC 2617 as profiled by RFC 2326 §16).
//!
//! Digest supports the `MD5`, `MD5-sess`, `SHA-256` and `SHA-256-sess`
//! algorithms without qop, which is what IP cameras and most RTSP servers
//! actually speak.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest as _, Md5};
use ring::digest as ring_digest;

use shared::error::{Error, Result};
use shared::util::random_alpha_number;

use crate::message::{Method, Request, Response};

/// Username and password, from the caller or the URL userinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "MD5" => Some(DigestAlgorithm::Md5),
            "MD5-sess" => Some(DigestAlgorithm::Md5Sess),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-256-sess" => Some(DigestAlgorithm::Sha256Sess),
            _ => None,
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    /// Ranking used when a server offers several challenges.
    fn strength(&self) -> u8 {
        match self {
            DigestAlgorithm::Sha256Sess => 4,
            DigestAlgorithm::Sha256 => 3,
            DigestAlgorithm::Md5Sess => 2,
            DigestAlgorithm::Md5 => 1,
        }
    }

    fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                let mut h = Md5::new();
                h.update(data.as_bytes());
                hex_str(&h.finalize())
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                let d = ring_digest::digest(&ring_digest::SHA256, data.as_bytes());
                hex_str(d.as_ref())
            }
        }
    }
}

fn hex_str(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic {
        realm: String,
    },
    Digest {
        realm: String,
        nonce: String,
        algorithm: DigestAlgorithm,
        stale: bool,
    },
}

impl Challenge {
    fn strength(&self) -> u8 {
        match self {
            Challenge::Basic { .. } => 0,
            Challenge::Digest { algorithm, .. } => algorithm.strength(),
        }
    }

    pub fn parse(value: &str) -> Result<Challenge> {
        let (scheme, rest) = value
            .split_once(' ')
            .ok_or_else(|| Error::MalformedHeader("WWW-Authenticate".to_owned(), value.to_owned()))?;
        let params = parse_auth_params(rest);
        let get = |name: &str| -> Option<&str> {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        match scheme {
            "Basic" => Ok(Challenge::Basic {
                realm: get("realm").unwrap_or_default().to_owned(),
            }),
            "Digest" => {
                let realm = get("realm")
                    .ok_or_else(|| {
                        Error::MalformedHeader("WWW-Authenticate".to_owned(), value.to_owned())
                    })?
                    .to_owned();
                let nonce = get("nonce")
                    .ok_or_else(|| {
                        Error::MalformedHeader("WWW-Authenticate".to_owned(), value.to_owned())
                    })?
                    .to_owned();
                let algorithm = match get("algorithm") {
                    Some(a) => DigestAlgorithm::parse(a)
                        .ok_or_else(|| Error::UnsupportedAuthScheme(a.to_owned()))?,
                    None => DigestAlgorithm::Md5,
                };
                let stale = get("stale")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                Ok(Challenge::Digest {
                    realm,
                    nonce,
                    algorithm,
                    stale,
                })
            }
            other => Err(Error::UnsupportedAuthScheme(other.to_owned())),
        }
    }
}

/// Parses `k="quoted, value", k2=bare` parameter lists, honoring commas
/// inside quoted strings.
fn parse_auth_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut in_quotes = false;

    let mut push = |key: &mut String, value: &mut String| {
        if !key.trim().is_empty() {
            out.push((key.trim().to_owned(), std::mem::take(value)));
        }
        key.clear();
    };

    for c in s.chars() {
        match c {
            '"' if in_value => in_quotes = !in_quotes,
            '=' if !in_value => in_value = true,
            ',' if !in_quotes => {
                push(&mut key, &mut value);
                in_value = false;
            }
            _ => {
                if in_value {
                    value.push(c);
                } else {
                    key.push(c);
                }
            }
        }
    }
    push(&mut key, &mut value);

    out.into_iter()
        .map(|(k, v)| (k, v.trim().to_owned()))
        .collect()
}

fn digest_response(
    algorithm: DigestAlgorithm,
    credentials: &Credentials,
    realm: &str,
    method: Method,
    uri: &str,
    nonce: &str,
    cnonce: Option<&str>,
) -> String {
    let mut ha1 = algorithm.hash(&format!(
        "{}:{realm}:{}",
        credentials.username, credentials.password
    ));
    if algorithm.is_session() {
        let cnonce = cnonce.unwrap_or("");
        ha1 = algorithm.hash(&format!("{ha1}:{nonce}:{cnonce}"));
    }
    let ha2 = algorithm.hash(&format!("{method}:{uri}"));
    algorithm.hash(&format!("{ha1}:{nonce}:{ha2}"))
}

/// Client-side authentication state: the accepted challenge, reused for
/// every subsequent request on the connection until the server rotates the
/// nonce with `stale=TRUE`.
#[derive(Debug)]
pub struct ClientAuth {
    credentials: Credentials,
    challenge: Option<Challenge>,
    cnonce: String,
    nc: u32,
}

impl ClientAuth {
    pub fn new(credentials: Credentials) -> Self {
        ClientAuth {
            credentials,
            challenge: None,
            cnonce: random_alpha_number(16),
            nc: 0,
        }
    }

    /// Picks the strongest supported challenge out of a 401 response.
    /// Returns an error when no scheme is usable.
    pub fn handle_unauthorized(&mut self, res: &Response) -> Result<()> {
        let mut best: Option<Challenge> = None;
        let mut raw = String::new();
        for value in res.headers.get_all("WWW-Authenticate") {
            raw.push_str(value);
            raw.push(' ');
            let Ok(challenge) = Challenge::parse(value) else {
                continue;
            };
            if best
                .as_ref()
                .map(|b| challenge.strength() > b.strength())
                .unwrap_or(true)
            {
                best = Some(challenge);
            }
        }
        match best {
            Some(challenge) => {
                self.challenge = Some(challenge);
                self.nc = 0;
                Ok(())
            }
            None => Err(Error::UnsupportedAuthScheme(raw.trim().to_owned())),
        }
    }

    /// The `Authorization` header for `method` on `uri`, when a challenge
    /// has been accepted.
    pub fn authorization(&mut self, method: Method, uri: &str) -> Option<String> {
        match &self.challenge {
            None => None,
            Some(Challenge::Basic { .. }) => {
                let token = BASE64.encode(format!(
                    "{}:{}",
                    self.credentials.username, self.credentials.password
                ));
                Some(format!("Basic {token}"))
            }
            Some(Challenge::Digest {
                realm,
                nonce,
                algorithm,
                ..
            }) => {
                self.nc += 1;
                let cnonce = algorithm.is_session().then_some(self.cnonce.as_str());
                let response = digest_response(
                    *algorithm,
                    &self.credentials,
                    realm,
                    method,
                    uri,
                    nonce,
                    cnonce,
                );
                let mut header = format!(
                    "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\", algorithm={}",
                    self.credentials.username,
                    algorithm.as_str(),
                );
                if let Some(cnonce) = cnonce {
                    header.push_str(&format!(", cnonce=\"{cnonce}\", nc={:08x}", self.nc));
                }
                Some(header)
            }
        }
    }
}

/// Server-side credential validation. The password lookup is supplied by
/// the application; digest validation recomputes the response with the
/// connection nonce.
#[derive(Clone)]
pub struct Authenticator {
    pub realm: String,
    lookup: std::sync::Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Authenticator {
    pub fn new(
        realm: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Authenticator {
            realm: realm.into(),
            lookup: std::sync::Arc::new(lookup),
        }
    }

    /// The `WWW-Authenticate` values advertised on 401, strongest first,
    /// with `stale=FALSE` per spec.
    pub fn challenges(&self, nonce: &str) -> Vec<String> {
        vec![
            format!(
                "Digest realm=\"{}\", nonce=\"{nonce}\", algorithm=SHA-256, stale=FALSE",
                self.realm
            ),
            format!(
                "Digest realm=\"{}\", nonce=\"{nonce}\", algorithm=MD5, stale=FALSE",
                self.realm
            ),
            format!("Basic realm=\"{}\"", self.realm),
        ]
    }

    /// Validates the `Authorization` header of `req` against the
    /// connection nonce.
    pub fn verify(&self, req: &Request, nonce: &str) -> Result<()> {
        let value = req.headers.get("Authorization").ok_or(Error::Unauthorized)?;
        let (scheme, rest) = value.split_once(' ').ok_or(Error::Unauthorized)?;

        match scheme {
            "Basic" => {
                let decoded = BASE64
                    .decode(rest.trim())
                    .map_err(|_| Error::Unauthorized)?;
                let decoded = String::from_utf8(decoded).map_err(|_| Error::Unauthorized)?;
                let (user, pass) = decoded.split_once(':').ok_or(Error::Unauthorized)?;
                match (self.lookup)(user) {
                    Some(expected) if expected == pass => Ok(()),
                    _ => Err(Error::Unauthorized),
                }
            }
            "Digest" => {
                let params = parse_auth_params(rest);
                let get = |name: &str| -> Option<&str> {
                    params
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(name))
                        .map(|(_, v)| v.as_str())
                };
                let username = get("username").ok_or(Error::Unauthorized)?;
                let uri = get("uri").ok_or(Error::Unauthorized)?;
                let response = get("response").ok_or(Error::Unauthorized)?;
                let req_nonce = get("nonce").ok_or(Error::Unauthorized)?;
                if req_nonce != nonce {
                    return Err(Error::Unauthorized);
                }
                let algorithm = match get("algorithm") {
                    Some(a) => DigestAlgorithm::parse(a).ok_or(Error::Unauthorized)?,
                    None => DigestAlgorithm::Md5,
                };
                let password = (self.lookup)(username).ok_or(Error::Unauthorized)?;
                let credentials = Credentials {
                    username: username.to_owned(),
                    password,
                };
                let expected = digest_response(
                    algorithm,
                    &credentials,
                    &self.realm,
                    req.method,
                    uri,
                    nonce,
                    get("cnonce"),
                );
                if expected == response {
                    Ok(())
                } else {
                    Err(Error::Unauthorized)
                }
            }
            _ => Err(Error::Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;

    fn creds() -> Credentials {
        Credentials {
            username: "user".to_owned(),
            password: "pass".to_owned(),
        }
    }

    #[test]
    fn test_digest_md5_rfc2069_vector() {
        // H(H(user:IPCAM:pass):abc:H(DESCRIBE:rtsp://h/s)) computed
        // independently; pins the no-qop digest formula.
        let response = digest_response(
            DigestAlgorithm::Md5,
            &creds(),
            "IPCAM",
            Method::Describe,
            "rtsp://h/s",
            "abc",
            None,
        );
        let ha1 = DigestAlgorithm::Md5.hash("user:IPCAM:pass");
        let ha2 = DigestAlgorithm::Md5.hash("DESCRIBE:rtsp://h/s");
        assert_eq!(
            response,
            DigestAlgorithm::Md5.hash(&format!("{ha1}:abc:{ha2}"))
        );
    }

    #[test]
    fn test_picks_strongest_challenge() {
        let res = Response::new(StatusCode::UNAUTHORIZED)
            .with_header("WWW-Authenticate", "Basic realm=\"r\"")
            .with_header(
                "WWW-Authenticate",
                "Digest realm=\"r\", nonce=\"n\", algorithm=MD5",
            )
            .with_header(
                "WWW-Authenticate",
                "Digest realm=\"r\", nonce=\"n\", algorithm=SHA-256",
            );
        let mut auth = ClientAuth::new(creds());
        auth.handle_unauthorized(&res).unwrap();
        let header = auth.authorization(Method::Describe, "rtsp://h/s").unwrap();
        assert!(header.contains("algorithm=SHA-256"));
    }

    #[test]
    fn test_server_round_trip_digest() {
        let authenticator = Authenticator::new("IPCAM", |user| {
            (user == "user").then(|| "pass".to_owned())
        });
        let nonce = "0123456789abcdef0123456789abcdef";

        let mut auth = ClientAuth::new(creds());
        let challenge = &authenticator.challenges(nonce)[0];
        let res = Response::new(StatusCode::UNAUTHORIZED)
            .with_header("WWW-Authenticate", challenge.clone());
        auth.handle_unauthorized(&res).unwrap();

        let header = auth
            .authorization(Method::Describe, "rtsp://h/stream")
            .unwrap();
        let req = Request::new(Method::Describe, "rtsp://h/stream")
            .with_header("Authorization", header);
        authenticator.verify(&req, nonce).unwrap();
    }

    #[test]
    fn test_server_round_trip_basic() {
        let authenticator =
            Authenticator::new("r", |user| (user == "user").then(|| "pass".to_owned()));
        let res = Response::new(StatusCode::UNAUTHORIZED)
            .with_header("WWW-Authenticate", "Basic realm=\"r\"");
        let mut auth = ClientAuth::new(creds());
        auth.handle_unauthorized(&res).unwrap();
        let header = auth.authorization(Method::Options, "rtsp://h/").unwrap();
        let req =
            Request::new(Method::Options, "rtsp://h/").with_header("Authorization", header);
        authenticator.verify(&req, "whatever").unwrap();
    }

    #[test]
    fn test_wrong_password_rejected() {
        let authenticator =
            Authenticator::new("r", |user| (user == "user").then(|| "other".to_owned()));
        let nonce = "aa";
        let mut auth = ClientAuth::new(creds());
        let res = Response::new(StatusCode::UNAUTHORIZED).with_header(
            "WWW-Authenticate",
            format!("Digest realm=\"r\", nonce=\"{nonce}\""),
        );
        auth.handle_unauthorized(&res).unwrap();
        let header = auth.authorization(Method::Describe, "rtsp://h/s").unwrap();
        let req =
            Request::new(Method::Describe, "rtsp://h/s").with_header("Authorization", header);
        assert_eq!(authenticator.verify(&req, nonce), Err(Error::Unauthorized));
    }

    #[test]
    fn test_no_supported_scheme() {
        let res = Response::new(StatusCode::UNAUTHORIZED)
            .with_header("WWW-Authenticate", "Bearer realm=\"r\"");
        let mut auth = ClientAuth::new(creds());
        assert!(auth.handle_unauthorized(&res).is_err());
    }

    #[test]
    fn test_quoted_comma_in_realm() {
        let c = Challenge::parse("Digest realm=\"a, b\", nonce=\"n\"").unwrap();
        match c {
            Challenge::Digest { realm, .. } => assert_eq!(realm, "a, b"),
            other => panic!("unexpected challenge {other:?}"),
        }
    }
}
