//! Credential extraction from the first inbound chunk.
//!
//! Only the first chunk of a connection is ever inspected. The parser does
//! not understand HTTP: every line containing the `Authorization` token is a
//! candidate. A candidate's third whitespace-separated token is decoded as
//! base64 and split on the first colon. The first candidate that gets through
//! all of that wins, so a marker inside a request path does not hide the
//! header line after it.
//!
//! A parse failure is not an error. It means "no credentials" and the caller
//! answers with a 407 challenge.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

/// Case-sensitive token identifying the credential-bearing line.
pub const AUTHORIZATION_MARKER: &[u8] = b"Authorization";

/// Sent when the lookup store cannot be reached.
pub const STORE_UNAVAILABLE_MESSAGE: &[u8] = b"lookup store unavailable, please try later\r\n";

/// Sent when the resolved backend cannot be dialed.
pub const BACKEND_UNREACHABLE_MESSAGE: &[u8] =
    b"backend server connect failed, please try later\r\n";

/// Sent when the account is unknown or the password does not match.
pub const AUTH_FAILED_MESSAGE: &[u8] = b"basic authorization failed\r\n";

/// A username/password pair taken from a Basic authorization line.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Extract Basic credentials from a connection's first chunk.
pub fn extract_credentials(chunk: &[u8]) -> Option<Credentials> {
    chunk
        .split(|b| *b == b'\n')
        .filter(|line| contains(line, AUTHORIZATION_MARKER))
        .find_map(parse_authorization_line)
}

fn parse_authorization_line(line: &[u8]) -> Option<Credentials> {
    let line = std::str::from_utf8(line).ok()?;

    let payload = line.split_whitespace().nth(2)?;
    let decoded = STANDARD.decode(payload).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let (username, password) = decoded.split_once(':')?;
    Some(Credentials::new(username, password))
}

/// Build the fixed 407 challenge for `realm`.
pub fn challenge_response(realm: &str) -> Bytes {
    let realm = realm.replace('\\', "\\\\").replace('"', "\\\"");
    Bytes::from(format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Basic realm=\"{}\"\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
        realm
    ))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
