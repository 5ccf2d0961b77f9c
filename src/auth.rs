//! Inbound credential checking and SASL decoding.

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

use crate::config::ListenConfig;

/// Identity bound when authentication is optional and no user is configured.
pub const ANONYMOUS: &str = "anonymous";

/// Scope returned in the XOAUTH2 failure challenge.
const XOAUTH2_SCOPE: &str = "my_smtp_access_scope_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Plain,
    Login,
    XOAuth2,
}

impl Mechanism {
    pub const ALL: [Self; 3] = [Self::Plain, Self::Login, Self::XOAuth2];
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::XOAuth2 => "XOAUTH2",
        })
    }
}

impl FromStr for Mechanism {
    type Err = SaslError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("PLAIN") {
            Ok(Self::Plain)
        } else if value.eq_ignore_ascii_case("LOGIN") {
            Ok(Self::Login)
        } else if value.eq_ignore_ascii_case("XOAUTH2") {
            Ok(Self::XOAuth2)
        } else {
            Err(SaslError::UnsupportedMechanism(value.to_string()))
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaslError {
    #[error("Unsupported authentication mechanism {0}")]
    UnsupportedMechanism(String),

    #[error("Invalid base64 encoding")]
    InvalidEncoding,

    #[error("Malformed {0} response")]
    Malformed(Mechanism),
}

/// Result of a single authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// The credentials were accepted; the payload is the bound identity.
    Success(String),
    /// The credentials were rejected.
    Failure,
    /// The mechanism wants another round trip. The payload is already
    /// base64 encoded and goes out verbatim after `334 `.
    Continue(String),
}

/// Validates AUTH attempts against the single configured credential.
///
/// Holds no per-session state, so one instance is shared by every session.
#[derive(Clone)]
pub struct Authenticator {
    required: bool,
    username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("required", &self.required)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    #[must_use]
    pub fn new(required: bool, username: Option<String>, password: Option<String>) -> Self {
        Self {
            required,
            username,
            password,
        }
    }

    #[must_use]
    pub fn from_config(listen: &ListenConfig) -> Self {
        Self::new(
            listen.auth_required,
            listen.user.clone(),
            listen.pass.clone(),
        )
    }

    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    fn identity(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }

    /// Check one attempt. For XOAUTH2 `password` is the bearer token.
    #[must_use]
    pub fn authenticate(&self, mechanism: Mechanism, username: &str, password: &str) -> AuthResult {
        if !self.required {
            return AuthResult::Success(self.identity());
        }

        let matches = self.username.as_deref() == Some(username)
            && self.password.as_deref() == Some(password);

        match (matches, mechanism) {
            (true, _) => AuthResult::Success(self.identity()),
            (false, Mechanism::XOAuth2) => AuthResult::Continue(xoauth2_challenge()),
            (false, Mechanism::Plain | Mechanism::Login) => AuthResult::Failure,
        }
    }
}

fn xoauth2_challenge() -> String {
    base64::encode(format!(
        r#"{{"status":"401","schemes":"bearer mac","scope":"{XOAUTH2_SCOPE}"}}"#
    ))
}

fn decode_utf8(encoded: &str) -> Result<String, SaslError> {
    let bytes = base64::decode(encoded.trim()).map_err(|_| SaslError::InvalidEncoding)?;
    String::from_utf8(bytes).map_err(|_| SaslError::InvalidEncoding)
}

/// Decode a single base64 field, as sent for each LOGIN prompt.
///
/// # Errors
/// If the field is not base64 encoded UTF-8
pub fn decode_login_field(encoded: &str) -> Result<String, SaslError> {
    decode_utf8(encoded)
}

/// Decode `[authzid] NUL authcid NUL passwd` into (authcid, passwd).
///
/// # Errors
/// If the response is not base64 or lacks the NUL separators
pub fn decode_plain(encoded: &str) -> Result<(String, String), SaslError> {
    let decoded = decode_utf8(encoded)?;
    let mut parts = decoded.split('\0');

    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(authcid), Some(passwd), None) => {
            Ok((authcid.to_string(), passwd.to_string()))
        }
        _ => Err(SaslError::Malformed(Mechanism::Plain)),
    }
}

/// Decode `user=<u>^Aauth=Bearer <token>^A^A` into (user, token).
///
/// # Errors
/// If the response is not base64 or the fields are missing
pub fn decode_xoauth2(encoded: &str) -> Result<(String, String), SaslError> {
    let decoded = decode_utf8(encoded)?;

    let mut user = None;
    let mut token = None;
    for field in decoded.split('\x01').filter(|f| !f.is_empty()) {
        if let Some(value) = field.strip_prefix("user=") {
            user = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("auth=") {
            let value = value.trim();
            let bearer = value
                .get(..7)
                .filter(|scheme| scheme.eq_ignore_ascii_case("Bearer "))
                .map(|_| &value[7..]);
            token = bearer.map(str::to_string);
        }
    }

    user.zip(token)
        .ok_or(SaslError::Malformed(Mechanism::XOAuth2))
}

/// Encode the client side of PLAIN with an empty authorization identity.
#[must_use]
pub fn encode_plain(username: &str, password: &str) -> String {
    base64::encode(format!("\0{username}\0{password}"))
}

/// Encode the client side of XOAUTH2.
#[must_use]
pub fn encode_xoauth2(username: &str, token: &str) -> String {
    base64::encode(format!("user={username}\x01auth=Bearer {token}\x01\x01"))
}
