//! Process configuration.
//!
//! A [`Config`] is assembled exactly once at startup: compiled-in defaults,
//! then an optional TOML file, then the `LISTEN_*` / `SEND_*` environment
//! variables. It is validated and never mutated afterwards; every component
//! receives it (or a part of it) by reference or behind an `Arc`.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Values accepted as "true" for boolean settings (ASCII case-insensitive,
/// surrounding whitespace ignored). Anything else is false.
const TRUTHY: [&str; 4] = ["1", "true", "yes", "on"];

#[must_use]
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    TRUTHY.iter().any(|t| t.eq_ignore_ascii_case(value))
}

/// Where PEM material comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PemSource {
    Path(PathBuf),
    Inline(String),
}

impl fmt::Display for PemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Inline(_) => f.write_str("<inline>"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub cert: Option<PemSource>,
    pub key: Option<PemSource>,
}

impl TlsMaterial {
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// Inbound listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "defaults::listen_host")]
    pub host: String,

    #[serde(default = "defaults::listen_port")]
    pub port: u16,

    /// Implicit TLS from the first byte.
    #[serde(default)]
    pub secured: bool,

    #[serde(default)]
    pub tls: TlsMaterial,

    #[serde(default)]
    pub auth_required: bool,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub pass: Option<String>,

    /// Permit AUTH over an unencrypted session. When unset this follows
    /// `auth_required && !secured`.
    #[serde(default)]
    pub allow_insecure_auth: Option<bool>,

    /// Name used in the greeting and EHLO reply. Defaults to the host name.
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub banner: Option<String>,

    /// Maximum accepted message size in bytes. `None` is unlimited.
    #[serde(default)]
    pub max_size: Option<usize>,

    #[serde(default)]
    pub size_hidden: bool,

    #[serde(default = "defaults::listen_max_clients")]
    pub max_clients: usize,

    #[serde(default = "defaults::listen_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    #[serde(default = "defaults::listen_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: defaults::listen_host(),
            port: defaults::listen_port(),
            secured: false,
            tls: TlsMaterial::default(),
            auth_required: false,
            user: None,
            pass: None,
            allow_insecure_auth: None,
            server_name: None,
            banner: None,
            max_size: None,
            size_hidden: false,
            max_clients: defaults::listen_max_clients(),
            socket_timeout_ms: defaults::listen_socket_timeout_ms(),
            close_timeout_ms: defaults::listen_close_timeout_ms(),
        }
    }
}

impl ListenConfig {
    #[must_use]
    pub fn allows_insecure_auth(&self) -> bool {
        self.allow_insecure_auth
            .unwrap_or(self.auth_required && !self.secured)
    }

    #[must_use]
    pub fn server_name(&self) -> String {
        self.server_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| String::from("localhost"))
        })
    }

    #[must_use]
    pub const fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How the relay authenticates against the upstream host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendAuthType {
    #[default]
    Login,
    Plain,
    OAuth2,
}

impl FromStr for SendAuthType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "login" => Ok(Self::Login),
            "plain" => Ok(Self::Plain),
            "oauth2" | "xoauth2" => Ok(Self::OAuth2),
            other => Err(ConfigError::InvalidValue {
                field: "SEND_AUTH_TYPE",
                reason: format!("unknown authentication type '{other}'"),
            }),
        }
    }
}

/// OAuth2 fields for the upstream login. Only `access_token` is used on the
/// wire; the rest are carried for completeness of the configuration surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub access_url: Option<String>,
    pub service_client_id: Option<String>,
    pub service_client_private_key: Option<String>,
    pub access_token: Option<String>,
}

/// Client-side SMTP timeouts for the upstream dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Default: 30 seconds
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// EHLO, STARTTLS, AUTH, MAIL, RCPT and RSET.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_command_secs")]
    pub command_secs: u64,

    /// Default: 120 seconds
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,

    /// Default: 10 seconds
    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            command_secs: defaults::client_command_secs(),
            data_secs: defaults::client_data_secs(),
            quit_secs: defaults::client_quit_secs(),
        }
    }
}

/// Outbound relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendConfig {
    /// Fixed sender applied to every relayed message.
    #[serde(default)]
    pub from: String,

    #[serde(default)]
    pub auth_type: SendAuthType,

    #[serde(default)]
    pub host: String,

    #[serde(default = "defaults::send_port")]
    pub port: u16,

    /// Implicit TLS to the upstream.
    #[serde(default)]
    pub use_ssl: bool,

    /// Refuse to relay unless STARTTLS succeeds.
    #[serde(default)]
    pub use_tls: bool,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub pass: Option<String>,

    #[serde(default)]
    pub oauth2: OAuth2Config,

    #[serde(default)]
    pub pooling: bool,

    #[serde(default = "defaults::send_rate_delta_ms")]
    pub rate_delta_ms: u64,

    /// Zero disables the rate window.
    #[serde(default = "defaults::send_rate_limit")]
    pub rate_limit: usize,

    #[serde(default = "defaults::send_max_connections")]
    pub max_connections: usize,

    #[serde(default = "defaults::send_max_messages_per_connection")]
    pub max_messages_per_connection: usize,

    #[serde(default = "defaults::send_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            from: String::new(),
            auth_type: SendAuthType::default(),
            host: String::new(),
            port: defaults::send_port(),
            use_ssl: false,
            use_tls: false,
            user: None,
            pass: None,
            oauth2: OAuth2Config::default(),
            pooling: false,
            rate_delta_ms: defaults::send_rate_delta_ms(),
            rate_limit: defaults::send_rate_limit(),
            max_connections: defaults::send_max_connections(),
            max_messages_per_connection: defaults::send_max_messages_per_connection(),
            queue_timeout_ms: defaults::send_queue_timeout_ms(),
            debug: false,
            timeouts: ClientTimeouts::default(),
        }
    }
}

impl SendConfig {
    #[must_use]
    pub const fn rate_delta(&self) -> Duration {
        Duration::from_millis(self.rate_delta_ms)
    }

    #[must_use]
    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub send: SendConfig,
}

impl Config {
    /// Parse a TOML document; every key is optional.
    ///
    /// # Errors
    /// If the document is not valid for this schema
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(document)?)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// If the file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_toml(&document)
    }

    /// Build from defaults plus the process environment, then validate.
    ///
    /// # Errors
    /// Any invalid or missing setting
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults plus an arbitrary variable source, then validate.
    ///
    /// # Errors
    /// Any invalid or missing setting
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `LISTEN_*` / `SEND_*` variables on top of the current values.
    /// Empty variables are treated as unset.
    ///
    /// # Errors
    /// A numeric or enumerated variable that does not parse
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let listen = &mut self.listen;
        if let Some(host) = var("LISTEN_HOST") {
            listen.host = host;
        }
        if let Some(port) = var("LISTEN_PORT") {
            listen.port = parse_number("LISTEN_PORT", &port)?;
        }
        if let Some(secured) = var("LISTEN_SECURED") {
            listen.secured = is_truthy(&secured);
        }
        if let Some(path) = var("LISTEN_KEY_PATH") {
            listen.tls.key = Some(PemSource::Path(path.into()));
        }
        if let Some(path) = var("LISTEN_CERT_PATH") {
            listen.tls.cert = Some(PemSource::Path(path.into()));
        }
        if let Some(pem) = var("LISTEN_KEY") {
            listen.tls.key = Some(PemSource::Inline(pem));
        }
        if let Some(pem) = var("LISTEN_CERT") {
            listen.tls.cert = Some(PemSource::Inline(pem));
        }
        if let Some(required) = var("LISTEN_AUTH_REQUIRED") {
            listen.auth_required = is_truthy(&required);
        }
        if let Some(user) = var("LISTEN_USER") {
            listen.user = Some(user);
        }
        if let Some(pass) = lookup("LISTEN_PASS") {
            listen.pass = Some(pass);
        }
        if let Some(insecure) = var("LISTEN_ALLOW_INSECURE_AUTH") {
            listen.allow_insecure_auth = Some(is_truthy(&insecure));
        }
        if let Some(name) = var("LISTEN_SERVER_NAME") {
            listen.server_name = Some(name);
        }
        if let Some(banner) = var("LISTEN_BANNER") {
            listen.banner = Some(banner);
        }
        if let Some(size) = var("LISTEN_MAX_SIZE") {
            let size: usize = parse_number("LISTEN_MAX_SIZE", &size)?;
            listen.max_size = (size > 0).then_some(size);
        }
        if let Some(hidden) = var("LISTEN_SIZE_HIDDEN") {
            listen.size_hidden = is_truthy(&hidden);
        }
        if let Some(clients) = var("LISTEN_MAX_CLIENTS") {
            listen.max_clients = parse_number("LISTEN_MAX_CLIENTS", &clients)?;
        }
        if let Some(timeout) = var("LISTEN_SOCKET_TIMEOUT") {
            listen.socket_timeout_ms = parse_number("LISTEN_SOCKET_TIMEOUT", &timeout)?;
        }
        if let Some(timeout) = var("LISTEN_CLOSE_TIMEOUT") {
            listen.close_timeout_ms = parse_number("LISTEN_CLOSE_TIMEOUT", &timeout)?;
        }

        let send = &mut self.send;
        if let Some(from) = var("SEND_FROM") {
            send.from = from;
        }
        if let Some(auth_type) = var("SEND_AUTH_TYPE") {
            send.auth_type = auth_type.parse()?;
        }
        if let Some(host) = var("SEND_HOST") {
            send.host = host;
        }
        if let Some(port) = var("SEND_PORT") {
            send.port = parse_number("SEND_PORT", &port)?;
        }
        if let Some(ssl) = var("SEND_USE_SSL") {
            send.use_ssl = is_truthy(&ssl);
        }
        if let Some(tls) = var("SEND_USE_TLS") {
            send.use_tls = is_truthy(&tls);
        }
        if let Some(user) = var("SEND_USER") {
            send.user = Some(user);
        }
        if let Some(pass) = lookup("SEND_PASS") {
            send.pass = Some(pass);
        }

        let oauth2 = &mut send.oauth2;
        for (key, slot) in [
            ("SEND_CLIENT_ID", &mut oauth2.client_id),
            ("SEND_CLIENT_SECRET", &mut oauth2.client_secret),
            ("SEND_REFRESH_TOKEN", &mut oauth2.refresh_token),
            ("SEND_ACCESS_URL", &mut oauth2.access_url),
            ("SEND_SERVICE_CLIENT_ID", &mut oauth2.service_client_id),
            (
                "SEND_SERVICE_CLIENT_PRIVATE_KEY",
                &mut oauth2.service_client_private_key,
            ),
            ("SEND_ACCESS_TOKEN", &mut oauth2.access_token),
        ] {
            if let Some(value) = var(key) {
                *slot = Some(value);
            }
        }

        if let Some(pooling) = var("SEND_POOLING") {
            send.pooling = is_truthy(&pooling);
        }
        if let Some(delta) = var("SEND_RATE_DELTA") {
            send.rate_delta_ms = parse_number("SEND_RATE_DELTA", &delta)?;
        }
        if let Some(limit) = var("SEND_RATE_LIMIT") {
            send.rate_limit = parse_number("SEND_RATE_LIMIT", &limit)?;
        }
        if let Some(max) = var("SEND_MAX_CONNECTIONS") {
            send.max_connections = parse_number("SEND_MAX_CONNECTIONS", &max)?;
        }
        if let Some(max) = var("SEND_MAX_MESSAGES_PER_CONNECTION") {
            send.max_messages_per_connection =
                parse_number("SEND_MAX_MESSAGES_PER_CONNECTION", &max)?;
        }
        if let Some(timeout) = var("SEND_QUEUE_TIMEOUT") {
            send.queue_timeout_ms = parse_number("SEND_QUEUE_TIMEOUT", &timeout)?;
        }
        if let Some(debug) = var("SEND_DEBUG") {
            send.debug = is_truthy(&debug);
        }

        Ok(())
    }

    /// Check cross-field requirements.
    ///
    /// # Errors
    /// The first requirement that is not met
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send.from.trim().is_empty() {
            return Err(ConfigError::MissingField("SEND_FROM"));
        }
        if self.send.host.trim().is_empty() {
            return Err(ConfigError::MissingField("SEND_HOST"));
        }

        if self.listen.auth_required {
            if self.listen.user.is_none() {
                return Err(ConfigError::MissingField("LISTEN_USER"));
            }
            if self.listen.pass.is_none() {
                return Err(ConfigError::MissingField("LISTEN_PASS"));
            }
        }

        if self.listen.secured {
            if self.listen.tls.key.is_none() {
                return Err(ConfigError::MissingField("LISTEN_KEY_PATH"));
            }
            if self.listen.tls.cert.is_none() {
                return Err(ConfigError::MissingField("LISTEN_CERT_PATH"));
            }
        }

        if self.send.auth_type == SendAuthType::OAuth2
            && self.send.user.is_some()
            && self.send.oauth2.access_token.is_none()
        {
            return Err(ConfigError::MissingField("SEND_ACCESS_TOKEN"));
        }

        for (field, value) in [
            ("LISTEN_MAX_CLIENTS", self.listen.max_clients),
            ("SEND_MAX_CONNECTIONS", self.send.max_connections),
            (
                "SEND_MAX_MESSAGES_PER_CONNECTION",
                self.send.max_messages_per_connection,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: String::from("must be at least 1"),
                });
            }
        }

        if self.send.rate_limit > 0 && self.send.rate_delta_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "SEND_RATE_DELTA",
                reason: String::from("must be positive when a rate limit is set"),
            });
        }

        Ok(())
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            field,
            reason: format!("'{value}' is not a valid number"),
        })
}

mod defaults {
    pub fn listen_host() -> String {
        String::from("0.0.0.0")
    }
    pub const fn listen_port() -> u16 {
        25
    }
    pub const fn listen_max_clients() -> usize {
        50
    }
    pub const fn listen_socket_timeout_ms() -> u64 {
        60_000
    }
    pub const fn listen_close_timeout_ms() -> u64 {
        30_000
    }

    pub const fn send_port() -> u16 {
        25
    }
    pub const fn send_rate_delta_ms() -> u64 {
        60_000
    }
    pub const fn send_rate_limit() -> usize {
        75
    }
    pub const fn send_max_connections() -> usize {
        5
    }
    pub const fn send_max_messages_per_connection() -> usize {
        100
    }
    pub const fn send_queue_timeout_ms() -> u64 {
        30_000
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_command_secs() -> u64 {
        30
    }
    pub const fn client_data_secs() -> u64 {
        120 // 2 minutes
    }
    pub const fn client_quit_secs() -> u64 {
        10
    }
}
