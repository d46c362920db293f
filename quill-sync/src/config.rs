//! Bridge configuration.
//!
//! Defaults first, then `QUILL_*` environment overrides via
//! [`BridgeConfig::from_env`]. The binary layers command-line flags on top.

use std::time::Duration;

/// Settings shared by the host and the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// REST base URL for the project directory.
    pub http_base_url: String,
    /// WebSocket URL of the realtime document backend.
    pub ws_base_url: String,
    /// Local port of the host's control plane (0 = ephemeral).
    pub control_plane_port: u16,
    /// Static bearer token; `None` means the credential provider supplies one.
    pub auth_token: Option<String>,
    /// Received messages older than this are discarded.
    pub stale_after: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub request_timeout: Duration,
    /// Minimum interval between directory refreshes.
    pub directory_throttle: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_base_url: "http://127.0.0.1:5000/api".to_string(),
            ws_base_url: "ws://127.0.0.1:9090".to_string(),
            control_plane_port: 8876,
            auth_token: None,
            stale_after: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            directory_throttle: Duration::from_secs(60),
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `QUILL_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup. Unparseable values are
    /// logged and ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("QUILL_HTTP_BASE_URL") {
            self.http_base_url = v;
        }
        if let Some(v) = lookup("QUILL_WS_BASE_URL") {
            self.ws_base_url = v;
        }
        if let Some(v) = lookup("QUILL_AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Some(port) = parse(&lookup, "QUILL_CONTROL_PLANE_PORT") {
            self.control_plane_port = port;
        }

        let millis = |key: &str| parse::<u64>(&lookup, key).map(Duration::from_millis);
        if let Some(d) = millis("QUILL_STALE_AFTER_MS") {
            self.stale_after = d;
        }
        if let Some(d) = millis("QUILL_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout = d;
        }
        if let Some(d) = millis("QUILL_CONNECT_TIMEOUT_MS") {
            self.connect_timeout = d;
        }
        if let Some(d) = millis("QUILL_SUBSCRIBE_TIMEOUT_MS") {
            self.subscribe_timeout = d;
        }
        if let Some(d) = millis("QUILL_REQUEST_TIMEOUT_MS") {
            self.request_timeout = d;
        }
        if let Some(d) = millis("QUILL_DIRECTORY_THROTTLE_MS") {
            self.directory_throttle = d;
        }
        self
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}
