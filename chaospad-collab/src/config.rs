//! Relay configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::gate::{CHARS_PER_WORD, DEFAULT_MAX_CHARS, DEFAULT_MIN_INTERVAL};
use crate::room::DEFAULT_ROOM_CAPACITY;
use crate::storage::DEFAULT_RETENTION;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket listener address
    pub ws_addr: String,
    /// HTTP snapshot API listener address
    pub http_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Minimum spacing between non-final snapshot writes per document
    pub snapshot_min_interval: Duration,
    /// Character cap applied to the declared snapshot size
    pub max_snapshot_chars: u64,
    /// Characters assumed per word when only a word count is declared
    pub chars_per_word: u64,
    /// Snapshots kept per document
    pub snapshot_retention: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Document ids registered at startup
    pub documents: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:9090".to_string(),
            http_addr: "127.0.0.1:9091".to_string(),
            max_peers_per_room: DEFAULT_ROOM_CAPACITY,
            snapshot_min_interval: DEFAULT_MIN_INTERVAL,
            max_snapshot_chars: DEFAULT_MAX_CHARS,
            chars_per_word: CHARS_PER_WORD,
            snapshot_retention: DEFAULT_RETENTION,
            storage_path: None,
            documents: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Ephemeral ports, in-memory storage and the given documents.
    pub fn for_testing<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ws_addr: "127.0.0.1:0".to_string(),
            http_addr: "127.0.0.1:0".to_string(),
            documents: documents.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CHAOSPAD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAOSPAD_WS_ADDR") {
            config.ws_addr = addr;
        }
        if let Some(addr) = lookup("CHAOSPAD_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(peers) = parse_var(&lookup, "CHAOSPAD_MAX_PEERS") {
            config.max_peers_per_room = peers;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHAOSPAD_SNAPSHOT_INTERVAL_MS") {
            config.snapshot_min_interval = Duration::from_millis(ms);
        }
        if let Some(chars) = parse_var(&lookup, "CHAOSPAD_MAX_CHARS") {
            config.max_snapshot_chars = chars;
        }
        if let Some(keep) = parse_var(&lookup, "CHAOSPAD_RETENTION") {
            config.snapshot_retention = keep;
        }
        if let Some(path) = lookup("CHAOSPAD_STORAGE_PATH").filter(|p| !p.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(ids) = lookup("CHAOSPAD_DOCUMENTS") {
            config.documents = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}
