//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape: serde target before resolution.
#[derive(Deserialize)]
pub(super) struct RawConfig {
    pub marketplace: RawMarketplace,
    #[serde(default)]
    pub hub: RawHub,
    #[serde(default)]
    pub provider: RawProvider,
    #[serde(default)]
    pub consumer: RawConsumer,
    #[serde(default)]
    pub conversation: RawConversation,
}

#[derive(Deserialize)]
pub(super) struct RawMarketplace {
    pub agent_name: String,
    pub work_dir: String,
    #[serde(default)]
    pub identity_dir: Option<String>,
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

// ── Hub ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawHub {
    #[serde(default = "default_bus_buffer")]
    pub bus_buffer: usize,
    #[serde(default = "default_inbox_buffer")]
    pub inbox_buffer: usize,
    #[serde(default = "default_conversation_buffer")]
    pub conversation_buffer: usize,
}

impl Default for RawHub {
    fn default() -> Self {
        Self {
            bus_buffer: default_bus_buffer(),
            inbox_buffer: default_inbox_buffer(),
            conversation_buffer: default_conversation_buffer(),
        }
    }
}

pub(super) fn default_bus_buffer() -> usize { 256 }
pub(super) fn default_inbox_buffer() -> usize { 64 }
pub(super) fn default_conversation_buffer() -> usize { 32 }

// ── Provider ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawProvider {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_conversations: usize,
    /// Defaults to `true`: quote the listing price on open.
    #[serde(default = "default_true")]
    pub auto_quote: bool,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for RawProvider {
    fn default() -> Self {
        Self {
            max_concurrent_conversations: default_max_concurrent(),
            auto_quote: true,
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

pub(super) fn default_max_concurrent() -> usize { 16 }
pub(super) fn default_idle_timeout_secs() -> u64 { 300 }

// ── Consumer ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawConsumer {
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default)]
    pub max_auto_accept_price: Option<u64>,
}

impl Default for RawConsumer {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout_secs(),
            max_auto_accept_price: None,
        }
    }
}

pub(super) fn default_response_timeout_secs() -> u64 { 30 }

// ── Conversation ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawConversation {
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Defaults to `false`: transcripts must be explicitly enabled.
    #[serde(default = "default_false")]
    pub persist_transcripts: bool,
    #[serde(default = "default_transcript_cap")]
    pub transcript_cap: usize,
}

impl Default for RawConversation {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            persist_transcripts: false,
            transcript_cap: default_transcript_cap(),
        }
    }
}

pub(super) fn default_history_cap() -> usize { 200 }
pub(super) fn default_transcript_cap() -> usize { 500 }

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}
