//! Resolved configuration structs handed to the hub, provider and consumer.

use std::path::PathBuf;
use std::time::Duration;

/// Bus and channel capacities for an in-process hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of the hub's inbound request queue.
    pub bus_buffer: usize,
    /// Capacity of each provider's incoming-conversation queue.
    pub inbox_buffer: usize,
    /// Capacity of each direction of a conversation.
    pub conversation_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bus_buffer: 256,
            inbox_buffer: 64,
            conversation_buffer: 32,
        }
    }
}

/// Provider-side runtime behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Upper bound on conversations served at once by `serve`.
    pub max_concurrent_conversations: usize,
    /// Offer the listing price as soon as a conversation opens.
    pub auto_quote: bool,
    /// Close a served conversation after this long without a consumer message.
    pub idle_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_conversations: 16,
            auto_quote: true,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Consumer-side runtime behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// How long `ConversationWrapper::recv` waits for the provider.
    pub response_timeout: Duration,
    /// Highest quote `MarketplaceConsumer::request` accepts without asking.
    /// `None` accepts any price.
    pub max_auto_accept_price: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            max_auto_accept_price: None,
        }
    }
}

/// Per-conversation bookkeeping shared by both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationConfig {
    /// In-memory history cap per wrapper (FIFO).
    pub history_cap: usize,
    /// Write a Markdown transcript under `work_dir/conversations/`.
    pub persist_transcripts: bool,
    /// Transcript entry cap per conversation (FIFO).
    pub transcript_cap: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_cap: 200,
            persist_transcripts: false,
            transcript_cap: 500,
        }
    }
}

/// Fully-resolved marketplace configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub agent_name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    /// Optional explicit identity directory (absolute path or relative to `work_dir`).
    pub identity_dir: Option<PathBuf>,
    pub log_level: String,
    /// Append logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
    pub hub: HubConfig,
    pub provider: ProviderConfig,
    pub consumer: ConsumerConfig,
    pub conversation: ConversationConfig,
}

impl Config {
    /// Directory holding per-conversation transcripts.
    pub fn transcripts_dir(&self) -> PathBuf {
        self.work_dir.join("conversations")
    }
}
