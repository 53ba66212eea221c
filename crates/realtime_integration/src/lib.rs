use std::sync::Arc;

use async_trait::async_trait;
use shared::protocol::{PresenceDiff, PresencePayload, PresenceState};
use tokio::sync::broadcast;

pub mod media;
pub mod memory;

pub use media::{AudioConstraints, AudioTrack, LocalAudioStream, MediaDevices, MediaError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChannelOptions {
    pub topic: String,
    /// Key the client's own entries are tracked under, normally the user id.
    pub presence_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Complete membership snapshot of the topic.
    Sync(PresenceState),
    Join(PresenceDiff),
    Leave(PresenceDiff),
}

#[async_trait]
pub trait PresenceChannel: Send + Sync {
    fn topic(&self) -> &str;
    async fn track(&self, payload: PresencePayload) -> anyhow::Result<()>;
    async fn untrack(&self) -> anyhow::Result<()>;
    async fn unsubscribe(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent>;
}

#[async_trait]
pub trait PresenceConnector: Send + Sync {
    async fn subscribe(
        &self,
        options: PresenceChannelOptions,
    ) -> anyhow::Result<Arc<dyn PresenceChannel>>;
}
