use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use realtime_integration::MediaError;
use shared::{
    domain::{ChannelId, UserId},
    error::{ErrorCode, ErrorNotice},
    protocol::PresenceState,
};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod config;
mod voice_session;

pub use shared::domain::ConnectionState;
pub use voice_session::VoiceSession;

/// One member of a voice channel as seen in the latest presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceParticipant {
    pub user_id: UserId,
    /// Name at the time the participant last published presence.
    pub user_name: String,
    pub is_muted: bool,
    /// No voice activity detection exists, so this is always `false`.
    pub is_speaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub user_name: String,
}

impl AuthenticatedUser {
    pub fn new(user_id: impl Into<UserId>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSessionSnapshot {
    pub channel_id: ChannelId,
    pub topic: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum VoiceEvent {
    ConnectionStateChanged(Option<VoiceSessionSnapshot>),
    ParticipantsUpdated {
        channel_id: ChannelId,
        participants: Vec<VoiceParticipant>,
    },
    MuteChanged {
        is_muted: bool,
    },
    Error(ErrorNotice),
}

#[derive(Debug, Error)]
pub enum VoiceSessionError {
    #[error("microphone access failed: {0}")]
    MediaAccessDenied(#[from] MediaError),
    #[error("presence topic unavailable: {0}")]
    PresenceUnavailable(String),
    #[error("voice session is closed")]
    Closed,
}

impl VoiceSessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MediaAccessDenied(_) => ErrorCode::MediaAccessDenied,
            Self::PresenceUnavailable(_) => ErrorCode::PresenceUnavailable,
            Self::Closed => ErrorCode::Internal,
        }
    }

    pub fn notice(&self) -> ErrorNotice {
        ErrorNotice::new(self.code(), self.to_string())
    }
}

/// Rebuilds the roster from a full snapshot. Every tracked entry becomes one
/// participant; nothing from earlier snapshots is carried over.
pub fn participants_from_presence(state: &PresenceState) -> Vec<VoiceParticipant> {
    state
        .metas()
        .map(|meta| VoiceParticipant {
            user_id: meta.payload.user_id.clone(),
            user_name: meta.payload.user_name.clone(),
            is_muted: meta.payload.is_muted,
            is_speaking: false,
        })
        .collect()
}

#[async_trait]
pub trait VoiceSessionHandle: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn toggle_mute(&self) -> Result<Option<bool>>;
    async fn set_user(&self, user: Option<AuthenticatedUser>) -> Result<()>;
    async fn connection_state(&self) -> ConnectionState;
    async fn participants(&self) -> Vec<VoiceParticipant>;
    fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent>;
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
