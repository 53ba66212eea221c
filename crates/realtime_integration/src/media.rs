use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl AudioConstraints {
    /// Processing profile used for voice channels: everything on.
    pub fn voice() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no audio capture device available")]
    NoDevice,
    #[error("audio capture unavailable: {0}")]
    Unavailable(String),
}

pub trait AudioTrack: Send + Sync {
    fn id(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Releases the capture device. A stopped track never produces audio again.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

pub struct LocalAudioStream {
    tracks: Vec<Arc<dyn AudioTrack>>,
}

impl LocalAudioStream {
    pub fn new(tracks: Vec<Arc<dyn AudioTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn AudioTrack>] {
        &self.tracks
    }

    pub fn primary_track(&self) -> Option<&Arc<dyn AudioTrack>> {
        self.tracks.first()
    }

    pub fn is_enabled(&self) -> bool {
        self.primary_track()
            .map(|track| track.is_enabled())
            .unwrap_or(false)
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalAudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioStream")
            .field(
                "tracks",
                &self.tracks.iter().map(|track| track.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// May suspend on a permission prompt and device start-up.
    async fn get_user_audio(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalAudioStream, MediaError>;
}
