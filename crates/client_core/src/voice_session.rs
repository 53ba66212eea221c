use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use realtime_integration::{
    AudioConstraints, LocalAudioStream, MediaDevices, PresenceChannel, PresenceChannelOptions,
    PresenceConnector, PresenceEvent,
};
use shared::{
    domain::{ChannelId, ConnectionState},
    protocol::{topic_for_voice_channel, PresencePayload},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::VoiceSettings, participants_from_presence, AuthenticatedUser, VoiceEvent,
    VoiceParticipant, VoiceSessionError, VoiceSessionHandle, VoiceSessionSnapshot,
};

/// Roster plus the generation of the presence subscription allowed to write
/// it. Tearing a subscription down bumps the generation so a late sync from
/// the old subscription is dropped.
#[derive(Default)]
struct Roster {
    generation: u64,
    participants: Vec<VoiceParticipant>,
}

struct ActivePresence {
    channel: Arc<dyn PresenceChannel>,
    event_task: JoinHandle<()>,
}

struct VoiceSessionState {
    connection: ConnectionState,
    connected_at: Option<DateTime<Utc>>,
    local_stream: Option<LocalAudioStream>,
    user: Option<AuthenticatedUser>,
    presence: Option<ActivePresence>,
    closed: bool,
}

impl VoiceSessionState {
    fn is_muted(&self) -> bool {
        self.local_stream
            .as_ref()
            .map(|stream| !stream.is_enabled())
            .unwrap_or(false)
    }
}

/// Membership of one voice channel: local microphone ownership plus a roster
/// mirrored from the channel's presence topic.
///
/// Lifecycle operations are serialized on their own lock, so a `disconnect`
/// issued while `connect` waits on the permission prompt runs after it. State
/// reads only take the short-lived state lock and never wait on the prompt.
pub struct VoiceSession {
    channel_id: ChannelId,
    topic: String,
    presence_connector: Arc<dyn PresenceConnector>,
    media_devices: Arc<dyn MediaDevices>,
    lifecycle: Mutex<()>,
    inner: Mutex<VoiceSessionState>,
    roster: Arc<RwLock<Roster>>,
    events: broadcast::Sender<VoiceEvent>,
}

impl VoiceSession {
    pub fn open(
        channel_id: ChannelId,
        presence_connector: Arc<dyn PresenceConnector>,
        media_devices: Arc<dyn MediaDevices>,
        settings: &VoiceSettings,
    ) -> Arc<Self> {
        let topic = topic_for_voice_channel(&settings.topic_prefix, &channel_id);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Arc::new(Self {
            channel_id,
            topic,
            presence_connector,
            media_devices,
            lifecycle: Mutex::new(()),
            inner: Mutex::new(VoiceSessionState {
                connection: ConnectionState::Disconnected,
                connected_at: None,
                local_stream: None,
                user: None,
                presence: None,
                closed: false,
            }),
            roster: Arc::new(RwLock::new(Roster::default())),
            events,
        })
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    pub async fn has_local_stream(&self) -> bool {
        self.inner.lock().await.local_stream.is_some()
    }

    pub async fn is_muted(&self) -> bool {
        self.inner.lock().await.is_muted()
    }

    pub async fn participants(&self) -> Vec<VoiceParticipant> {
        self.roster.read().await.participants.clone()
    }

    pub async fn snapshot(&self) -> Option<VoiceSessionSnapshot> {
        let state = self.inner.lock().await;
        self.snapshot_of(&state)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Acquires the microphone and joins the channel's presence topic.
    ///
    /// A refused or missing microphone leaves the session exactly as it was.
    /// Presence failures do not fail the call; they are reported as
    /// [`VoiceEvent::Error`] and the roster stays empty.
    pub async fn connect(&self) -> Result<(), VoiceSessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let state = self.inner.lock().await;
            if state.closed {
                return Err(VoiceSessionError::Closed);
            }
            if state.connection.is_connected() {
                debug!(channel_id = %self.channel_id, "voice: connect ignored, already connected");
                return Ok(());
            }
        }

        let stream = self
            .media_devices
            .get_user_audio(AudioConstraints::voice())
            .await
            .map_err(|error| {
                warn!(channel_id = %self.channel_id, %error, "voice: microphone unavailable");
                VoiceSessionError::MediaAccessDenied(error)
            })?;

        {
            let mut state = self.inner.lock().await;
            let tracks = stream.tracks().len();
            state.local_stream = Some(stream);
            state.connection = ConnectionState::Connected;
            state.connected_at = Some(Utc::now());
            info!(channel_id = %self.channel_id, topic = %self.topic, tracks, "voice: connected");
            let _ = self
                .events
                .send(VoiceEvent::ConnectionStateChanged(self.snapshot_of(&state)));
        }

        self.open_presence().await;
        Ok(())
    }

    /// Releases the microphone and leaves the presence topic. Safe to call in
    /// any state.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    /// Flips the local track and republishes presence with the new mute flag.
    /// Returns `None` when there is no local stream to mute.
    pub async fn toggle_mute(&self) -> Option<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        let (is_muted, publish) = {
            let state = self.inner.lock().await;
            let stream = state.local_stream.as_ref()?;
            let enabled = !stream.primary_track()?.is_enabled();
            stream.set_enabled(enabled);
            let publish = match (&state.presence, &state.user) {
                (Some(active), Some(user)) => {
                    Some((Arc::clone(&active.channel), presence_payload(user, !enabled)))
                }
                _ => None,
            };
            (!enabled, publish)
        };
        info!(channel_id = %self.channel_id, is_muted, "voice: mute toggled");

        if let Some((channel, payload)) = publish {
            if let Err(error) = channel.track(payload).await {
                self.report_presence_unavailable(error.to_string());
            }
        }

        let _ = self.events.send(VoiceEvent::MuteChanged { is_muted });
        Some(is_muted)
    }

    /// Sets the identity published on the presence topic. While connected, a
    /// change replaces the presence subscription.
    pub async fn set_user(&self, user: Option<AuthenticatedUser>) {
        let _lifecycle = self.lifecycle.lock().await;
        let connected = {
            let mut state = self.inner.lock().await;
            if state.user == user {
                return;
            }
            state.user = user;
            state.connection.is_connected()
        };

        if connected {
            self.close_presence().await;
            self.open_presence().await;
        }
    }

    /// Disconnects and refuses any later `connect`.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
        self.inner.lock().await.closed = true;
    }

    fn snapshot_of(&self, state: &VoiceSessionState) -> Option<VoiceSessionSnapshot> {
        state.connected_at.map(|connected_at| VoiceSessionSnapshot {
            channel_id: self.channel_id.clone(),
            topic: self.topic.clone(),
            connected_at,
        })
    }

    async fn teardown(&self) {
        let (stream, was_connected) = {
            let mut state = self.inner.lock().await;
            let was_connected = state.connection.is_connected();
            state.connection = ConnectionState::Disconnected;
            state.connected_at = None;
            (state.local_stream.take(), was_connected)
        };
        if let Some(stream) = stream {
            stream.stop_all();
        }
        self.close_presence().await;

        if was_connected {
            info!(channel_id = %self.channel_id, "voice: disconnected");
            let _ = self.events.send(VoiceEvent::ConnectionStateChanged(None));
        }
    }

    async fn open_presence(&self) {
        let (user, is_muted) = {
            let state = self.inner.lock().await;
            if !state.connection.is_connected() || state.presence.is_some() {
                return;
            }
            let Some(user) = state.user.clone() else {
                debug!(channel_id = %self.channel_id, "voice: presence waits for an authenticated user");
                return;
            };
            (user, state.is_muted())
        };

        let generation = self.reset_roster().await;
        let channel = match self
            .presence_connector
            .subscribe(PresenceChannelOptions {
                topic: self.topic.clone(),
                presence_key: user.user_id.to_string(),
            })
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                self.report_presence_unavailable(error.to_string());
                return;
            }
        };

        let event_task = self.spawn_presence_task(channel.subscribe_events(), generation);
        if let Err(error) = channel.track(presence_payload(&user, is_muted)).await {
            self.report_presence_unavailable(error.to_string());
        }
        info!(
            channel_id = %self.channel_id,
            topic = %channel.topic(),
            user_id = %user.user_id,
            "voice: presence subscribed"
        );

        self.inner.lock().await.presence = Some(ActivePresence {
            channel,
            event_task,
        });
    }

    async fn close_presence(&self) {
        let had_roster = {
            let mut roster = self.roster.write().await;
            roster.generation += 1;
            !std::mem::take(&mut roster.participants).is_empty()
        };

        let active = self.inner.lock().await.presence.take();
        if let Some(active) = active {
            active.event_task.abort();
            release_presence(active.channel).await;
        }

        if had_roster {
            let _ = self.events.send(VoiceEvent::ParticipantsUpdated {
                channel_id: self.channel_id.clone(),
                participants: Vec::new(),
            });
        }
    }

    async fn reset_roster(&self) -> u64 {
        let mut roster = self.roster.write().await;
        roster.generation += 1;
        roster.participants.clear();
        roster.generation
    }

    fn report_presence_unavailable(&self, detail: String) {
        warn!(topic = %self.topic, error = %detail, "voice: presence topic unavailable");
        let error = VoiceSessionError::PresenceUnavailable(detail);
        let _ = self.events.send(VoiceEvent::Error(error.notice()));
    }

    fn spawn_presence_task(
        &self,
        mut presence_events: broadcast::Receiver<PresenceEvent>,
        generation: u64,
    ) -> JoinHandle<()> {
        let roster = Arc::clone(&self.roster);
        let events = self.events.clone();
        let channel_id = self.channel_id.clone();
        let topic = self.topic.clone();

        tokio::spawn(async move {
            loop {
                match presence_events.recv().await {
                    Ok(PresenceEvent::Sync(state)) => {
                        let participants = participants_from_presence(&state);
                        {
                            let mut roster = roster.write().await;
                            if roster.generation != generation {
                                return;
                            }
                            roster.participants = participants.clone();
                        }
                        debug!(%channel_id, count = participants.len(), "voice: roster synced");
                        let _ = events.send(VoiceEvent::ParticipantsUpdated {
                            channel_id: channel_id.clone(),
                            participants,
                        });
                    }
                    Ok(PresenceEvent::Join(diff)) => {
                        info!(%channel_id, key = %diff.key, entries = diff.presences.len(), "voice: participant joined");
                    }
                    Ok(PresenceEvent::Leave(diff)) => {
                        info!(%channel_id, key = %diff.key, entries = diff.presences.len(), "voice: participant left");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%channel_id, skipped, "voice: presence events lagged, waiting for next sync");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let current = {
                            let mut roster = roster.write().await;
                            if roster.generation == generation {
                                roster.participants.clear();
                                true
                            } else {
                                false
                            }
                        };
                        if current {
                            warn!(%channel_id, %topic, "voice: presence stream closed");
                            let _ = events.send(VoiceEvent::ParticipantsUpdated {
                                channel_id: channel_id.clone(),
                                participants: Vec::new(),
                            });
                            let error = VoiceSessionError::PresenceUnavailable(format!(
                                "presence stream for {topic} closed"
                            ));
                            let _ = events.send(VoiceEvent::Error(error.notice()));
                        }
                        return;
                    }
                }
            }
        })
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        let state = self.inner.get_mut();
        if let Some(stream) = state.local_stream.take() {
            stream.stop_all();
        }
        if let Some(active) = state.presence.take() {
            active.event_task.abort();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(release_presence(active.channel));
            }
        }
    }
}

/// Removes this client's entry from the topic, then leaves it.
async fn release_presence(channel: Arc<dyn PresenceChannel>) {
    if let Err(error) = channel.untrack().await {
        warn!(topic = %channel.topic(), %error, "voice: presence untrack failed");
    }
    if let Err(error) = channel.unsubscribe().await {
        warn!(topic = %channel.topic(), %error, "voice: presence unsubscribe failed");
    }
    debug!(topic = %channel.topic(), "voice: presence unsubscribed");
}

fn presence_payload(user: &AuthenticatedUser, is_muted: bool) -> PresencePayload {
    PresencePayload {
        user_id: user.user_id.clone(),
        user_name: user.user_name.clone(),
        is_muted,
    }
}

#[async_trait]
impl VoiceSessionHandle for VoiceSession {
    async fn connect(&self) -> Result<()> {
        VoiceSession::connect(self).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        VoiceSession::disconnect(self).await;
        Ok(())
    }

    async fn toggle_mute(&self) -> Result<Option<bool>> {
        Ok(VoiceSession::toggle_mute(self).await)
    }

    async fn set_user(&self, user: Option<AuthenticatedUser>) -> Result<()> {
        VoiceSession::set_user(self, user).await;
        Ok(())
    }

    async fn connection_state(&self) -> ConnectionState {
        VoiceSession::connection_state(self).await
    }

    async fn participants(&self) -> Vec<VoiceParticipant> {
        VoiceSession::participants(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        VoiceSession::subscribe_events(self)
    }
}
