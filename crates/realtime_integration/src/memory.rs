//! In-process stand-ins for the managed presence service and the capture
//! device. Every handle subscribed to the same topic on one hub sees the same
//! membership, so several sessions in one process behave like several clients.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use shared::protocol::{PresenceDiff, PresenceMeta, PresencePayload, PresenceState};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::{
    media::{AudioConstraints, AudioTrack, LocalAudioStream, MediaDevices, MediaError},
    PresenceChannel, PresenceChannelOptions, PresenceConnector, PresenceEvent,
};

const DEFAULT_TOPIC_CAPACITY: usize = 256;

struct TopicState {
    members: Mutex<PresenceState>,
    events: broadcast::Sender<PresenceEvent>,
}

pub struct InMemoryPresenceHub {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    capacity: usize,
    reject_subscriptions: AtomicBool,
}

impl InMemoryPresenceHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            reject_subscriptions: AtomicBool::new(false),
        })
    }

    /// Makes every later `subscribe` fail, as if the service were unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.reject_subscriptions.store(unreachable, Ordering::SeqCst);
    }

    pub async fn presence_state(&self, topic: &str) -> PresenceState {
        let topic = self.topics.lock().await.get(topic).cloned();
        match topic {
            Some(topic) => topic.members.lock().await.clone(),
            None => PresenceState::default(),
        }
    }

    /// Forgets the topic's membership and closes the event stream of every
    /// handle subscribed to it.
    pub async fn drop_topic(&self, topic: &str) {
        self.topics.lock().await.remove(topic);
    }

    async fn topic(&self, name: &str) -> Arc<TopicState> {
        let mut topics = self.topics.lock().await;
        Arc::clone(topics.entry(name.to_string()).or_insert_with(|| {
            Arc::new(TopicState {
                members: Mutex::new(PresenceState::default()),
                events: broadcast::channel(self.capacity).0,
            })
        }))
    }
}

#[async_trait]
impl PresenceConnector for InMemoryPresenceHub {
    async fn subscribe(
        &self,
        options: PresenceChannelOptions,
    ) -> anyhow::Result<Arc<dyn PresenceChannel>> {
        if self.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(anyhow!("presence topic {} is unreachable", options.topic));
        }

        let topic = self.topic(&options.topic).await;
        Ok(Arc::new(InMemoryPresenceChannel {
            topic_name: options.topic,
            presence_key: options.presence_key,
            presence_ref: Uuid::new_v4().to_string(),
            topic: Arc::downgrade(&topic),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryPresenceChannel {
    topic_name: String,
    presence_key: String,
    presence_ref: String,
    topic: Weak<TopicState>,
    closed: AtomicBool,
}

impl InMemoryPresenceChannel {
    fn live_topic(&self) -> anyhow::Result<Arc<TopicState>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("presence channel {} is closed", self.topic_name));
        }
        self.topic
            .upgrade()
            .ok_or_else(|| anyhow!("presence topic {} is gone", self.topic_name))
    }
}

#[async_trait]
impl PresenceChannel for InMemoryPresenceChannel {
    fn topic(&self) -> &str {
        &self.topic_name
    }

    async fn track(&self, payload: PresencePayload) -> anyhow::Result<()> {
        let topic = self.live_topic()?;

        let meta = PresenceMeta {
            presence_ref: self.presence_ref.clone(),
            payload,
        };
        let snapshot = {
            let mut members = topic.members.lock().await;
            let entries = members.0.entry(self.presence_key.clone()).or_default();
            match entries
                .iter_mut()
                .find(|existing| existing.presence_ref == self.presence_ref)
            {
                Some(existing) => *existing = meta.clone(),
                None => entries.push(meta.clone()),
            }
            members.clone()
        };

        debug!(topic = %self.topic_name, key = %self.presence_key, "presence: tracked");
        let _ = topic.events.send(PresenceEvent::Join(PresenceDiff {
            key: self.presence_key.clone(),
            presences: vec![meta],
        }));
        let _ = topic.events.send(PresenceEvent::Sync(snapshot));
        Ok(())
    }

    async fn untrack(&self) -> anyhow::Result<()> {
        let Some(topic) = self.topic.upgrade() else {
            return Ok(());
        };
        let (removed, snapshot) = {
            let mut members = topic.members.lock().await;
            let mut removed = Vec::new();
            if let Some(entries) = members.0.get_mut(&self.presence_key) {
                entries.retain(|meta| {
                    if meta.presence_ref == self.presence_ref {
                        removed.push(meta.clone());
                        false
                    } else {
                        true
                    }
                });
                if entries.is_empty() {
                    members.0.remove(&self.presence_key);
                }
            }
            (removed, members.clone())
        };

        if removed.is_empty() {
            return Ok(());
        }

        debug!(topic = %self.topic_name, key = %self.presence_key, "presence: untracked");
        let _ = topic.events.send(PresenceEvent::Leave(PresenceDiff {
            key: self.presence_key.clone(),
            presences: removed,
        }));
        let _ = topic.events.send(PresenceEvent::Sync(snapshot));
        Ok(())
    }

    async fn unsubscribe(&self) -> anyhow::Result<()> {
        self.untrack().await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        match self.topic.upgrade() {
            Some(topic) => topic.events.subscribe(),
            // Sender dropped right away, so the receiver reports `Closed`.
            None => broadcast::channel(1).1,
        }
    }
}

#[derive(Debug)]
pub struct SimulatedAudioTrack {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SimulatedAudioTrack {
    fn new() -> Self {
        Self {
            id: format!("mic-{}", Uuid::new_v4()),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl AudioTrack for SimulatedAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Microphone stand-in that either always grants or always refuses access.
pub struct SimulatedAudioDevices {
    refusal: Option<MediaError>,
    requests: Mutex<Vec<AudioConstraints>>,
    issued: Mutex<Vec<Arc<SimulatedAudioTrack>>>,
}

impl SimulatedAudioDevices {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            refusal: None,
            requests: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
        })
    }

    pub fn denying(error: MediaError) -> Arc<Self> {
        Arc::new(Self {
            refusal: Some(error),
            requests: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
        })
    }

    pub async fn requests(&self) -> Vec<AudioConstraints> {
        self.requests.lock().await.clone()
    }

    pub async fn issued_tracks(&self) -> Vec<Arc<SimulatedAudioTrack>> {
        self.issued.lock().await.clone()
    }
}

#[async_trait]
impl MediaDevices for SimulatedAudioDevices {
    async fn get_user_audio(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalAudioStream, MediaError> {
        self.requests.lock().await.push(constraints);
        if let Some(refusal) = &self.refusal {
            return Err(refusal.clone());
        }

        let track = Arc::new(SimulatedAudioTrack::new());
        self.issued.lock().await.push(Arc::clone(&track));
        let handle: Arc<dyn AudioTrack> = track;
        Ok(LocalAudioStream::new(vec![handle]))
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
