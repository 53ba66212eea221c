use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, UserId};

pub const DEFAULT_VOICE_TOPIC_PREFIX: &str = "voice";

/// Per-participant payload published on a voice presence topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: UserId,
    pub user_name: String,
    pub is_muted: bool,
}

/// One tracked entry under a presence key. A single key can carry several
/// entries when the same member is present from more than one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub presence_ref: String,
    #[serde(flatten)]
    pub payload: PresencePayload,
}

/// Full membership snapshot of a topic, keyed by presence key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceState(pub BTreeMap<String, Vec<PresenceMeta>>);

impl PresenceState {
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn metas(&self) -> impl Iterator<Item = &PresenceMeta> {
        self.0.values().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDiff {
    pub key: String,
    pub presences: Vec<PresenceMeta>,
}

pub fn topic_for_voice_channel(prefix: &str, channel_id: &ChannelId) -> String {
    format!("{prefix}:{channel_id}")
}
