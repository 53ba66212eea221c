use std::{fs, path::Path};

use shared::protocol::DEFAULT_VOICE_TOPIC_PREFIX;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "voice.toml";
const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSettings {
    pub topic_prefix: String,
    pub event_capacity: usize,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_VOICE_TOPIC_PREFIX.into(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Defaults, then `voice.toml` in the working directory, then `APP__VOICE_*`
/// environment variables.
pub fn load_settings() -> VoiceSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> VoiceSettings {
    let mut settings = VoiceSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        apply_file_overrides(&mut settings, &raw);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Applies `APP__VOICE_*` overrides looked up through `lookup`.
pub fn apply_env_overrides(
    settings: &mut VoiceSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("APP__VOICE_TOPIC_PREFIX") {
        set_topic_prefix(settings, &v);
    }
    if let Some(v) = lookup("APP__VOICE_EVENT_CAPACITY") {
        set_event_capacity(settings, &v);
    }
}

fn apply_file_overrides(settings: &mut VoiceSettings, raw: &str) {
    let table = match toml::from_str::<toml::Table>(raw) {
        Ok(table) => table,
        Err(error) => {
            warn!(%error, "voice: ignoring unreadable settings file");
            return;
        }
    };

    if let Some(v) = table.get("topic_prefix").and_then(toml::Value::as_str) {
        set_topic_prefix(settings, v);
    }
    match table.get("event_capacity") {
        Some(toml::Value::Integer(v)) => set_event_capacity(settings, &v.to_string()),
        Some(toml::Value::String(v)) => set_event_capacity(settings, v),
        _ => {}
    }
}

fn set_topic_prefix(settings: &mut VoiceSettings, raw: &str) {
    let prefix = raw.trim().trim_end_matches(':');
    if prefix.is_empty() {
        return;
    }
    settings.topic_prefix = prefix.to_string();
}

fn set_event_capacity(settings: &mut VoiceSettings, raw: &str) {
    match raw.trim().parse::<usize>() {
        Ok(capacity) if capacity > 0 => settings.event_capacity = capacity,
        _ => warn!(value = raw, "voice: ignoring invalid event capacity"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn file_overrides_topic_prefix_and_capacity() {
        let mut settings = VoiceSettings::default();
        apply_file_overrides(&mut settings, "topic_prefix = \"rooms\"\nevent_capacity = 64\n");
        assert_eq!(settings.topic_prefix, "rooms");
        assert_eq!(settings.event_capacity, 64);
    }

    #[test]
    fn quoted_capacity_is_accepted() {
        let mut settings = VoiceSettings::default();
        apply_file_overrides(&mut settings, "event_capacity = \"32\"");
        assert_eq!(settings.event_capacity, 32);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let mut settings = VoiceSettings::default();
        apply_file_overrides(&mut settings, "topic_prefix = \"  \"\nevent_capacity = 0\n");
        assert_eq!(settings, VoiceSettings::default());

        apply_file_overrides(&mut settings, "this is not toml");
        assert_eq!(settings, VoiceSettings::default());
    }

    #[test]
    fn trailing_separator_is_trimmed_from_prefix() {
        let mut settings = VoiceSettings::default();
        set_topic_prefix(&mut settings, "voice-room:");
        assert_eq!(settings.topic_prefix, "voice-room");
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut settings = VoiceSettings::default();
        apply_file_overrides(&mut settings, "topic_prefix = \"rooms\"\nevent_capacity = 64\n");

        apply_env_overrides(&mut settings, |key| match key {
            "APP__VOICE_TOPIC_PREFIX" => Some("huddle:".into()),
            "APP__VOICE_EVENT_CAPACITY" => Some(" 8 ".into()),
            _ => None,
        });

        assert_eq!(settings.topic_prefix, "huddle");
        assert_eq!(settings.event_capacity, 8);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = VoiceSettings::default();

        apply_env_overrides(&mut settings, |key| match key {
            "APP__VOICE_TOPIC_PREFIX" => Some(":".into()),
            "APP__VOICE_EVENT_CAPACITY" => Some("lots".into()),
            _ => None,
        });
        assert_eq!(settings, VoiceSettings::default());

        apply_env_overrides(&mut settings, |_| None);
        assert_eq!(settings, VoiceSettings::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("voice_settings_missing_{suffix}.toml"));

        let settings = load_settings_from(&path);
        if env::var("APP__VOICE_TOPIC_PREFIX").is_err() {
            assert_eq!(settings.topic_prefix, DEFAULT_VOICE_TOPIC_PREFIX);
        }
    }

    #[test]
    fn settings_file_is_read_from_disk() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("voice_settings_{suffix}.toml"));
        fs::write(&path, "event_capacity = 16\n").expect("write settings");

        let settings = load_settings_from(&path);
        if env::var("APP__VOICE_EVENT_CAPACITY").is_err() {
            assert_eq!(settings.event_capacity, 16);
        }

        fs::remove_file(path).expect("cleanup");
    }
}
