//! Cache of prepared voices.

use crate::conditioning::ConditioningBundle;
use std::collections::HashMap;

/// References shorter than this still work but clone the voice poorly.
pub const RECOMMENDED_REFERENCE_SECS: f32 = 5.0;

/// Id under which the fallback voice is stored.
pub const DEFAULT_VOICE_ID: &str = "default";

/// Named conditioning bundles, so a reference is only encoded once.
///
/// The bundle registered as [`DEFAULT_VOICE_ID`] stands in for requests that arrive
/// without a usable reference recording.
#[derive(Debug, Default)]
pub struct VoiceCache {
    voices: HashMap<String, ConditioningBundle>,
}

impl VoiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a voice. Returns true if it replaced one.
    pub fn add(&mut self, id: impl Into<String>, bundle: ConditioningBundle) -> bool {
        self.voices.insert(id.into(), bundle).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&ConditioningBundle> {
        self.voices.get(id)
    }

    /// The fallback voice, if one was registered.
    pub fn default_voice(&self) -> Option<&ConditioningBundle> {
        self.get(DEFAULT_VOICE_ID)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.voices.remove(id).is_some()
    }

    /// Voice ids in sorted order.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.voices.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.voices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}
