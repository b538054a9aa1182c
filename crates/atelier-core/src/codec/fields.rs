//! Ordered generation-parameter fields.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Key of the positive prompt.
pub const PROMPT: &str = "prompt";
/// Key of the negative prompt.
pub const NEGATIVE_PROMPT: &str = "negative_prompt";

/// Keys the codec recognizes, in their canonical spelling.
pub const VOCABULARY: &[&str] = &[
    PROMPT,
    NEGATIVE_PROMPT,
    "Steps",
    "Sampler",
    "Schedule type",
    "CFG scale",
    "Seed",
    "Size",
    "Model",
    "Model hash",
    "VAE",
    "Clip skip",
    "Denoising strength",
    "Loras",
];

/// Alternative spellings seen in the wild.
const ALIASES: &[(&str, &str)] = &[
    ("negative prompt", NEGATIVE_PROMPT),
    ("positive prompt", PROMPT),
    ("cfg", "CFG scale"),
    ("scale", "CFG scale"),
    ("scheduler", "Schedule type"),
    ("sampler_name", "Sampler"),
    ("ckpt_name", "Model"),
];

/// Canonical spelling of `key` if it is in the vocabulary.
pub fn canonical_key(key: &str) -> Option<&'static str> {
    let key = key.trim();
    VOCABULARY
        .iter()
        .copied()
        .find(|k| k.eq_ignore_ascii_case(key))
        .or_else(|| {
            ALIASES
                .iter()
                .find(|(alias, _)| alias.eq_ignore_ascii_case(key))
                .map(|(_, canonical)| *canonical)
        })
}

pub fn is_recognized(key: &str) -> bool {
    canonical_key(key).is_some()
}

/// Key/value pairs in insertion order.
///
/// Recognized keys are stored in their canonical spelling; anything else is
/// kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFields {
    entries: Vec<(String, String)>,
}

impl ParsedFields {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(key: &str) -> String {
        canonical_key(key)
            .map(str::to_string)
            .unwrap_or_else(|| key.trim().to_string())
    }

    /// Set `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let key = Self::normalize(key);
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = Self::normalize(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let key = Self::normalize(key);
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Only the vocabulary keys.
    pub fn recognized(&self) -> ParsedFields {
        self.iter()
            .filter(|(k, _)| is_recognized(k))
            .collect()
    }

    /// Overlay `other` onto `self`. Values in `other` win; an empty value
    /// removes the key.
    pub fn merge(&mut self, other: &ParsedFields) {
        for (key, value) in other.iter() {
            if value.is_empty() {
                self.remove(key);
            } else {
                self.insert(key, value);
            }
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for ParsedFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = ParsedFields::new();
        for (k, v) in iter {
            fields.insert(k.as_ref(), v);
        }
        fields
    }
}

impl Serialize for ParsedFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("cfg scale"), Some("CFG scale"));
        assert_eq!(canonical_key("Negative prompt"), Some(NEGATIVE_PROMPT));
        assert_eq!(canonical_key("scheduler"), Some("Schedule type"));
        assert_eq!(canonical_key("Hires upscale"), None);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut fields = ParsedFields::new()
            .with("Steps", "20")
            .with("Hires upscale", "2")
            .with("seed", "1");
        fields.insert("STEPS", "30");

        let keys: Vec<_> = fields.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Steps", "Hires upscale", "Seed"]);
        assert_eq!(fields.get("steps"), Some("30"));
    }

    #[test]
    fn test_merge_overlays_and_removes() {
        let mut base = ParsedFields::new().with("Steps", "20").with("Custom", "x");
        base.merge(&ParsedFields::new().with("Steps", "25").with("Custom", ""));
        assert_eq!(base.get("Steps"), Some("25"));
        assert_eq!(base.get("Custom"), None);
    }

    #[test]
    fn test_serializes_in_order() {
        let fields = ParsedFields::new().with("Seed", "1").with("Steps", "2");
        assert_eq!(
            serde_json::to_string(&fields).unwrap(),
            r#"{"Seed":"1","Steps":"2"}"#
        );
    }
}
