//! Cache entry types.

use crate::registry::RemoteMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-text notes plus attached files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notes {
    /// Markdown text; persisted in `notes.md`, not in `entry.json`.
    #[serde(skip)]
    pub text: String,
    /// Paths relative to the entry folder, e.g. `attachments/recipe.txt`.
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Everything the library knows about one logical asset, keyed by its
/// SHA256.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_metadata: Option<RemoteMetadata>,
    /// Thumbnail file name relative to the entry folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Example media relative to the entry folder, in attach order.
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub notes: Notes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A fresh entry with no fields set.
    pub fn empty(hash: &str) -> Self {
        Self {
            hash: hash.to_string(),
            remote_metadata: None,
            thumbnail: None,
            examples: Vec::new(),
            notes: Notes::default(),
            last_verified: None,
            created_at: Utc::now(),
        }
    }

    /// Whether no field beyond the key has ever been set.
    pub fn is_blank(&self) -> bool {
        self.remote_metadata.is_none()
            && self.thumbnail.is_none()
            && self.examples.is_empty()
            && self.notes.text.is_empty()
            && self.notes.attachments.is_empty()
            && self.last_verified.is_none()
    }

    /// Merge `update` field by field. Unset fields are left untouched; list
    /// fields append without duplicates.
    pub fn apply(&mut self, update: CacheEntryUpdate) {
        if let Some(metadata) = update.remote_metadata {
            self.remote_metadata = Some(metadata);
        }
        if let Some(thumbnail) = update.thumbnail {
            self.thumbnail = Some(thumbnail);
        }
        if let Some(examples) = update.examples {
            append_unique(&mut self.examples, examples);
        }
        if let Some(text) = update.notes_text {
            self.notes.text = text;
        }
        if let Some(attachments) = update.attachments {
            append_unique(&mut self.notes.attachments, attachments);
        }
        if let Some(verified) = update.last_verified {
            self.last_verified = Some(verified);
        }
    }
}

fn append_unique(list: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

/// A partial update to a [`CacheEntry`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntryUpdate {
    pub remote_metadata: Option<RemoteMetadata>,
    pub thumbnail: Option<String>,
    pub examples: Option<Vec<String>>,
    pub notes_text: Option<String>,
    pub attachments: Option<Vec<String>>,
    pub last_verified: Option<DateTime<Utc>>,
}

impl CacheEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_metadata(mut self, metadata: RemoteMetadata) -> Self {
        self.remote_metadata = Some(metadata);
        self
    }

    pub fn thumbnail(mut self, name: impl Into<String>) -> Self {
        self.thumbnail = Some(name.into());
        self
    }

    pub fn example(mut self, reference: impl Into<String>) -> Self {
        self.examples
            .get_or_insert_with(Vec::new)
            .push(reference.into());
        self
    }

    pub fn notes_text(mut self, text: impl Into<String>) -> Self {
        self.notes_text = Some(text.into());
        self
    }

    pub fn attachment(mut self, reference: impl Into<String>) -> Self {
        self.attachments
            .get_or_insert_with(Vec::new)
            .push(reference.into());
        self
    }

    /// Stamp the entry as verified now.
    pub fn verified_now(mut self) -> Self {
        self.last_verified = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Provider;

    #[test]
    fn test_apply_keeps_untouched_fields() {
        let mut entry = CacheEntry::empty("ab");
        entry.apply(CacheEntryUpdate::new().notes_text("my notes"));
        entry.apply(CacheEntryUpdate::new().remote_metadata(RemoteMetadata::new(Provider::Civitai)));

        assert_eq!(entry.notes.text, "my notes");
        assert!(entry.remote_metadata.is_some());
    }

    #[test]
    fn test_examples_append_without_duplicates() {
        let mut entry = CacheEntry::empty("ab");
        entry.apply(CacheEntryUpdate::new().example("examples/a.png"));
        entry.apply(
            CacheEntryUpdate::new()
                .example("examples/a.png")
                .example("examples/b.png"),
        );
        assert_eq!(entry.examples, vec!["examples/a.png", "examples/b.png"]);
    }

    #[test]
    fn test_is_blank() {
        let mut entry = CacheEntry::empty("ab");
        assert!(entry.is_blank());
        entry.apply(CacheEntryUpdate::new().verified_now());
        assert!(!entry.is_blank());
    }

    #[test]
    fn test_notes_text_not_serialized() {
        let mut entry = CacheEntry::empty("ab");
        entry.notes.text = "secret recipe".into();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("secret recipe"));
    }
}
