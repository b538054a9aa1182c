//! Embedded generation metadata on AtelierApi.

use crate::codec::{EmbeddedMetadataRecord, ParsedFields};
use crate::error::{AtelierError, Result};
use crate::AtelierApi;
use std::path::{Path, PathBuf};

impl AtelierApi {
    /// Read the generation metadata embedded in `image`.
    pub async fn read_embedded(&self, image: impl AsRef<Path>) -> Result<EmbeddedMetadataRecord> {
        let codec = self.inner.codec;
        let image = image.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || codec.read(&image))
            .await
            .map_err(|e| AtelierError::Other(format!("Metadata read task failed: {}", e)))?
    }

    /// Write `fields` into `image` and return the file written.
    ///
    /// PNG images are updated in place; a JPEG is converted and saved as a
    /// PNG beside it.
    pub async fn write_embedded(
        &self,
        image: impl AsRef<Path>,
        fields: ParsedFields,
    ) -> Result<PathBuf> {
        let codec = self.inner.codec;
        let image = image.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || codec.write(&image, &fields))
            .await
            .map_err(|e| AtelierError::Other(format!("Metadata write task failed: {}", e)))?
    }
}
