//! Embedded generation-metadata codec.
//!
//! Reads generation parameters out of PNG text chunks and JPEG Exif
//! UserComments, and writes them back as a PNG `parameters` chunk. The
//! container is recognized by magic bytes; file extensions are ignored.
//!
//! Sources are tried in order of how explicit they are: an A1111
//! `parameters` chunk, a ComfyUI graph (`prompt`, then `workflow`), NovelAI
//! info, any other chunk holding parameter text, and finally the NovelAI
//! alpha-channel payload.

mod comfy;
mod encoding;
mod fields;
mod jpeg;
mod novelai;
mod parameters;
mod png;

pub use encoding::TextEncoding;
pub use fields::{canonical_key, is_recognized, ParsedFields, NEGATIVE_PROMPT, PROMPT, VOCABULARY};
pub use parameters::{format as format_parameters, looks_like_parameters, parse as parse_parameters};
pub use png::{TextChunk, TextChunkKind};

use crate::config::CodecConfig;
use crate::error::{AtelierError, Result};
use crate::persist::atomic_write_bytes;
use image::ImageFormat;
use serde::Serialize;
use serde_json::Value;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Image container, recognized by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Png,
    Jpeg,
}

impl Container {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if png::has_signature(bytes) {
            Some(Container::Png)
        } else if jpeg::has_signature(bytes) {
            Some(Container::Jpeg)
        } else {
            None
        }
    }
}

/// Tool that produced the embedded metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    A1111,
    ComfyUi,
    NovelAi,
    Unknown,
}

/// Metadata read from one image.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddedMetadataRecord {
    pub container: Container,
    /// Encoding of the text the fields were parsed from
    pub encoding_used: Option<TextEncoding>,
    pub raw_text: String,
    pub parsed_fields: ParsedFields,
    pub source: MetadataSource,
    /// Decoding fell back to replacing undecodable bytes
    pub low_confidence: bool,
    /// Every text entry found, in container order
    pub chunks: Vec<TextChunk>,
}

impl EmbeddedMetadataRecord {
    fn empty(container: Container) -> Self {
        Self {
            container,
            encoding_used: None,
            raw_text: String::new(),
            parsed_fields: ParsedFields::new(),
            source: MetadataSource::Unknown,
            low_confidence: false,
            chunks: Vec::new(),
        }
    }

    fn from_chunk(
        container: Container,
        chunk: &TextChunk,
        source: MetadataSource,
        parsed_fields: ParsedFields,
    ) -> Self {
        Self {
            container,
            encoding_used: Some(chunk.encoding),
            raw_text: chunk.text.clone(),
            parsed_fields,
            source,
            low_confidence: chunk.encoding == TextEncoding::Lossy,
            chunks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parsed_fields.is_empty()
    }
}

/// Reads and writes embedded generation metadata.
///
/// All methods do blocking file I/O; call them from `spawn_blocking` in
/// async contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataCodec;

impl MetadataCodec {
    pub fn new() -> Self {
        Self
    }

    /// Read the embedded metadata of the image at `path`.
    pub fn read(&self, path: &Path) -> Result<EmbeddedMetadataRecord> {
        let bytes = std::fs::read(path).map_err(|e| AtelierError::io_with_path(e, path))?;
        let container = Container::sniff(&bytes)
            .ok_or_else(|| AtelierError::UnsupportedContainer(path.to_path_buf()))?;
        let record = self.read_bytes(container, &bytes)?;
        debug!(
            "Read {:?} metadata from {} ({} fields, source {:?})",
            record.container,
            path.display(),
            record.parsed_fields.len(),
            record.source
        );
        Ok(record)
    }

    /// Read metadata from an in-memory image of a known container.
    pub fn read_bytes(&self, container: Container, bytes: &[u8]) -> Result<EmbeddedMetadataRecord> {
        match container {
            Container::Png => read_png(bytes),
            Container::Jpeg => Ok(read_jpeg(bytes)),
        }
    }

    /// Write `fields` into the image at `path` and return the written file.
    ///
    /// The fields are laid over whatever the image already carries; an
    /// empty value removes a key. PNG sources are replaced atomically. A
    /// JPEG source is converted and written beside it as `<stem>.png`
    /// (`<stem>_<n>.png` if that name is taken); the JPEG is left alone.
    pub fn write(&self, path: &Path, fields: &ParsedFields) -> Result<PathBuf> {
        let bytes = std::fs::read(path).map_err(|e| AtelierError::io_with_path(e, path))?;
        let container = Container::sniff(&bytes)
            .ok_or_else(|| AtelierError::UnsupportedContainer(path.to_path_buf()))?;

        let mut merged = self.read_bytes(container, &bytes)?.parsed_fields;
        merged.merge(fields);
        let text = parameters::format(&merged);

        let (png_bytes, output) = match container {
            Container::Png => (bytes, path.to_path_buf()),
            Container::Jpeg => (jpeg_to_png(&bytes)?, png_output_path(path)),
        };
        let rewritten =
            png::replace_text_chunk(&png_bytes, CodecConfig::PARAMETERS_KEYWORD, &text)?;
        atomic_write_bytes(&output, &rewritten)?;

        info!(
            "Wrote {} metadata fields to {}",
            merged.len(),
            output.display()
        );
        Ok(output)
    }
}

fn read_png(bytes: &[u8]) -> Result<EmbeddedMetadataRecord> {
    let chunks = png::read_text_chunks(bytes)?;
    let mut record = identify_png_source(&chunks)
        .or_else(|| read_png_stealth(bytes))
        .unwrap_or_else(|| EmbeddedMetadataRecord::empty(Container::Png));
    record.chunks = chunks;
    Ok(record)
}

fn identify_png_source(chunks: &[TextChunk]) -> Option<EmbeddedMetadataRecord> {
    let by_keyword = |keyword: &str| chunks.iter().find(|c| c.keyword == keyword);

    if let Some(chunk) = by_keyword(CodecConfig::PARAMETERS_KEYWORD) {
        return Some(EmbeddedMetadataRecord::from_chunk(
            Container::Png,
            chunk,
            MetadataSource::A1111,
            parameters::parse(&chunk.text),
        ));
    }

    for keyword in ["prompt", "workflow"] {
        let Some(chunk) = by_keyword(keyword) else {
            continue;
        };
        match serde_json::from_str::<Value>(&chunk.text) {
            Ok(graph) if comfy::is_graph(&graph) => {
                return Some(EmbeddedMetadataRecord::from_chunk(
                    Container::Png,
                    chunk,
                    MetadataSource::ComfyUi,
                    comfy::summarize(&graph),
                ));
            }
            Ok(_) => debug!("'{}' chunk is JSON but not a graph", keyword),
            Err(e) => debug!("'{}' chunk is not JSON: {}", keyword, e),
        }
    }

    if let Some((fields, raw)) = novelai::from_text_chunks(chunks) {
        let encoding = chunks
            .iter()
            .find(|c| c.text == raw)
            .map(|c| c.encoding)
            .unwrap_or(TextEncoding::Utf8);
        return Some(EmbeddedMetadataRecord {
            container: Container::Png,
            encoding_used: Some(encoding),
            raw_text: raw,
            parsed_fields: fields,
            source: MetadataSource::NovelAi,
            low_confidence: encoding == TextEncoding::Lossy,
            chunks: Vec::new(),
        });
    }

    chunks
        .iter()
        .find(|c| parameters::looks_like_parameters(&c.text))
        .map(|chunk| {
            EmbeddedMetadataRecord::from_chunk(
                Container::Png,
                chunk,
                MetadataSource::A1111,
                parameters::parse(&chunk.text),
            )
        })
}

fn read_png_stealth(bytes: &[u8]) -> Option<EmbeddedMetadataRecord> {
    let json = match novelai::read_stealth(bytes) {
        Ok(Some(json)) => json,
        Ok(None) => return None,
        Err(e) => {
            warn!("Could not read alpha-channel metadata: {}", e);
            return None;
        }
    };
    let info = match serde_json::from_str::<Value>(&json) {
        Ok(Value::Object(info)) => info,
        _ => {
            warn!("Alpha-channel metadata is not a JSON object");
            return None;
        }
    };
    let fields = novelai::from_info(&info)?;
    Some(EmbeddedMetadataRecord {
        container: Container::Png,
        encoding_used: Some(TextEncoding::Utf8),
        raw_text: json,
        parsed_fields: fields,
        source: MetadataSource::NovelAi,
        low_confidence: false,
        chunks: Vec::new(),
    })
}

fn read_jpeg(bytes: &[u8]) -> EmbeddedMetadataRecord {
    let Some(comment) = jpeg::read_user_comment(bytes) else {
        return EmbeddedMetadataRecord::empty(Container::Jpeg);
    };
    let text = comment.chunk.text.as_str();

    let json = text
        .trim_start()
        .starts_with('{')
        .then(|| serde_json::from_str::<Value>(text).ok())
        .flatten();
    let (source, fields) = match json {
        Some(graph) if comfy::is_graph(&graph) => (MetadataSource::ComfyUi, comfy::summarize(&graph)),
        Some(Value::Object(info)) => match novelai::from_info(&info) {
            Some(fields) => (MetadataSource::NovelAi, fields),
            None => (MetadataSource::Unknown, ParsedFields::new()),
        },
        _ if parameters::looks_like_parameters(text) => {
            (MetadataSource::A1111, parameters::parse(text))
        }
        _ => (MetadataSource::Unknown, parameters::parse(text)),
    };

    let mut record =
        EmbeddedMetadataRecord::from_chunk(Container::Jpeg, &comment.chunk, source, fields);
    record.low_confidence = comment.low_confidence;
    record.chunks = vec![comment.chunk];
    record
}

fn jpeg_to_png(bytes: &[u8]) -> Result<Vec<u8>> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?;
    let mut out = Vec::new();
    image.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

/// `<stem>.png` beside the source, or the first free `<stem>_<n>.png`.
fn png_output_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let dir = source.parent().unwrap_or_else(|| Path::new("."));
    let first = dir.join(format!("{}.png", stem));
    if !first.exists() {
        return first;
    }
    (2u32..)
        .map(|n| dir.join(format!("{}_{}.png", stem, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};
    use tempfile::TempDir;

    fn sample_fields() -> ParsedFields {
        ParsedFields::new()
            .with(PROMPT, "a red fox, snow")
            .with(NEGATIVE_PROMPT, "blurry")
            .with("Steps", "28")
            .with("Sampler", "DPM++ 2M")
            .with("Seed", "42")
            .with("Model", "sdxl_base")
    }

    fn jpeg_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb([200, 30, 30]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .unwrap();
        out
    }

    #[test]
    fn test_sniff() {
        assert_eq!(Container::sniff(&png::tests::tiny_png(&[])), Some(Container::Png));
        assert_eq!(Container::sniff(&jpeg_bytes()), Some(Container::Jpeg));
        assert_eq!(Container::sniff(b"GIF89a"), None);
    }

    #[test]
    fn test_unsupported_container_by_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("looks.png");
        std::fs::write(&path, b"GIF89a not really").unwrap();
        let err = MetadataCodec::new().read(&path).unwrap_err();
        assert!(matches!(err, AtelierError::UnsupportedContainer(_)));
    }

    #[test]
    fn test_png_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gen.png");
        std::fs::write(&path, png::tests::tiny_png(&[])).unwrap();

        let codec = MetadataCodec::new();
        let out = codec.write(&path, &sample_fields()).unwrap();
        assert_eq!(out, path);

        let record = codec.read(&path).unwrap();
        assert_eq!(record.source, MetadataSource::A1111);
        assert_eq!(record.parsed_fields, sample_fields());
        assert!(!record.low_confidence);
    }

    #[test]
    fn test_write_preserves_foreign_keys_and_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gen.png");
        std::fs::write(
            &path,
            png::tests::tiny_png(&[
                png::encode_text_chunk("parameters", "cat\nSteps: 20, Hires upscale: 2, Seed: 1"),
                png::encode_text_chunk("Software", "painter"),
            ]),
        )
        .unwrap();

        let codec = MetadataCodec::new();
        codec
            .write(&path, &ParsedFields::new().with("Seed", "9").with(PROMPT, "dog"))
            .unwrap();

        let record = codec.read(&path).unwrap();
        assert_eq!(record.parsed_fields.get(PROMPT), Some("dog"));
        assert_eq!(record.parsed_fields.get("Seed"), Some("9"));
        assert_eq!(record.parsed_fields.get("Hires upscale"), Some("2"));
        assert!(record
            .chunks
            .iter()
            .any(|c| c.keyword == "Software" && c.text == "painter"));
        assert_eq!(
            record.chunks.iter().filter(|c| c.keyword == "parameters").count(),
            1
        );
    }

    #[test]
    fn test_non_ascii_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gen.png");
        std::fs::write(&path, png::tests::tiny_png(&[])).unwrap();
        let fields = ParsedFields::new()
            .with(PROMPT, "夕焼けの海, café")
            .with("Steps", "12");

        let codec = MetadataCodec::new();
        codec.write(&path, &fields).unwrap();
        let record = codec.read(&path).unwrap();
        assert_eq!(record.parsed_fields, fields);
        assert_eq!(record.chunks[0].kind, TextChunkKind::InternationalText);
    }

    #[test]
    fn test_jpeg_write_produces_png() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("photo.jpg");
        let text = "a fox\nNegative prompt: blur\nSteps: 20, Seed: 5";
        let mut comment = b"ASCII\0\0\0".to_vec();
        comment.extend_from_slice(text.as_bytes());
        std::fs::write(&source, jpeg::tests::with_exif(&jpeg_bytes(), &comment, false)).unwrap();

        let codec = MetadataCodec::new();
        let before = codec.read(&source).unwrap();
        assert_eq!(before.container, Container::Jpeg);
        assert_eq!(before.source, MetadataSource::A1111);
        assert_eq!(before.parsed_fields.get("Seed"), Some("5"));

        let out = codec
            .write(&source, &ParsedFields::new().with("Sampler", "Euler"))
            .unwrap();
        assert_eq!(out, dir.path().join("photo.png"));
        assert!(source.exists());

        let after = codec.read(&out).unwrap();
        assert_eq!(after.container, Container::Png);
        assert_eq!(after.parsed_fields.get(PROMPT), Some("a fox"));
        assert_eq!(after.parsed_fields.get(NEGATIVE_PROMPT), Some("blur"));
        assert_eq!(after.parsed_fields.get("Seed"), Some("5"));
        assert_eq!(after.parsed_fields.get("Sampler"), Some("Euler"));

        // a second conversion never clobbers the first
        let again = codec.write(&source, &ParsedFields::new()).unwrap();
        assert_eq!(again, dir.path().join("photo_2.png"));
    }

    #[test]
    fn test_comfy_png() {
        let graph = serde_json::json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 10, "positive": ["6", 0]}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "harbor"}}
        })
        .to_string();
        let bytes = png::tests::tiny_png(&[png::tests::ztxt("prompt", &graph)]);
        let record = MetadataCodec::new().read_bytes(Container::Png, &bytes).unwrap();
        assert_eq!(record.source, MetadataSource::ComfyUi);
        assert_eq!(record.raw_text, graph);
        assert_eq!(record.parsed_fields.get(PROMPT), Some("harbor"));
        assert_eq!(record.parsed_fields.get("Steps"), Some("10"));
    }

    #[test]
    fn test_stealth_png_when_no_text() {
        let payload = serde_json::json!({
            "Comment": serde_json::json!({"prompt": "moon", "uc": "", "steps": 9}).to_string()
        })
        .to_string();
        let bytes = novelai::tests::stealth_png(&payload, 32);
        let record = MetadataCodec::new().read_bytes(Container::Png, &bytes).unwrap();
        assert_eq!(record.source, MetadataSource::NovelAi);
        assert_eq!(record.parsed_fields.get(PROMPT), Some("moon"));
        assert_eq!(record.parsed_fields.get("Steps"), Some("9"));
    }

    #[test]
    fn test_plain_png_is_unknown() {
        let bytes = png::tests::tiny_png(&[png::encode_text_chunk("Title", "holiday")]);
        let record = MetadataCodec::new().read_bytes(Container::Png, &bytes).unwrap();
        assert_eq!(record.source, MetadataSource::Unknown);
        assert!(record.is_empty());
        assert_eq!(record.chunks.len(), 1);
    }
}
