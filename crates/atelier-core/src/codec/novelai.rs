//! NovelAI generation info.
//!
//! NovelAI stores a JSON object in the `Comment` text chunk (prompt in
//! `prompt`, negative in `uc`, CFG in `scale`). Images stripped of text
//! chunks may still carry the same info hidden in the alpha channel's least
//! significant bits: a `stealth_pngcomp` marker, a 32-bit big-endian payload
//! length in bits, then a gzip-compressed JSON object, read column by column.

use super::fields::{ParsedFields, NEGATIVE_PROMPT, PROMPT};
use super::png::TextChunk;
use crate::config::CodecConfig;
use crate::error::{AtelierError, Result};
use flate2::read::GzDecoder;
use image::{GenericImageView, ImageFormat};
use serde_json::{Map, Value};
use std::io::Read;

/// Info keys that may carry the generation JSON.
const INFO_KEYS: &[&str] = &["Comment", "Description", "Software"];

/// Keys that must appear for a JSON object to count as NovelAI info.
const MARKER_KEYS: &[&str] = &["n_samples", "uc", "steps"];

const MAPPED: &[(&str, &str)] = &[
    ("prompt", PROMPT),
    ("uc", NEGATIVE_PROMPT),
    ("steps", "Steps"),
    ("sampler", "Sampler"),
    ("scale", "CFG scale"),
    ("seed", "Seed"),
];

const NOT_COPIED: &[&str] = &[
    "prompt",
    "uc",
    "steps",
    "sampler",
    "scale",
    "seed",
    "Comment",
    "Description",
    "Source",
    "Software",
];

/// NovelAI fields from decoded text chunks, with the JSON they came from.
pub(crate) fn from_text_chunks(chunks: &[TextChunk]) -> Option<(ParsedFields, String)> {
    let mut info = Map::new();
    for chunk in chunks {
        if INFO_KEYS.contains(&chunk.keyword.as_str()) {
            info.insert(chunk.keyword.clone(), Value::String(chunk.text.clone()));
        }
    }
    let fields = from_info(&info)?;
    let raw = INFO_KEYS
        .iter()
        .filter_map(|k| info.get(*k).and_then(Value::as_str))
        .find(|t| t.trim_start().starts_with('{'))
        .unwrap_or_default()
        .to_string();
    Some((fields, raw))
}

/// NovelAI fields from an info object (text chunks, or a stealth payload).
pub(crate) fn from_info(info: &Map<String, Value>) -> Option<ParsedFields> {
    let mut params = Map::new();
    for key in INFO_KEYS {
        match info.get(*key) {
            Some(Value::String(text)) if text.trim_start().starts_with('{') => {
                if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
                    params.extend(obj);
                }
            }
            Some(Value::Object(obj)) => params.extend(obj.clone()),
            _ => {}
        }
    }
    for (key, value) in info {
        if !INFO_KEYS.contains(&key.as_str()) {
            params.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    if !MARKER_KEYS.iter().any(|k| params.contains_key(*k)) {
        return None;
    }

    let mut fields = ParsedFields::new();
    for (source, target) in MAPPED {
        if let Some(value) = params.get(*source).and_then(render) {
            fields.insert(target, value);
        }
    }
    // Description holds the plain prompt when the JSON omits it.
    if fields.get(PROMPT).is_none() {
        if let Some(text) = info
            .get("Description")
            .and_then(Value::as_str)
            .filter(|t| !t.trim_start().starts_with('{') && !t.trim().is_empty())
        {
            fields.insert(PROMPT, text.trim());
        }
    }
    for (key, value) in &params {
        if NOT_COPIED.contains(&key.as_str()) {
            continue;
        }
        if let Some(value) = render(value) {
            fields.insert(key, value);
        }
    }
    Some(fields)
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Extract the alpha-channel payload of a PNG, as JSON text.
///
/// `Ok(None)` when the image has no alpha channel or no marker.
pub(crate) fn read_stealth(bytes: &[u8]) -> Result<Option<String>> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
    if !image.color().has_alpha() {
        return Ok(None);
    }

    let (width, height) = image.dimensions();
    let magic = CodecConfig::STEALTH_MAGIC.as_bytes();
    let header_bits = (magic.len() + 4) * 8;
    if (width as usize) * (height as usize) < header_bits {
        return Ok(None);
    }

    let mut bits = (0..width)
        .flat_map(|x| (0..height).map(move |y| (x, y)))
        .map(|(x, y)| image.get_pixel(x, y)[3] & 1);
    let mut read_bytes = |count: usize| -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let mut byte = 0u8;
            for _ in 0..8 {
                byte = (byte << 1) | bits.next()?;
            }
            out.push(byte);
        }
        Some(out)
    };

    match read_bytes(magic.len()) {
        Some(found) if found == magic => {}
        _ => return Ok(None),
    }
    let length_bits = read_bytes(4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| AtelierError::malformed("stealth", "truncated length"))?;
    if length_bits % 8 != 0 || length_bits / 8 > CodecConfig::MAX_INFLATED_TEXT as usize {
        return Err(AtelierError::malformed(
            "stealth",
            format!("implausible payload length {} bits", length_bits),
        ));
    }
    let compressed = read_bytes(length_bits / 8)
        .ok_or_else(|| AtelierError::malformed("stealth", "payload runs past the image"))?;

    let mut json = String::new();
    GzDecoder::new(compressed.as_slice())
        .take(CodecConfig::MAX_INFLATED_TEXT)
        .read_to_string(&mut json)
        .map_err(|e| AtelierError::malformed("stealth", format!("gunzip failed: {}", e)))?;
    Ok(Some(json))
}
