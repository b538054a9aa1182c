//! PNG chunk walking and text chunk encoding.
//!
//! Only the chunk framing is handled here; pixel data is never decoded on
//! this path. Chunks other than the replaced `parameters` text are copied
//! byte-for-byte on rewrite.

use super::encoding::{decode_png_latin1, decode_png_utf8, latin1, TextEncoding};
use crate::config::CodecConfig;
use crate::error::{AtelierError, Result};
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::ops::Range;
use tracing::{debug, warn};

pub(crate) const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

const CONTAINER: &str = "PNG";

/// Where a piece of embedded text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextChunkKind {
    #[serde(rename = "tEXt")]
    Text,
    #[serde(rename = "zTXt")]
    CompressedText,
    #[serde(rename = "iTXt")]
    InternationalText,
    /// Exif UserComment of a JPEG
    #[serde(rename = "exif_user_comment")]
    ExifUserComment,
}

/// One decoded text entry, in container order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub keyword: String,
    pub text: String,
    pub kind: TextChunkKind,
    pub encoding: TextEncoding,
}

/// A chunk's type and payload, plus its full byte range in the file.
#[derive(Debug, Clone)]
pub(crate) struct RawChunk<'a> {
    pub kind: [u8; 4],
    pub data: &'a [u8],
    pub span: Range<usize>,
}

impl RawChunk<'_> {
    fn is(&self, kind: &[u8; 4]) -> bool {
        &self.kind == kind
    }
}

pub(crate) fn has_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(&SIGNATURE)
}

/// Walk the chunk list up to and including `IEND`.
pub(crate) fn chunks(bytes: &[u8]) -> Result<Vec<RawChunk<'_>>> {
    if !has_signature(bytes) {
        return Err(AtelierError::malformed(CONTAINER, "missing signature"));
    }

    let mut out = Vec::new();
    let mut pos = SIGNATURE.len();
    while pos < bytes.len() {
        let header = bytes
            .get(pos..pos + 8)
            .ok_or_else(|| AtelierError::malformed(CONTAINER, "truncated chunk header"))?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = [header[4], header[5], header[6], header[7]];
        let data_start = pos + 8;
        let end = data_start
            .checked_add(length)
            .and_then(|e| e.checked_add(4))
            .filter(|e| *e <= bytes.len())
            .ok_or_else(|| {
                AtelierError::malformed(
                    CONTAINER,
                    format!("chunk {} runs past end of file", String::from_utf8_lossy(&kind)),
                )
            })?;

        let data = &bytes[data_start..data_start + length];
        let stored_crc = u32::from_be_bytes([
            bytes[end - 4],
            bytes[end - 3],
            bytes[end - 2],
            bytes[end - 1],
        ]);
        if stored_crc != chunk_crc(&kind, data) {
            debug!("CRC mismatch in {} chunk at offset {}", String::from_utf8_lossy(&kind), pos);
        }

        out.push(RawChunk {
            kind,
            data,
            span: pos..end,
        });
        pos = end;
        if &kind == b"IEND" {
            break;
        }
    }
    Ok(out)
}

/// Decode every text chunk in order. Malformed text chunks are skipped.
pub(crate) fn read_text_chunks(bytes: &[u8]) -> Result<Vec<TextChunk>> {
    let mut texts = Vec::new();
    for chunk in chunks(bytes)? {
        let decoded = match &chunk.kind {
            b"tEXt" => decode_text(chunk.data),
            b"zTXt" => decode_compressed_text(chunk.data),
            b"iTXt" => decode_international_text(chunk.data),
            _ => continue,
        };
        match decoded {
            Ok(text) => texts.push(text),
            Err(e) => warn!("Skipping unreadable {} chunk: {}", String::from_utf8_lossy(&chunk.kind), e),
        }
    }
    Ok(texts)
}

fn split_keyword(data: &[u8]) -> Result<(String, &[u8])> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| AtelierError::malformed(CONTAINER, "text chunk without keyword terminator"))?;
    Ok((latin1(&data[..nul]), &data[nul + 1..]))
}

fn decode_text(data: &[u8]) -> Result<TextChunk> {
    let (keyword, body) = split_keyword(data)?;
    let decoded = decode_png_latin1(body);
    Ok(TextChunk {
        keyword,
        text: decoded.text,
        kind: TextChunkKind::Text,
        encoding: decoded.encoding,
    })
}

fn decode_compressed_text(data: &[u8]) -> Result<TextChunk> {
    let (keyword, body) = split_keyword(data)?;
    let (&method, compressed) = body
        .split_first()
        .ok_or_else(|| AtelierError::malformed(CONTAINER, "zTXt without compression method"))?;
    if method != 0 {
        return Err(AtelierError::malformed(
            CONTAINER,
            format!("unknown zTXt compression method {}", method),
        ));
    }
    let decoded = decode_png_latin1(&inflate(compressed)?);
    Ok(TextChunk {
        keyword,
        text: decoded.text,
        kind: TextChunkKind::CompressedText,
        encoding: decoded.encoding,
    })
}

fn decode_international_text(data: &[u8]) -> Result<TextChunk> {
    let (keyword, body) = split_keyword(data)?;
    let [flag, method, rest @ ..] = body else {
        return Err(AtelierError::malformed(CONTAINER, "truncated iTXt header"));
    };
    // language tag, then translated keyword, each NUL-terminated
    let mut rest: &[u8] = rest;
    for field in ["language tag", "translated keyword"] {
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            AtelierError::malformed(CONTAINER, format!("iTXt {} not terminated", field))
        })?;
        rest = &rest[nul + 1..];
    }

    let decoded = match (*flag, *method) {
        (0, _) => decode_png_utf8(rest),
        (1, 0) => decode_png_utf8(&inflate(rest)?),
        _ => {
            return Err(AtelierError::malformed(
                CONTAINER,
                format!("unknown iTXt compression {}/{}", flag, method),
            ))
        }
    };
    Ok(TextChunk {
        keyword,
        text: decoded.text,
        kind: TextChunkKind::InternationalText,
        encoding: decoded.encoding,
    })
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(compressed)
        .take(CodecConfig::MAX_INFLATED_TEXT)
        .read_to_end(&mut out)
        .map_err(|e| AtelierError::malformed(CONTAINER, format!("inflate failed: {}", e)))?;
    Ok(out)
}

fn chunk_crc(kind: &[u8; 4], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    hasher.finalize()
}

fn frame(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&chunk_crc(kind, data).to_be_bytes());
    out
}

/// Encode a text chunk: `tEXt` for plain ASCII, uncompressed `iTXt`
/// otherwise.
pub(crate) fn encode_text_chunk(keyword: &str, text: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(keyword.len() + text.len() + 5);
    data.extend_from_slice(keyword.as_bytes());
    data.push(0);
    if text.is_ascii() {
        data.extend_from_slice(text.as_bytes());
        frame(b"tEXt", &data)
    } else {
        // compression flag, method, empty language tag, empty translation
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(text.as_bytes());
        frame(b"iTXt", &data)
    }
}

fn text_keyword(chunk: &RawChunk<'_>) -> Option<String> {
    if !(chunk.is(b"tEXt") || chunk.is(b"zTXt") || chunk.is(b"iTXt")) {
        return None;
    }
    let nul = chunk.data.iter().position(|&b| b == 0)?;
    Some(latin1(&chunk.data[..nul]))
}

/// Rebuild `bytes` with every `keyword` text chunk dropped and `text`
/// inserted as a fresh chunk right before the first `IDAT`.
pub(crate) fn replace_text_chunk(bytes: &[u8], keyword: &str, text: &str) -> Result<Vec<u8>> {
    let chunks = chunks(bytes)?;
    if !chunks.iter().any(|c| c.is(b"IDAT")) {
        return Err(AtelierError::malformed(CONTAINER, "no IDAT chunk"));
    }

    let replacement = encode_text_chunk(keyword, text);
    let mut out = Vec::with_capacity(bytes.len() + replacement.len());
    out.extend_from_slice(&SIGNATURE);
    let mut inserted = false;
    for chunk in &chunks {
        if text_keyword(chunk).as_deref() == Some(keyword) {
            continue;
        }
        if !inserted && chunk.is(b"IDAT") {
            out.extend_from_slice(&replacement);
            inserted = true;
        }
        out.extend_from_slice(&bytes[chunk.span.clone()]);
    }
    Ok(out)
}
