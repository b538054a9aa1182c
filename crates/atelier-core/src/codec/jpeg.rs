//! Exif UserComment extraction from JPEG files.
//!
//! The comment starts with an 8-byte character code. `UNICODE\0` text is
//! UTF-16 in the TIFF header's byte order (often wrong in practice, so the
//! BOM and the byte-order heuristic still get a say); everything else runs
//! the normal detection order.

use super::encoding::{detect, detect_utf16_first, Decoded, Utf16Order};
use super::png::{TextChunk, TextChunkKind};
use std::io::Cursor;
use tracing::{debug, warn};

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

const UNICODE_PREFIX: &[u8; 8] = b"UNICODE\0";
const ASCII_PREFIX: &[u8; 8] = b"ASCII\0\0\0";
const JIS_PREFIX: &[u8; 8] = b"JIS\0\0\0\0\0";
const UNDEFINED_PREFIX: &[u8; 8] = &[0; 8];

pub(crate) const USER_COMMENT_KEYWORD: &str = "UserComment";

pub(crate) fn has_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(&JPEG_MAGIC)
}

/// The decoded UserComment plus whether decoding had to guess.
pub(crate) struct UserComment {
    pub chunk: TextChunk,
    pub low_confidence: bool,
}

/// Read the Exif UserComment, if any. Missing or unreadable Exif is not an
/// error; the image simply carries no text.
pub(crate) fn read_user_comment(bytes: &[u8]) -> Option<UserComment> {
    let mut cursor = Cursor::new(bytes);
    let exif = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return None,
        Err(e) => {
            warn!("Ignoring unreadable Exif block: {}", e);
            return None;
        }
    };

    let order = if exif.little_endian() {
        Utf16Order::Little
    } else {
        Utf16Order::Big
    };

    let raw = exif
        .fields()
        .filter(|f| f.tag == exif::Tag::UserComment)
        .find_map(|f| match &f.value {
            exif::Value::Undefined(bytes, _) => Some(bytes.clone()),
            exif::Value::Ascii(parts) => Some(parts.concat()),
            _ => None,
        })?;
    if raw.is_empty() {
        return None;
    }

    let decoded = decode_user_comment(&raw, order);
    if decoded.text.trim().is_empty() {
        debug!("Exif UserComment is blank");
        return None;
    }
    Some(UserComment {
        chunk: TextChunk {
            keyword: USER_COMMENT_KEYWORD.to_string(),
            text: decoded.text,
            kind: TextChunkKind::ExifUserComment,
            encoding: decoded.encoding,
        },
        low_confidence: decoded.low_confidence,
    })
}

fn decode_user_comment(raw: &[u8], order: Utf16Order) -> Decoded {
    if raw.len() < 8 {
        return detect(raw, Some(order));
    }
    let (prefix, body) = raw.split_at(8);
    if prefix == UNICODE_PREFIX {
        detect_utf16_first(body, Some(order))
    } else if prefix == ASCII_PREFIX || prefix == JIS_PREFIX || prefix == UNDEFINED_PREFIX {
        detect(body, Some(order))
    } else {
        detect(raw, Some(order))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::encoding::TextEncoding;

    fn u16_bytes(v: u16, big: bool) -> [u8; 2] {
        if big {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        }
    }

    fn u32_bytes(v: u32, big: bool) -> [u8; 4] {
        if big {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        }
    }

    /// APP1 segment holding a TIFF block with IFD0 -> Exif IFD -> UserComment.
    pub(crate) fn exif_segment(comment: &[u8], big: bool) -> Vec<u8> {
        let mut tiff = Vec::new();
        tiff.extend_from_slice(if big { b"MM" } else { b"II" });
        tiff.extend(u16_bytes(42, big));
        tiff.extend(u32_bytes(8, big));
        // IFD0: ExifIFDPointer
        tiff.extend(u16_bytes(1, big));
        tiff.extend(u16_bytes(0x8769, big));
        tiff.extend(u16_bytes(4, big));
        tiff.extend(u32_bytes(1, big));
        tiff.extend(u32_bytes(26, big));
        tiff.extend(u32_bytes(0, big));
        // Exif IFD: UserComment, UNDEFINED
        tiff.extend(u16_bytes(1, big));
        tiff.extend(u16_bytes(0x9286, big));
        tiff.extend(u16_bytes(7, big));
        tiff.extend(u32_bytes(comment.len() as u32, big));
        tiff.extend(u32_bytes(44, big));
        tiff.extend(u32_bytes(0, big));
        tiff.extend_from_slice(comment);

        let mut payload = b"Exif\0\0".to_vec();
        payload.extend(tiff);
        let mut segment = vec![0xFF, 0xE1];
        segment.extend(((payload.len() + 2) as u16).to_be_bytes());
        segment.extend(payload);
        segment
    }

    /// Splice an Exif segment right after SOI of an existing JPEG.
    pub(crate) fn with_exif(jpeg: &[u8], comment: &[u8], big: bool) -> Vec<u8> {
        let mut out = jpeg[..2].to_vec();
        out.extend(exif_segment(comment, big));
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    fn bare_jpeg(comment: &[u8], big: bool) -> Vec<u8> {
        with_exif(&[0xFF, 0xD8, 0xFF, 0xD9], comment, big)
    }

    fn prefixed(prefix: &[u8; 8], body: &[u8]) -> Vec<u8> {
        let mut out = prefix.to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_unicode_prefix_uses_tiff_order() {
        let text = "a cat\nSteps: 20, Seed: 7";
        let le: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let comment = read_user_comment(&bare_jpeg(&prefixed(UNICODE_PREFIX, &le), false)).unwrap();
        assert_eq!(comment.chunk.text, text);
        assert_eq!(comment.chunk.encoding, TextEncoding::Utf16Le);
        assert_eq!(comment.chunk.kind, TextChunkKind::ExifUserComment);
        assert!(!comment.low_confidence);
    }

    #[test]
    fn test_unicode_prefix_with_mismatched_header_order() {
        // big-endian text inside a little-endian TIFF block
        let text = "Steps: 30, Sampler: Euler";
        let be: Vec<u8> = text.encode_utf16().flat_map(u16::to_be_bytes).collect();
        let comment = read_user_comment(&bare_jpeg(&prefixed(UNICODE_PREFIX, &be), false)).unwrap();
        assert_eq!(comment.chunk.text, text);
        assert_eq!(comment.chunk.encoding, TextEncoding::Utf16Be);
    }

    #[test]
    fn test_ascii_prefix_is_utf8() {
        let body = "prompt with ünïcode, Steps: 5".as_bytes();
        let comment = read_user_comment(&bare_jpeg(&prefixed(ASCII_PREFIX, body), true)).unwrap();
        assert_eq!(comment.chunk.text, "prompt with ünïcode, Steps: 5");
        assert_eq!(comment.chunk.encoding, TextEncoding::Utf8);
    }

    #[test]
    fn test_no_exif() {
        assert!(read_user_comment(&[0xFF, 0xD8, 0xFF, 0xD9]).is_none());
    }

    #[test]
    fn test_undecodable_comment_is_low_confidence() {
        let comment = read_user_comment(&bare_jpeg(&prefixed(UNDEFINED_PREFIX, &[b'o', b'k', 0xC3, 0x28, 0xFF]), false)).unwrap();
        assert!(comment.low_confidence);
        assert!(comment.chunk.text.starts_with("ok"));
    }
}
