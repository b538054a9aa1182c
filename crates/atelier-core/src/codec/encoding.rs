//! Text decoding with encoding detection.
//!
//! Order: strict UTF-8, then UTF-16 (accepted only when mostly printable),
//! then lossy UTF-8. Ending in the lossy fallback marks the result
//! low-confidence instead of failing.

use serde::{Deserialize, Serialize};

/// Share of printable characters a UTF-16 candidate needs to be accepted.
const MIN_PRINTABLE_RATIO: f64 = 0.8;

/// Encoding a piece of embedded text was decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    Utf8,
    Latin1,
    Utf16Le,
    Utf16Be,
    /// UTF-8 with undecodable bytes replaced
    Lossy,
}

impl TextEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "latin-1",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Lossy => "utf-8 (lossy)",
        }
    }
}

/// Byte order of UTF-16 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Utf16Order {
    Little,
    Big,
}

/// Decoded text and how it was decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Decoded {
    pub text: String,
    pub encoding: TextEncoding,
    pub low_confidence: bool,
}

impl Decoded {
    fn sure(text: String, encoding: TextEncoding) -> Self {
        Self {
            text,
            encoding,
            low_confidence: false,
        }
    }
}

/// Run the full detection order over `bytes`.
pub(crate) fn detect(bytes: &[u8], hint: Option<Utf16Order>) -> Decoded {
    if let Some(text) = strict_utf8(trim_trailing_nuls(bytes)) {
        return Decoded::sure(text, TextEncoding::Utf8);
    }
    if let Some(decoded) = utf16(bytes, hint) {
        return decoded;
    }
    lossy(trim_trailing_nuls(bytes))
}

/// Decode text declared as UTF-16 (Exif `UNICODE` prefix), falling back to
/// the full detection order when it does not look like UTF-16.
pub(crate) fn detect_utf16_first(bytes: &[u8], hint: Option<Utf16Order>) -> Decoded {
    utf16(bytes, hint).unwrap_or_else(|| detect(bytes, hint))
}

/// Decode a PNG `tEXt`/`zTXt` payload: UTF-8 when valid (a common exporter
/// habit), else ISO-8859-1 as the format defines.
pub(crate) fn decode_png_latin1(bytes: &[u8]) -> Decoded {
    match strict_utf8(bytes) {
        Some(text) => Decoded::sure(text, TextEncoding::Utf8),
        None => Decoded::sure(latin1(bytes), TextEncoding::Latin1),
    }
}

/// Decode a PNG `iTXt` payload, which must be UTF-8.
pub(crate) fn decode_png_utf8(bytes: &[u8]) -> Decoded {
    match std::str::from_utf8(bytes) {
        Ok(text) => Decoded::sure(text.to_string(), TextEncoding::Utf8),
        Err(_) => lossy(bytes),
    }
}

pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Latin-1 bytes for `text`, or `None` if a character is outside it.
pub(crate) fn to_latin1(text: &str) -> Option<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

fn strict_utf8(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    // UTF-16 ASCII is valid UTF-8 full of NULs; don't take it for text.
    if text.contains('\0') {
        return None;
    }
    Some(text.to_string())
}

fn utf16(bytes: &[u8], hint: Option<Utf16Order>) -> Option<Decoded> {
    if bytes.len() < 2 {
        return None;
    }

    let (order, body) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (Some(Utf16Order::Little), rest),
        [0xFE, 0xFF, rest @ ..] => (Some(Utf16Order::Big), rest),
        _ => (None, bytes),
    };
    // An odd trailing NUL is padding.
    let body = match body {
        [head @ .., 0] if body.len() % 2 == 1 => head,
        _ => body,
    };
    if body.len() % 2 != 0 {
        return None;
    }

    let candidates: Vec<(Utf16Order, String)> = match order {
        Some(order) => decode_utf16(body, order).map(|t| (order, t)).into_iter().collect(),
        None => [Utf16Order::Little, Utf16Order::Big]
            .into_iter()
            .filter_map(|o| decode_utf16(body, o).map(|t| (o, t)))
            .collect(),
    };

    // Mostly-Latin text puts its zero byte on one side; the wrong byte
    // order turns it into CJK, which is printable too.
    let best = candidates.into_iter().max_by(|(oa, a), (ob, b)| {
        let score = |o: &Utf16Order, t: &str| {
            let latin = t.chars().filter(|c| u32::from(*c) < 0x100).count();
            let preferred = usize::from(Some(*o) == hint);
            (latin, preferred)
        };
        score(oa, a).cmp(&score(ob, b))
    })?;

    let (order, text) = best;
    let text = text.trim_end_matches('\0').to_string();
    if text.is_empty() || printable_ratio(&text) < MIN_PRINTABLE_RATIO {
        return None;
    }
    let encoding = match order {
        Utf16Order::Little => TextEncoding::Utf16Le,
        Utf16Order::Big => TextEncoding::Utf16Be,
    };
    Some(Decoded::sure(text, encoding))
}

fn decode_utf16(bytes: &[u8], order: Utf16Order) -> Option<String> {
    let units = bytes.chunks_exact(2).map(|pair| match order {
        Utf16Order::Little => u16::from_le_bytes([pair[0], pair[1]]),
        Utf16Order::Big => u16::from_be_bytes([pair[0], pair[1]]),
    });
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

fn lossy(bytes: &[u8]) -> Decoded {
    Decoded {
        text: String::from_utf8_lossy(bytes).replace('\0', ""),
        encoding: TextEncoding::Lossy,
        low_confidence: true,
    }
}

fn printable_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .count();
    printable as f64 / total as f64
}

fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}
