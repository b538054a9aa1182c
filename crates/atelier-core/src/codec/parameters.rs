//! A1111-style generation parameter text.
//!
//! ```text
//! <positive prompt, any number of lines>
//! Negative prompt: <negative prompt, any number of lines>
//! Steps: 20, Sampler: Euler a, CFG scale: 7, Seed: 1234, Size: 512x768
//! ```
//!
//! Values that would break the final line (commas, colons, quotes, brackets,
//! newlines) are written as JSON strings and unquoted on read. Commas inside
//! quotes or brackets never split a value. A prompt that would be misread
//! as written (a line starting with the negative marker, edge whitespace, or
//! a last line shaped like the parameter line) is written as a single JSON
//! string line.

use super::fields::{canonical_key, is_recognized, ParsedFields, NEGATIVE_PROMPT, PROMPT};

const NEGATIVE_MARKER: &str = "negative prompt:";

/// Minimum pairs for a foreign line of unknown keys to count as parameters.
const MIN_UNKNOWN_PAIRS: usize = 3;

/// Parse parameter text into fields.
///
/// The last line is taken as the parameter line when every comma-separated
/// segment of it is a `Key: value` pair.
pub fn parse(text: &str) -> ParsedFields {
    let text = text.trim();
    let mut lines: Vec<&str> = text.lines().collect();

    let pairs = lines.last().and_then(|line| parse_param_line(line));
    if pairs.is_some() {
        lines.pop();
    }

    let mut fields = ParsedFields::new();
    let (prompt, negative) = split_negative(&lines);
    let prompt = unquote(&prompt);
    if !prompt.is_empty() {
        fields.insert(PROMPT, prompt);
    }
    if let Some(negative) = negative.map(|n| unquote(&n)).filter(|n| !n.is_empty()) {
        fields.insert(NEGATIVE_PROMPT, negative);
    }
    for (key, value) in pairs.unwrap_or_default() {
        fields.insert(&key, value);
    }
    fields
}

/// Render fields as parameter text.
///
/// Vocabulary keys lead the parameter line, followed by any other keys in
/// insertion order.
pub fn format(fields: &ParsedFields) -> String {
    let (mut pairs, foreign): (Vec<_>, Vec<_>) = fields
        .iter()
        .filter(|(k, _)| *k != PROMPT && *k != NEGATIVE_PROMPT)
        .partition(|(k, _)| is_recognized(k));
    pairs.extend(foreign);
    let pairs: Vec<String> = pairs
        .into_iter()
        .map(|(k, v)| format!("{}: {}", sanitize_key(k), quote(v)))
        .collect();

    let prompt = fields.get(PROMPT).filter(|p| !p.is_empty());
    let negative = fields.get(NEGATIVE_PROMPT).filter(|n| !n.is_empty());

    let mut lines = Vec::new();
    if let Some(prompt) = prompt {
        let last = negative.is_none() && pairs.is_empty();
        lines.push(escape_block(prompt, last, true));
    }
    if let Some(negative) = negative {
        let last = pairs.is_empty();
        lines.push(format!("Negative prompt: {}", escape_block(negative, last, false)));
    }
    if !pairs.is_empty() {
        lines.push(pairs.join(", "));
    }
    lines.join("\n")
}

/// Whether `text` looks like A1111 parameter text.
///
/// Stricter than [`parse`]: the last line must start with a vocabulary key
/// or hold at least three pairs, so a stray `caption: text` chunk is not
/// taken for parameters.
pub fn looks_like_parameters(text: &str) -> bool {
    let Some(pairs) = text.trim().lines().last().and_then(parse_param_line) else {
        return false;
    };
    let first_known = pairs.first().map(|(k, _)| is_recognized(k)).unwrap_or(false);
    first_known || pairs.len() >= MIN_UNKNOWN_PAIRS
}

fn split_negative(lines: &[&str]) -> (String, Option<String>) {
    let marker = lines.iter().position(|line| starts_with_marker(line));

    match marker {
        Some(index) => {
            let prompt = lines[..index].join("\n").trim().to_string();
            let first = &lines[index].trim_start()[NEGATIVE_MARKER.len()..];
            let mut negative = vec![first];
            negative.extend_from_slice(&lines[index + 1..]);
            (prompt, Some(negative.join("\n").trim().to_string()))
        }
        None => (lines.join("\n").trim().to_string(), None),
    }
}

fn starts_with_marker(line: &str) -> bool {
    line.trim_start()
        .get(..NEGATIVE_MARKER.len())
        .map(|head| head.eq_ignore_ascii_case(NEGATIVE_MARKER))
        .unwrap_or(false)
}

/// Write a prompt block as-is, or as one JSON string line when reading the
/// raw text back would not return `text`. `last` is set when the block ends
/// the whole text.
fn escape_block(text: &str, last: bool, positive: bool) -> String {
    let misread = text != text.trim()
        || text.contains('\r')
        || text.starts_with('"')
        || (positive && text.lines().any(starts_with_marker))
        || (last && text.lines().last().and_then(parse_param_line).is_some());
    if misread {
        serde_json::to_string(text).unwrap_or_else(|_| text.to_string())
    } else {
        text.to_string()
    }
}

/// Parse the `Key: value, ...` line, or `None` if `line` is not one.
fn parse_param_line(line: &str) -> Option<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for segment in split_top_level(line) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment.split_once(':')?;
        let key = key.trim();
        if !is_key(key) || matches!(canonical_key(key), Some(PROMPT) | Some(NEGATIVE_PROMPT)) {
            return None;
        }
        pairs.push((key.to_string(), unquote(value.trim())));
    }
    if pairs.is_empty() {
        None
    } else {
        Some(pairs)
    }
}

fn is_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(|c| matches!(c, '"' | '[' | '{' | '('))
}

/// Split on commas outside quotes and brackets.
fn split_top_level(line: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;

    for c in line.chars() {
        if in_quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_quote = true;
                current.push(c);
            }
            '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

fn quote(value: &str) -> String {
    let needs_quotes = value != value.trim()
        || value
            .chars()
            .any(|c| matches!(c, ',' | ':' | '\n' | '\r' | '"' | '[' | ']' | '{' | '}'));
    if needs_quotes {
        serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(value) {
            return inner;
        }
    }
    value.to_string()
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if matches!(c, ':' | ',' | '\n' | '\r' | '"' | '[' | '{' | '(') {
                ' '
            } else {
                c
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}
