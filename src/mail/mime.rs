//! Best-effort RFC 5322 / MIME parsing
//!
//! Extracts subject, sender and named attachments from a raw message. Never
//! fails: malformed input yields fewer attachments, not an error.

use std::collections::BTreeMap;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use encoding_rs::Encoding;

/// Accepts missing or superfluous padding, which mail clients produce
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Nested multiparts and forwarded messages deeper than this are ignored
const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub subject: String,
    pub from: String,
    pub attachments: Vec<MimeAttachment>,
}

/// Parse a full message as returned by `FETCH RFC822`
pub fn parse_message(raw: &[u8]) -> ParsedMessage {
    let (headers, body) = split_headers(raw);
    let mut message = ParsedMessage {
        subject: header(&headers, "subject")
            .map(decode_encoded_words)
            .unwrap_or_default(),
        from: header(&headers, "from")
            .map(decode_encoded_words)
            .unwrap_or_default(),
        attachments: Vec::new(),
    };
    collect_attachments(&headers, body, 0, &mut message.attachments);
    message
}

type Headers = Vec<(String, String)>;

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// Split at the first empty line; header names are lowercased and folded
/// continuation lines joined.
fn split_headers(raw: &[u8]) -> (Headers, &[u8]) {
    let mut headers: Headers = Vec::new();
    let mut pos = 0;

    while pos < raw.len() {
        let end = raw[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(raw.len(), |i| pos + i);
        let line = trim_cr(&raw[pos..end]);
        let next = (end + 1).min(raw.len());

        if line.is_empty() {
            return (headers, &raw[next..]);
        }

        let text = String::from_utf8_lossy(line);
        if line[0] == b' ' || line[0] == b'\t' {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(text.trim());
            }
        } else if let Some((name, value)) = text.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        pos = next;
    }

    (headers, &raw[raw.len()..])
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// One `key*N` or `key*N*` piece of an RFC 2231 continued parameter
struct Segment {
    index: u32,
    encoded: bool,
    value: String,
}

/// `type/subtype; key=value; ...` split into the lowercased value and params.
/// RFC 2231 `key*=charset''percent-encoded` params are decoded and
/// `key*0`, `key*1`, ... continuations joined.
fn parse_parameterized(value: &str) -> (String, Vec<(String, String)>) {
    let mut parts = split_params(value).into_iter();
    let main = parts.next().unwrap_or_default().trim().to_ascii_lowercase();

    let mut params = Vec::new();
    let mut continued: BTreeMap<String, Vec<Segment>> = BTreeMap::new();
    for part in parts {
        let Some((key, val)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().trim_matches('"').to_string();

        let (name, encoded) = match key.strip_suffix('*') {
            Some(name) => (name, true),
            None => (key.as_str(), false),
        };
        match name.split_once('*') {
            Some((base, index)) => {
                let Ok(index) = index.parse() else {
                    continue;
                };
                continued.entry(base.to_string()).or_default().push(Segment {
                    index,
                    encoded,
                    value: val,
                });
            }
            None if encoded => params.push((name.to_string(), decode_rfc2231(&val))),
            None => params.push((key, val)),
        }
    }

    for (name, segments) in continued {
        params.push((name, join_segments(segments)));
    }
    (main, params)
}

/// Concatenate continuation segments in index order. The charset is taken
/// from the first segment when that one is encoded.
fn join_segments(mut segments: Vec<Segment>) -> String {
    segments.sort_by_key(|segment| segment.index);

    let mut charset = "utf-8".to_string();
    let mut bytes = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        if !segment.encoded {
            bytes.extend_from_slice(segment.value.as_bytes());
            continue;
        }
        let mut encoded = segment.value.as_str();
        if i == 0 {
            let mut pieces = encoded.splitn(3, '\'');
            if let (Some(cs), Some(_lang), Some(rest)) = (pieces.next(), pieces.next(), pieces.next()) {
                if !cs.is_empty() {
                    charset = cs.to_string();
                }
                encoded = rest;
            }
        }
        bytes.extend(percent_decode(encoded));
    }
    decode_charset(&bytes, &charset)
}

/// Split on `;` outside double quotes
fn split_params(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in value.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn decode_rfc2231(value: &str) -> String {
    let mut pieces = value.splitn(3, '\'');
    let (charset, encoded) = match (pieces.next(), pieces.next(), pieces.next()) {
        (Some(charset), Some(_lang), Some(encoded)) => (charset, encoded),
        _ => ("utf-8", value),
    };
    decode_charset(&percent_decode(encoded), charset)
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(b) = hex_byte(bytes[i + 1], bytes[i + 2]) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn hex_byte(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

fn decode_charset(bytes: &[u8], charset: &str) -> String {
    match Encoding::for_label(charset.trim().as_bytes()) {
        Some(encoding) => encoding.decode(bytes).0.into_owned(),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Decode RFC 2047 `=?charset?B|Q?text?=` words. Whitespace between two
/// adjacent encoded words is dropped.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    let mut pending_space = String::new();
    let mut last_was_encoded = false;

    while !rest.is_empty() {
        let Some(start) = rest.find("=?") else {
            out.push_str(&pending_space);
            out.push_str(rest);
            return out;
        };

        let decoded = parse_encoded_word(&rest[start..]);
        let Some((text, consumed)) = decoded else {
            out.push_str(&pending_space);
            pending_space.clear();
            out.push_str(&rest[..start + 2]);
            rest = &rest[start + 2..];
            last_was_encoded = false;
            continue;
        };

        let between = &rest[..start];
        if !(last_was_encoded && between.trim().is_empty()) {
            out.push_str(&pending_space);
            out.push_str(between);
        }
        pending_space.clear();
        out.push_str(&text);
        rest = &rest[start + consumed..];
        last_was_encoded = true;

        // Hold back whitespace that may sit between two encoded words
        let trimmed = rest.trim_start();
        if trimmed.starts_with("=?") {
            pending_space = rest[..rest.len() - trimmed.len()].to_string();
            rest = trimmed;
        }
    }

    out.push_str(&pending_space);
    out
}

/// Returns the decoded text and the byte length of the encoded word
fn parse_encoded_word(s: &str) -> Option<(String, usize)> {
    let inner = s.strip_prefix("=?")?;
    let (charset, inner) = inner.split_once('?')?;
    let (encoding, inner) = inner.split_once('?')?;
    let end = inner.find("?=")?;
    let text = &inner[..end];
    if text.contains(' ') {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => LENIENT_BASE64.decode(text).ok()?,
        "Q" | "q" => decode_quoted_printable(text.replace('_', " ").as_bytes()),
        _ => return None,
    };

    // RFC 2231 language suffix: charset*lang
    let charset = charset.split('*').next().unwrap_or(charset);
    let consumed = 2 + charset_len(s) + 1 + encoding.len() + 1 + end + 2;
    Some((decode_charset(&bytes, charset), consumed))
}

fn charset_len(s: &str) -> usize {
    s[2..].find('?').unwrap_or(0)
}

/// Quoted-printable, including soft line breaks
pub fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'=' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        match (input.get(i + 1), input.get(i + 2)) {
            (Some(b'\r'), Some(b'\n')) => i += 3,
            (Some(b'\n'), _) => i += 2,
            (Some(&hi), Some(&lo)) => match hex_byte(hi, lo) {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(b'=');
                    i += 1;
                }
            },
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn decode_transfer_encoding(body: &[u8], encoding: &str) -> Vec<u8> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "base64" => {
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            LENIENT_BASE64.decode(&compact).unwrap_or_default()
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.to_vec(),
    }
}

/// Split a multipart body on `--boundary` delimiter lines
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut pos = 0;

    while pos < body.len() {
        let end = body[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(body.len(), |i| pos + i);
        let line = trim_cr(&body[pos..end]);

        if let Some(after) = line.strip_prefix(delimiter) {
            let closing = after.starts_with(b"--");
            if closing || after.iter().all(|b| b.is_ascii_whitespace()) {
                if let Some(start) = part_start {
                    // The line break before a delimiter belongs to the delimiter
                    let mut part_end = pos;
                    if part_end > start && body[part_end - 1] == b'\n' {
                        part_end -= 1;
                    }
                    if part_end > start && body[part_end - 1] == b'\r' {
                        part_end -= 1;
                    }
                    parts.push(&body[start..part_end]);
                }
                if closing {
                    return parts;
                }
                part_start = Some((end + 1).min(body.len()));
            }
        }
        pos = end + 1;
    }

    if let Some(start) = part_start {
        parts.push(&body[start..]);
    }
    parts
}

fn collect_attachments(
    headers: &Headers,
    body: &[u8],
    depth: usize,
    out: &mut Vec<MimeAttachment>,
) {
    let (content_type, type_params) = parse_parameterized(
        header(headers, "content-type").unwrap_or("text/plain"),
    );

    if content_type.starts_with("multipart/") {
        if depth >= MAX_DEPTH {
            return;
        }
        if let Some(boundary) = param(&type_params, "boundary") {
            for part in split_multipart(body, boundary) {
                let (part_headers, part_body) = split_headers(part);
                collect_attachments(&part_headers, part_body, depth + 1, out);
            }
        }
        return;
    }

    // Forwarded message: its own attachments count, the wrapper does not
    if content_type == "message/rfc822" {
        if depth >= MAX_DEPTH {
            return;
        }
        let encoding = header(headers, "content-transfer-encoding").unwrap_or("7bit");
        let inner = decode_transfer_encoding(body, encoding);
        let (inner_headers, inner_body) = split_headers(&inner);
        collect_attachments(&inner_headers, inner_body, depth + 1, out);
        return;
    }

    let disposition = header(headers, "content-disposition").unwrap_or("");
    let lowered = disposition.to_ascii_lowercase();
    if !lowered.contains("attachment") && !lowered.contains("filename") {
        return;
    }

    let (_, disposition_params) = parse_parameterized(disposition);
    let filename = param(&disposition_params, "filename")
        .or_else(|| param(&type_params, "name"))
        .map(decode_encoded_words);
    let Some(filename) = filename.filter(|f| !f.trim().is_empty()) else {
        return;
    };

    let encoding = header(headers, "content-transfer-encoding").unwrap_or("7bit");
    out.push(MimeAttachment {
        filename,
        content_type,
        data: decode_transfer_encoding(body, encoding),
    });
}
