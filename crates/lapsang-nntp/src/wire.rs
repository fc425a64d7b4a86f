//! Wire-format helpers: NNTP timestamps and RFC 2047 header decoding.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{NaiveDate, NaiveDateTime};

use crate::error::NntpError;

/// Parse a `yyyymmddhhmmss` timestamp as returned by DATE
/// ([RFC 3977 §7.1](https://datatracker.ietf.org/doc/html/rfc3977#section-7.1)),
/// or a separate date and time pair as used in NEWNEWS responses.
///
/// Two-digit years are accepted for legacy servers: values below 70 map
/// to 20xx, the rest to 19xx.
pub fn parse_timestamp(date_str: &str, time_str: Option<&str>) -> Result<NaiveDateTime, NntpError> {
    // All slicing below is by byte offset; non-digit input is rejected
    // first so a multibyte character cannot split a char boundary.
    if !date_str.bytes().all(|b| b.is_ascii_digit())
        || !time_str.is_none_or(|t| t.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(NntpError::DataError(format!(
            "invalid timestamp: {date_str}"
        )));
    }
    let (date_str, time_str) = match time_str {
        Some(t) => (date_str, t),
        None => {
            if date_str.len() < 12 {
                return Err(NntpError::DataError(format!(
                    "invalid timestamp: {date_str}"
                )));
            }
            date_str.split_at(date_str.len() - 6)
        }
    };
    if time_str.len() != 6 || date_str.len() < 6 || date_str.len() > 8 {
        return Err(NntpError::DataError(format!(
            "invalid timestamp: {date_str} {time_str}"
        )));
    }

    let bad = |_| NntpError::DataError(format!("invalid timestamp: {date_str} {time_str}"));
    let hour: u32 = time_str[..2].parse().map_err(bad)?;
    let minute: u32 = time_str[2..4].parse().map_err(bad)?;
    let second: u32 = time_str[4..].parse().map_err(bad)?;

    let split = date_str.len() - 4;
    let mut year: i32 = date_str[..split].parse().map_err(bad)?;
    let month: u32 = date_str[split..split + 2].parse().map_err(bad)?;
    let day: u32 = date_str[split + 2..].parse().map_err(bad)?;
    if year < 70 {
        year += 2000;
    } else if year < 100 {
        year += 1900;
    }

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(|| NntpError::DataError(format!("invalid timestamp: {date_str} {time_str}")))
}

/// Render a timestamp as the `yyyymmdd hhmmss` argument pair for
/// NEWGROUPS and NEWNEWS. Servers predating RFC 3977 (VERSION < 2)
/// expect two-digit years.
pub fn format_timestamp(when: NaiveDateTime, legacy: bool) -> (String, String) {
    let date_fmt = if legacy { "%y%m%d" } else { "%Y%m%d" };
    (
        when.format(date_fmt).to_string(),
        when.format("%H%M%S").to_string(),
    )
}

/// Decode RFC 2047 encoded-words in a header value
/// ([RFC 2047 §2](https://datatracker.ietf.org/doc/html/rfc2047#section-2)).
///
/// Handles B and Q encodings for UTF-8, US-ASCII and ISO-8859-1; other
/// charsets fall back to lossy UTF-8. Whitespace between adjacent
/// encoded words is dropped, and malformed encoded words pass through
/// verbatim.
pub fn decode_header(raw: &str) -> String {
    let mut out = String::new();
    let mut rest = raw;
    let mut trailing_encoded = false;
    while let Some((start, end, decoded)) = find_encoded_word(rest) {
        let literal = &rest[..start];
        if !(trailing_encoded && literal.bytes().all(|b| b == b' ' || b == b'\t')) {
            out.push_str(literal);
        }
        out.push_str(&decoded);
        trailing_encoded = true;
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn find_encoded_word(s: &str) -> Option<(usize, usize, String)> {
    let mut search_from = 0;
    while let Some(offset) = s[search_from..].find("=?") {
        let start = search_from + offset;
        if let Some((len, decoded)) = parse_encoded_word(&s[start..]) {
            return Some((start, start + len, decoded));
        }
        search_from = start + 2;
    }
    None
}

fn parse_encoded_word(s: &str) -> Option<(usize, String)> {
    let inner = s.strip_prefix("=?")?;
    let charset_end = inner.find('?')?;
    let charset = &inner[..charset_end];
    let rest = &inner[charset_end + 1..];
    let encoding_end = rest.find('?')?;
    let encoding = &rest[..encoding_end];
    let payload_rest = &rest[encoding_end + 1..];
    let payload_end = payload_rest.find("?=")?;
    let payload = &payload_rest[..payload_end];

    let bytes = match encoding {
        "B" | "b" => BASE64.decode(payload).ok()?,
        "Q" | "q" => decode_q(payload),
        _ => return None,
    };
    let len = 2 + charset_end + 1 + encoding_end + 1 + payload_end + 2;
    Some((len, decode_charset(charset, &bytes)))
}

fn decode_q(payload: &str) -> Vec<u8> {
    let raw = payload.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < raw.len() => {
                let hex = [raw[i + 1], raw[i + 2]];
                match std::str::from_utf8(&hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    out
}

fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    if charset.eq_ignore_ascii_case("iso-8859-1") || charset.eq_ignore_ascii_case("latin1") {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
