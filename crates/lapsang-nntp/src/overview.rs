//! Overview format and OVER/XOVER response parsing
//! ([RFC 3977 §8.3-8.4](https://datatracker.ietf.org/doc/html/rfc3977#section-8.3)).

use std::collections::HashMap;

use crate::error::NntpError;

/// The mandatory first seven overview fields, in wire order
/// ([RFC 3977 §8.4.2](https://datatracker.ietf.org/doc/html/rfc3977#section-8.4.2)).
pub const DEFAULT_OVERVIEW_FMT: &[&str] = &[
    "subject",
    "from",
    "date",
    "message-id",
    "references",
    ":bytes",
    ":lines",
];

/// One article's overview line, keyed by the field names from
/// LIST OVERVIEW.FMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverviewEntry {
    pub number: u64,
    pub fields: HashMap<String, Option<String>>,
}

impl OverviewEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.as_deref())
    }
}

/// Parse a LIST OVERVIEW.FMT response into a field-name list.
///
/// Some servers advertise the metadata fields as `bytes` and `lines`
/// instead of `:bytes` and `:lines`; both spellings are accepted. The
/// first seven fields must match [`DEFAULT_OVERVIEW_FMT`].
pub fn parse_overview_fmt<S: AsRef<str>>(lines: &[S]) -> Result<Vec<String>, NntpError> {
    let mut fmt = Vec::with_capacity(lines.len());
    for line in lines {
        let line = line.as_ref();
        let name = if let Some(meta) = line.strip_prefix(':') {
            let (name, _) = meta.split_once(':').unwrap_or((meta, ""));
            format!(":{name}")
        } else {
            let (name, _) = line.split_once(':').unwrap_or((line, ""));
            name.to_string()
        };
        let name = name.to_ascii_lowercase();
        fmt.push(match name.as_str() {
            "bytes" => ":bytes".to_string(),
            "lines" => ":lines".to_string(),
            _ => name,
        });
    }

    if fmt.len() < DEFAULT_OVERVIEW_FMT.len() {
        return Err(NntpError::DataError(
            "LIST OVERVIEW.FMT response too short".into(),
        ));
    }
    if fmt[..DEFAULT_OVERVIEW_FMT.len()] != *DEFAULT_OVERVIEW_FMT {
        return Err(NntpError::DataError(
            "LIST OVERVIEW.FMT redefines default fields".into(),
        ));
    }
    Ok(fmt)
}

/// Parse OVER/XOVER data lines against a field-name list.
///
/// Fields beyond the default seven are full headers: the server repeats
/// the header name in each value, which is stripped here. An empty
/// additional field becomes `None`.
pub fn parse_overview<S: AsRef<str>>(
    lines: &[S],
    fmt: &[String],
) -> Result<Vec<OverviewEntry>, NntpError> {
    let n_defaults = DEFAULT_OVERVIEW_FMT.len();
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        let line = line.as_ref();
        let mut tokens = line.split('\t');
        let number = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| NntpError::DataError(format!("invalid overview line: {line}")))?;

        let mut fields = HashMap::new();
        for (i, token) in tokens.enumerate() {
            // Servers without LIST OVERVIEW.FMT may still send extra
            // trailing fields; ignore anything past the known format.
            let Some(name) = fmt.get(i) else { continue };
            let is_metadata = name.starts_with(':');
            let value = if i >= n_defaults && !is_metadata {
                if token.is_empty() {
                    None
                } else {
                    // Compare on bytes; the token may hold arbitrary UTF-8
                    // and must not be sliced at a non-boundary.
                    let prefix_len = name.len() + 2;
                    let raw = token.as_bytes();
                    let matches_name = raw.len() >= prefix_len
                        && raw[..name.len()].eq_ignore_ascii_case(name.as_bytes())
                        && &raw[name.len()..prefix_len] == b": ";
                    if !matches_name {
                        return Err(NntpError::DataError(
                            "overview response does not include names of additional headers"
                                .into(),
                        ));
                    }
                    Some(token[prefix_len..].to_string())
                }
            } else {
                Some(token.to_string())
            };
            fields.insert(name.clone(), value);
        }
        entries.push(OverviewEntry { number, fields });
    }
    Ok(entries)
}

pub fn default_overview_fmt() -> Vec<String> {
    DEFAULT_OVERVIEW_FMT.iter().map(|s| s.to_string()).collect()
}
