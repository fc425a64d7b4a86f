use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Standard port for plain-text NNTP ([RFC 3977 §3](https://datatracker.ietf.org/doc/html/rfc3977#section-3)).
pub const NNTP_PORT: u16 = 119;
/// Standard port for NNTP over implicit TLS.
pub const NNTP_SSL_PORT: u16 = 563;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub encryption: Encryption,
    /// Send MODE READER after connecting. Some servers require it before
    /// reader commands such as GROUP are accepted.
    pub readermode: bool,
    pub cert_verification: bool,
    /// Socket connect timeout in seconds. `None` blocks indefinitely.
    pub timeout_secs: Option<u64>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: NNTP_PORT,
            username: None,
            password: None,
            encryption: Encryption::None,
            readermode: false,
            cert_verification: true,
            timeout_secs: None,
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    None,
    Tls,
    StartTls,
}

/// Parsed NNTP response line.
///
/// Response codes are defined in [RFC 3977 §3.2](https://datatracker.ietf.org/doc/html/rfc3977#section-3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NntpResponse {
    pub code: u16,
    pub message: String,
}

/// Server capabilities as advertised by the CAPABILITIES command
/// ([RFC 3977 §5.2](https://datatracker.ietf.org/doc/html/rfc3977#section-5.2)).
///
/// Empty when the server does not support CAPABILITIES at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    entries: HashMap<String, Vec<String>>,
}

impl Capabilities {
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut entries = HashMap::new();
        for line in lines {
            let mut words = line.as_ref().split_whitespace();
            if let Some(name) = words.next() {
                entries.insert(
                    name.to_ascii_uppercase(),
                    words.map(str::to_string).collect(),
                );
            }
        }
        Self { entries }
    }

    pub fn supports(&self, label: &str) -> bool {
        self.entries.contains_key(&label.to_ascii_uppercase())
    }

    pub fn tokens(&self, label: &str) -> Option<&[String]> {
        self.entries
            .get(&label.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

    /// Highest protocol version advertised via the VERSION capability.
    pub fn version(&self) -> Option<u32> {
        self.tokens("VERSION")?
            .iter()
            .filter_map(|token| token.parse().ok())
            .max()
    }

    pub fn implementation(&self) -> Option<String> {
        self.tokens("IMPLEMENTATION").map(|tokens| tokens.join(" "))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Summary line of a successful GROUP command
/// ([RFC 3977 §6.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-6.1.1)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub name: String,
    pub count: u64,
    pub first: u64,
    pub last: u64,
}

/// One line of a LIST ACTIVE or NEWGROUPS response. The wire order is
/// `group last first flag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupListing {
    pub name: String,
    pub high: u64,
    pub low: u64,
    pub flag: String,
}

/// Parsed 223 status line of STAT, NEXT or LAST
/// ([RFC 3977 §6.2.4](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.4)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleStat {
    pub number: u64,
    pub message_id: String,
}

/// A fully collected ARTICLE, HEAD or BODY payload. Lines are raw bytes:
/// article content is not required to be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub number: u64,
    pub message_id: String,
    pub lines: Vec<Vec<u8>>,
}

/// Article selector for STAT, ARTICLE, HEAD and BODY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleSpec {
    /// The server's current article pointer.
    Current,
    /// An article number within the selected group.
    Number(u64),
    /// A message-id, valid without a selected group.
    MessageId(String),
}

impl ArticleSpec {
    /// Render the command suffix, wrapping message-ids in angle brackets
    /// when the caller left them bare.
    pub(crate) fn append_to(&self, command: &mut String) {
        match self {
            Self::Current => {}
            Self::Number(n) => {
                command.push(' ');
                command.push_str(&n.to_string());
            }
            Self::MessageId(id) => {
                command.push(' ');
                push_message_id(command, id);
            }
        }
    }
}

impl From<u64> for ArticleSpec {
    fn from(number: u64) -> Self {
        Self::Number(number)
    }
}

impl From<&str> for ArticleSpec {
    fn from(message_id: &str) -> Self {
        Self::MessageId(message_id.to_string())
    }
}

impl From<String> for ArticleSpec {
    fn from(message_id: String) -> Self {
        Self::MessageId(message_id)
    }
}

impl fmt::Display for ArticleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rendered = String::new();
        self.append_to(&mut rendered);
        f.write_str(rendered.trim_start())
    }
}

/// Range selector for OVER/XOVER ([RFC 3977 §8.3](https://datatracker.ietf.org/doc/html/rfc3977#section-8.3)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverSpec {
    /// The current article.
    Current,
    /// A single article by message-id. Not supported by XOVER.
    MessageId(String),
    /// A range of article numbers; an open end means "up to the newest".
    Range { start: u64, end: Option<u64> },
}

impl OverSpec {
    pub(crate) fn append_to(&self, command: &mut String) {
        match self {
            Self::Current => {}
            Self::MessageId(id) => {
                command.push(' ');
                push_message_id(command, id);
            }
            Self::Range { start, end } => {
                command.push(' ');
                command.push_str(&start.to_string());
                command.push('-');
                if let Some(end) = end {
                    command.push_str(&end.to_string());
                }
            }
        }
    }
}

fn push_message_id(out: &mut String, id: &str) {
    if id.starts_with('<') {
        out.push_str(id);
    } else {
        out.push('<');
        out.push_str(id);
        out.push('>');
    }
}
