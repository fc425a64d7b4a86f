//! Async NNTP client library.
//!
//! Implements the Network News Transfer Protocol as specified in
//! [RFC 3977](https://datatracker.ietf.org/doc/html/rfc3977), with support
//! for AUTHINFO authentication ([RFC 4643](https://datatracker.ietf.org/doc/html/rfc4643)),
//! STARTTLS and implicit TLS ([RFC 4642](https://datatracker.ietf.org/doc/html/rfc4642)),
//! DEFLATE compression ([RFC 8054](https://datatracker.ietf.org/doc/html/rfc8054)),
//! and the common legacy extensions XOVER, XHDR and XGTITLE
//! ([RFC 2980](https://datatracker.ietf.org/doc/html/rfc2980)).
//!
//! The protocol logic lives in a sans-io state machine ([`machine`]);
//! [`NntpConnection`] drives it over tokio streams.

mod error;
pub mod machine;
mod model;
pub mod overview;
mod protocol;
pub mod wire;

pub use error::NntpError;
pub use model::{
    Article, ArticleSpec, ArticleStat, Capabilities, Encryption, GroupListing, GroupSummary,
    NNTP_PORT, NNTP_SSL_PORT, NntpResponse, OverSpec, ServerConfig,
};
pub use overview::OverviewEntry;
pub use protocol::{BlockReader, NntpConnection, NntpIo, NntpStream, build_tls_config};
