//! NNTP connection handling and I/O layer.
//!
//! Wraps [`NntpMachine`] with async I/O to implement the NNTP session lifecycle
//! defined in [RFC 3977 §5](https://datatracker.ietf.org/doc/html/rfc3977#section-5).

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::NaiveDateTime;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use tracing::{debug, trace};

use crate::error::NntpError;
use crate::machine::{self, Event, Input, NntpMachine, Output, ProtoError};
use crate::model::{
    Article, ArticleSpec, ArticleStat, Capabilities, Encryption, GroupListing, GroupSummary,
    NntpResponse, OverSpec, ServerConfig,
};
use crate::overview::{self, OverviewEntry};
use crate::wire;

pub trait NntpIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> NntpIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Longest line the client will accept, response or block
/// (mirrors the historical 512-byte limit of RFC 977, raised for
/// modern overview lines).
const MAX_LINE: usize = 2048;

const DEFLATE_BUF_SIZE: usize = 8192;

struct DeflateStream<T> {
    inner: T,
    compress: Compress,
    decompress: Decompress,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    write_buf: Vec<u8>,
    write_pos: usize,
    tmp_read_out: Vec<u8>,
    tmp_write_out: Vec<u8>,
}

impl<T> DeflateStream<T> {
    fn new_with_buffered(inner: T, buffered: &[u8]) -> Self {
        let mut read_buf = vec![0u8; DEFLATE_BUF_SIZE.max(buffered.len())];
        let read_len = buffered.len();
        read_buf[..read_len].copy_from_slice(buffered);
        Self {
            inner,
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
            read_buf,
            read_pos: 0,
            read_len,
            write_buf: Vec::new(),
            write_pos: 0,
            tmp_read_out: vec![0u8; DEFLATE_BUF_SIZE],
            tmp_write_out: vec![0u8; 64],
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for DeflateStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();

        loop {
            if me.read_pos < me.read_len {
                let before_in = me.decompress.total_in();
                let before_out = me.decompress.total_out();

                let avail = &me.read_buf[me.read_pos..me.read_len];
                me.tmp_read_out
                    .resize(buf.remaining().max(DEFLATE_BUF_SIZE), 0);

                let status = me
                    .decompress
                    .decompress(avail, &mut me.tmp_read_out, FlushDecompress::Sync)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                let consumed = (me.decompress.total_in() - before_in) as usize;
                let produced = (me.decompress.total_out() - before_out) as usize;

                me.read_pos += consumed;

                if produced > 0 {
                    buf.put_slice(&me.tmp_read_out[..produced]);
                    return Poll::Ready(Ok(()));
                }

                if status == Status::StreamEnd {
                    return Poll::Ready(Ok(()));
                }
            }

            me.read_pos = 0;
            me.read_len = 0;

            let mut tmp = ReadBuf::new(&mut me.read_buf);
            match Pin::new(&mut me.inner).poll_read(cx, &mut tmp) {
                Poll::Ready(Ok(())) => {
                    me.read_len = tmp.filled().len();
                    if me.read_len == 0 {
                        return Poll::Ready(Ok(()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for DeflateStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();

        // Compressed output from an earlier poll belongs to bytes already
        // reported as written; it must drain before new input is compressed,
        // or a re-poll with the same `buf` would compress it twice.
        while me.write_pos < me.write_buf.len() {
            match Pin::new(&mut me.inner).poll_write(cx, &me.write_buf[me.write_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    me.write_pos += n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        me.write_buf.clear();
        me.write_pos = 0;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut consumed = 0;
        while consumed < buf.len() {
            let before_in = me.compress.total_in();
            let before_out = me.compress.total_out();

            me.tmp_write_out.resize(DEFLATE_BUF_SIZE, 0);
            me.compress
                .compress(&buf[consumed..], &mut me.tmp_write_out, FlushCompress::Sync)
                .map_err(io::Error::other)?;

            let used = (me.compress.total_in() - before_in) as usize;
            let produced = (me.compress.total_out() - before_out) as usize;
            if used == 0 && produced == 0 {
                return Poll::Ready(Err(io::Error::other("deflate made no progress")));
            }

            consumed += used;
            me.write_buf
                .extend_from_slice(&me.tmp_write_out[..produced]);
        }

        while me.write_pos < me.write_buf.len() {
            match Pin::new(&mut me.inner).poll_write(cx, &me.write_buf[me.write_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    me.write_pos += n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                // Input is accepted either way; leftovers drain on the
                // next poll.
                Poll::Pending => break,
            }
        }
        if me.write_pos >= me.write_buf.len() {
            me.write_buf.clear();
            me.write_pos = 0;
        }

        Poll::Ready(Ok(consumed))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();

        let before_out = me.compress.total_out();
        me.tmp_write_out.resize(64, 0);
        me.compress
            .compress(&[], &mut me.tmp_write_out, FlushCompress::Sync)
            .map_err(io::Error::other)?;
        let produced = (me.compress.total_out() - before_out) as usize;
        if produced > 0 {
            me.write_buf
                .extend_from_slice(&me.tmp_write_out[..produced]);
        }

        while me.write_pos < me.write_buf.len() {
            match Pin::new(&mut me.inner).poll_write(cx, &me.write_buf[me.write_pos..]) {
                Poll::Ready(Ok(n)) => {
                    me.write_pos += n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        me.write_buf.clear();
        me.write_pos = 0;

        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

pub enum NntpStream {
    Plain(BufReader<Box<dyn NntpIo>>),
    Tls(Box<BufReader<TlsStream<Box<dyn NntpIo>>>>),
}

pub struct NntpConnection {
    host: String,
    cert_verification: bool,
    tls_config: Option<Arc<ClientConfig>>,
    stream: NntpStream,
    machine: NntpMachine,
    welcome: NntpResponse,
    posting_allowed: bool,
    capabilities: Capabilities,
    nntp_version: u32,
    readermode_afterauth: bool,
    overview_fmt: Option<Vec<String>>,
    outgoing_article: Option<Vec<u8>>,
    desynced: bool,
}

/// Streaming reader over a multi-line data block, yielding dot-unstuffed
/// lines ([RFC 3977 §3.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1.1)).
///
/// The block must be read through to the terminating dot. Dropping the
/// reader early leaves unread block lines on the wire, and the connection
/// rejects further commands rather than misread them as responses.
pub struct BlockReader<'a> {
    conn: &'a mut NntpConnection,
    read_buf: Vec<u8>,
    finished: bool,
}

impl<'a> BlockReader<'a> {
    fn new(conn: &'a mut NntpConnection) -> Self {
        Self {
            conn,
            read_buf: Vec::with_capacity(8192),
            finished: false,
        }
    }

    /// Next line of the block, or `None` at the terminating dot.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, NntpError> {
        self.read_buf.clear();
        let bytes = match &mut self.conn.stream {
            NntpStream::Plain(reader) => read_capped_line(reader, &mut self.read_buf).await?,
            NntpStream::Tls(reader) => read_capped_line(&mut **reader, &mut self.read_buf).await?,
        };

        if bytes == 0 {
            self.conn.machine.handle_input(Input::Eof);
            self.conn.drain_single_event()?;
            return Err(NntpError::ProtocolError("unexpected EOF".into()));
        }

        let trimmed = machine::trim_crlf(&self.read_buf);
        if machine::is_block_terminator(trimmed) {
            self.conn.machine.handle_input(Input::BlockEnd);
            self.conn.drain_single_event()?;
            self.finished = true;
            return Ok(None);
        }

        self.conn.machine.handle_input(Input::BlockLine(trimmed));
        self.conn.drain_block_line()
    }
}

impl Drop for BlockReader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.desynced = true;
        }
    }
}

/// Read one LF-terminated line, failing as soon as it exceeds [`MAX_LINE`]
/// rather than buffering it whole.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, NntpError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let bytes = reader
        .take(MAX_LINE as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if bytes > MAX_LINE {
        return Err(NntpError::DataError("line too long".into()));
    }
    Ok(bytes)
}

impl NntpConnection {
    /// Connect and run the full session preamble: greeting, optional
    /// STARTTLS, capability query, optional MODE READER, optional login.
    ///
    /// Builds a fresh [`ClientConfig`] per call. Prefer
    /// [`connect_with_tls_config`](Self::connect_with_tls_config) when making
    /// repeated connections to the same server so TLS session tickets are
    /// reused ([RFC 8446 §2.2](https://datatracker.ietf.org/doc/html/rfc8446#section-2.2)).
    pub async fn connect(server: &ServerConfig) -> Result<Self, NntpError> {
        Self::connect_with_tls_config(server, None).await
    }

    /// Connect, reusing a pre-built TLS configuration for session
    /// resumption across connections to the same server.
    pub async fn connect_with_tls_config(
        server: &ServerConfig,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> Result<Self, NntpError> {
        let connect = TcpStream::connect((server.host.as_str(), server.port));
        let tcp = match server.timeout() {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| NntpError::Timeout)??,
            None => connect.await?,
        };
        debug!(host = %server.host, port = server.port, "connected");

        let stream = match server.encryption {
            Encryption::Tls => {
                let config = match &tls_config {
                    Some(c) => c.clone(),
                    None => build_tls_config(server.cert_verification)?,
                };
                let tls = tls_connect(Box::new(tcp), &server.host, config).await?;
                NntpStream::Tls(Box::new(BufReader::new(tls)))
            }
            Encryption::StartTls | Encryption::None => {
                NntpStream::Plain(BufReader::new(Box::new(tcp)))
            }
        };

        let mut conn = NntpConnection {
            host: server.host.clone(),
            cert_verification: server.cert_verification,
            tls_config,
            stream,
            machine: NntpMachine::new(),
            welcome: NntpResponse {
                code: 0,
                message: String::new(),
            },
            posting_allowed: false,
            capabilities: Capabilities::default(),
            nntp_version: 1,
            readermode_afterauth: false,
            overview_fmt: None,
            outgoing_article: None,
            desynced: false,
        };
        if server.encryption == Encryption::Tls {
            conn.machine.set_tls_active();
        }
        conn.await_greeting().await?;

        if server.encryption == Encryption::StartTls {
            conn.negotiate_starttls().await?;
        }
        conn.refresh_capabilities().await?;

        // Servers advertising READER are already in reader mode.
        if server.readermode && !conn.capabilities.supports("READER") {
            conn.mode_reader().await?;
        }
        if let Some(username) = &server.username {
            conn.login(username, server.password.as_deref()).await?;
        }
        Ok(conn)
    }

    /// Wrap an established stream and await the server greeting.
    pub async fn from_stream(host: impl Into<String>, stream: NntpStream) -> Result<Self, NntpError> {
        let mut conn = NntpConnection {
            host: host.into(),
            cert_verification: true,
            tls_config: None,
            stream,
            machine: NntpMachine::new(),
            welcome: NntpResponse {
                code: 0,
                message: String::new(),
            },
            posting_allowed: false,
            capabilities: Capabilities::default(),
            nntp_version: 1,
            readermode_afterauth: false,
            overview_fmt: None,
            outgoing_article: None,
            desynced: false,
        };
        conn.await_greeting().await?;
        Ok(conn)
    }

    /// The greeting sent by the server on connect, or the MODE READER
    /// response if one superseded it.
    pub fn welcome(&self) -> &NntpResponse {
        &self.welcome
    }

    /// Whether the server advertised posting permission (code 200).
    pub fn posting_allowed(&self) -> bool {
        self.posting_allowed
    }

    /// Capabilities cached from the most recent CAPABILITIES query.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Protocol version: 2 for RFC 3977 servers advertising VERSION,
    /// otherwise 1.
    pub fn nntp_version(&self) -> u32 {
        self.nntp_version
    }

    pub fn is_authenticated(&self) -> bool {
        self.machine.is_authenticated()
    }

    async fn await_greeting(&mut self) -> Result<(), NntpError> {
        match self.drive_machine().await? {
            Event::GreetingOk(resp) => {
                debug!(code = resp.code, "greeting received");
                self.posting_allowed = resp.code == 200;
                self.welcome = resp;
                Ok(())
            }
            other => Err(NntpError::ProtocolError(format!(
                "unexpected event during greeting: {other:?}"
            ))),
        }
    }

    /// Re-query CAPABILITIES ([RFC 3977 §5.2](https://datatracker.ietf.org/doc/html/rfc3977#section-5.2)).
    ///
    /// A 4xx or 5xx reply means the server predates the command; the
    /// cached set becomes empty rather than an error.
    pub async fn refresh_capabilities(&mut self) -> Result<&Capabilities, NntpError> {
        match self.block_text("CAPABILITIES".to_string()).await {
            Ok((resp, lines)) if resp.code == 101 => {
                self.capabilities = Capabilities::from_lines(&lines);
            }
            Ok((resp, _)) => {
                return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
            }
            Err(
                NntpError::Temporary { .. }
                | NntpError::Permanent { .. }
                | NntpError::AuthRequired,
            ) => {
                self.capabilities = Capabilities::default();
            }
            Err(e) => return Err(e),
        }
        if let Some(version) = self.capabilities.version() {
            self.nntp_version = version;
        }
        debug!(version = self.nntp_version, "capabilities refreshed");
        Ok(&self.capabilities)
    }

    /// Switch the server into reader mode ([RFC 3977 §5.3](https://datatracker.ietf.org/doc/html/rfc3977#section-5.3)).
    ///
    /// A permanent error is ignored (servers without MODE READER); a 480
    /// defers the switch until after authentication.
    pub async fn mode_reader(&mut self) -> Result<(), NntpError> {
        self.machine.request_short("MODE READER");
        match self.drive_machine().await {
            Ok(Event::Response(resp)) if resp.code == 200 || resp.code == 201 => {
                self.posting_allowed = resp.code == 200;
                self.welcome = resp;
                Ok(())
            }
            Ok(Event::Response(resp)) => {
                Err(NntpError::UnexpectedResponse(resp.code, resp.message))
            }
            Ok(other) => Err(unexpected_event("MODE READER", other)),
            Err(NntpError::Permanent { .. }) => Ok(()),
            Err(NntpError::AuthRequired) => {
                self.readermode_afterauth = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Authenticate with AUTHINFO USER/PASS ([RFC 4643 §2.3](https://datatracker.ietf.org/doc/html/rfc4643#section-2.3)).
    ///
    /// Capabilities change after authentication and are re-queried; a
    /// deferred MODE READER is retried.
    pub async fn login(&mut self, username: &str, password: Option<&str>) -> Result<(), NntpError> {
        if self.machine.is_authenticated() {
            return Err(NntpError::ProtocolError("already authenticated".into()));
        }
        self.machine.request_auth(username, password);
        match self.drive_machine().await {
            Ok(Event::Authenticated(_)) => {}
            Ok(other) => return Err(unexpected_event("AUTHINFO", other)),
            Err(
                NntpError::Temporary { message, .. }
                | NntpError::Permanent { message, .. }
                | NntpError::UnexpectedResponse(_, message),
            ) => return Err(NntpError::AuthFailed(message)),
            Err(e) => return Err(e),
        }
        debug!(username, "authenticated");
        self.refresh_capabilities().await?;
        if self.readermode_afterauth {
            self.readermode_afterauth = false;
            self.mode_reader().await?;
        }
        Ok(())
    }

    /// Upgrade the session to TLS ([RFC 4642](https://datatracker.ietf.org/doc/html/rfc4642)).
    ///
    /// No new greeting follows the handshake; capabilities are re-queried
    /// since they may differ on the secured session.
    pub async fn starttls(&mut self) -> Result<(), NntpError> {
        self.negotiate_starttls().await?;
        self.refresh_capabilities().await?;
        Ok(())
    }

    async fn negotiate_starttls(&mut self) -> Result<(), NntpError> {
        self.machine.request_starttls();
        match self.drive_machine().await? {
            Event::TlsActive => Ok(()),
            other => Err(unexpected_event("STARTTLS", other)),
        }
    }

    /// Enable DEFLATE compression ([RFC 8054](https://datatracker.ietf.org/doc/html/rfc8054)).
    ///
    /// On success (206) the connection is transparently wrapped in a raw
    /// DEFLATE ([RFC 1951](https://datatracker.ietf.org/doc/html/rfc1951))
    /// layer; all subsequent traffic is compressed.
    pub async fn compress(&mut self) -> Result<(), NntpError> {
        self.machine.request_compress();
        match self.drive_machine().await? {
            Event::CompressActive => Ok(()),
            other => Err(unexpected_event("COMPRESS DEFLATE", other)),
        }
    }

    /// Select a newsgroup ([RFC 3977 §6.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-6.1.1)).
    ///
    /// The 211 line is parsed leniently: servers in the wild omit fields,
    /// which default to zero.
    pub async fn group(&mut self, name: &str) -> Result<GroupSummary, NntpError> {
        let resp = self.short_command(format!("GROUP {name}")).await?;
        if resp.code != 211 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        Ok(parse_group_summary(name, &resp))
    }

    /// List article numbers in a group ([RFC 3977 §6.1.2](https://datatracker.ietf.org/doc/html/rfc3977#section-6.1.2)).
    pub async fn listgroup(&mut self, name: Option<&str>) -> Result<Vec<u64>, NntpError> {
        let command = match name {
            Some(name) => format!("LISTGROUP {name}"),
            None => "LISTGROUP".to_string(),
        };
        let (resp, lines) = self.block_text(command).await?;
        if resp.code != 211 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        lines
            .iter()
            .map(|line| {
                line.trim().parse().map_err(|_| {
                    NntpError::DataError(format!("invalid article number: {line}"))
                })
            })
            .collect()
    }

    /// List active newsgroups ([RFC 3977 §7.6.3](https://datatracker.ietf.org/doc/html/rfc3977#section-7.6.3)),
    /// optionally narrowed by a wildmat pattern.
    pub async fn list(&mut self, pattern: Option<&str>) -> Result<Vec<GroupListing>, NntpError> {
        let command = match pattern {
            Some(pattern) => format!("LIST ACTIVE {pattern}"),
            None => "LIST".to_string(),
        };
        let (resp, lines) = self.block_text(command).await?;
        if resp.code != 215 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        lines.iter().map(|l| parse_group_listing(l)).collect()
    }

    /// Newsgroup descriptions via LIST NEWSGROUPS
    /// ([RFC 3977 §7.6.6](https://datatracker.ietf.org/doc/html/rfc3977#section-7.6.6)),
    /// falling back to the legacy XGTITLE command (RFC 2980 §2.6) on
    /// servers that lack it.
    pub async fn descriptions(
        &mut self,
        pattern: &str,
    ) -> Result<Vec<(String, String)>, NntpError> {
        let lines = match self.block_text(format!("LIST NEWSGROUPS {pattern}")).await {
            Ok((resp, lines)) if resp.code == 215 => lines,
            Ok(_) | Err(NntpError::Temporary { .. }) | Err(NntpError::Permanent { .. }) => {
                let (resp, lines) = self.block_text(format!("XGTITLE {pattern}")).await?;
                if resp.code != 282 {
                    return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
                }
                lines
            }
            Err(e) => return Err(e),
        };

        Ok(lines
            .iter()
            .filter_map(|line| {
                let (name, desc) = line.split_once([' ', '\t'])?;
                Some((name.to_string(), desc.trim_start().to_string()))
            })
            .collect())
    }

    /// Description of a single group, empty when the server has none.
    pub async fn description(&mut self, group: &str) -> Result<String, NntpError> {
        let all = self.descriptions(group).await?;
        Ok(all
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(group))
            .map(|(_, desc)| desc)
            .unwrap_or_default())
    }

    /// Groups created since `since` ([RFC 3977 §7.3](https://datatracker.ietf.org/doc/html/rfc3977#section-7.3)).
    pub async fn newgroups(&mut self, since: NaiveDateTime) -> Result<Vec<GroupListing>, NntpError> {
        let (date, time) = wire::format_timestamp(since, self.nntp_version < 2);
        let (resp, lines) = self.block_text(format!("NEWGROUPS {date} {time}")).await?;
        if resp.code != 231 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        lines.iter().map(|l| parse_group_listing(l)).collect()
    }

    /// Message-ids of articles posted to `group` since `since`
    /// ([RFC 3977 §7.4](https://datatracker.ietf.org/doc/html/rfc3977#section-7.4)).
    pub async fn newnews(
        &mut self,
        group: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<String>, NntpError> {
        let (date, time) = wire::format_timestamp(since, self.nntp_version < 2);
        let (resp, lines) = self
            .block_text(format!("NEWNEWS {group} {date} {time}"))
            .await?;
        if resp.code != 230 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        Ok(lines)
    }

    /// Check article existence without fetching it
    /// ([RFC 3977 §6.2.4](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.4)).
    pub async fn stat(&mut self, spec: ArticleSpec) -> Result<ArticleStat, NntpError> {
        let mut command = String::from("STAT");
        spec.append_to(&mut command);
        let resp = self
            .short_command(command)
            .await
            .map_err(|e| map_missing(e, &spec))?;
        parse_stat(&resp)
    }

    /// Advance the current article pointer ([RFC 3977 §6.1.4](https://datatracker.ietf.org/doc/html/rfc3977#section-6.1.4)).
    pub async fn next(&mut self) -> Result<ArticleStat, NntpError> {
        let resp = self.short_command("NEXT".to_string()).await?;
        parse_stat(&resp)
    }

    /// Move the current article pointer back ([RFC 3977 §6.1.3](https://datatracker.ietf.org/doc/html/rfc3977#section-6.1.3)).
    pub async fn last(&mut self) -> Result<ArticleStat, NntpError> {
        let resp = self.short_command("LAST".to_string()).await?;
        parse_stat(&resp)
    }

    /// Fetch a whole article ([RFC 3977 §6.2.1](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.1)).
    pub async fn article(&mut self, spec: ArticleSpec) -> Result<Article, NntpError> {
        self.fetch_article("ARTICLE", 220, spec).await
    }

    /// Fetch only the headers ([RFC 3977 §6.2.2](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.2)).
    pub async fn head(&mut self, spec: ArticleSpec) -> Result<Article, NntpError> {
        self.fetch_article("HEAD", 221, spec).await
    }

    /// Fetch only the body ([RFC 3977 §6.2.3](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.3)).
    pub async fn body(&mut self, spec: ArticleSpec) -> Result<Article, NntpError> {
        self.fetch_article("BODY", 222, spec).await
    }

    /// Stream an article body line by line instead of collecting it.
    pub async fn body_reader(&mut self, spec: ArticleSpec) -> Result<BlockReader<'_>, NntpError> {
        let mut command = String::from("BODY");
        spec.append_to(&mut command);
        let resp = self
            .begin_block(command)
            .await
            .map_err(|e| map_missing(e, &spec))?;
        if resp.code != 222 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        Ok(BlockReader::new(self))
    }

    async fn fetch_article(
        &mut self,
        verb: &str,
        expect: u16,
        spec: ArticleSpec,
    ) -> Result<Article, NntpError> {
        let mut command = String::from(verb);
        spec.append_to(&mut command);
        let (resp, lines) = self
            .block_command(command)
            .await
            .map_err(|e| map_missing(e, &spec))?;
        if resp.code != expect {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        let stat = parse_stat(&resp)?;
        Ok(Article {
            number: stat.number,
            message_id: stat.message_id,
            lines,
        })
    }

    /// Fetch overview data ([RFC 3977 §8.3](https://datatracker.ietf.org/doc/html/rfc3977#section-8.3)),
    /// using OVER when advertised and falling back to XOVER (RFC 2980 §2.8).
    pub async fn over(&mut self, spec: OverSpec) -> Result<Vec<OverviewEntry>, NntpError> {
        let mut command = if self.capabilities.supports("OVER") {
            String::from("OVER")
        } else {
            String::from("XOVER")
        };
        spec.append_to(&mut command);
        let (resp, lines) = self.block_text(command).await?;
        if resp.code != 224 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        let fmt = self.overview_format().await?;
        overview::parse_overview(&lines, &fmt)
    }

    /// Fetch one header across a range with XHDR (RFC 2980 §2.6).
    ///
    /// Each line pairs an article number (or message-id) with the header
    /// value.
    pub async fn xhdr(
        &mut self,
        header: &str,
        range: &str,
    ) -> Result<Vec<(String, String)>, NntpError> {
        let (resp, lines) = self.block_text(format!("XHDR {header} {range}")).await?;
        if resp.code != 221 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        Ok(lines
            .iter()
            .map(|line| match line.split_once(' ') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (line.clone(), String::new()),
            })
            .collect())
    }

    /// Overview field order from LIST OVERVIEW.FMT, cached for the
    /// session. Servers without the command get the RFC 3977 default.
    async fn overview_format(&mut self) -> Result<Vec<String>, NntpError> {
        if let Some(fmt) = &self.overview_fmt {
            return Ok(fmt.clone());
        }
        let fmt = match self.block_text("LIST OVERVIEW.FMT".to_string()).await {
            Ok((resp, lines)) if resp.code == 215 => overview::parse_overview_fmt(&lines)?,
            Ok((resp, _)) => return Err(NntpError::UnexpectedResponse(resp.code, resp.message)),
            Err(
                NntpError::Temporary { .. }
                | NntpError::Permanent { .. }
                | NntpError::AuthRequired,
            ) => overview::default_overview_fmt(),
            Err(e) => return Err(e),
        };
        self.overview_fmt = Some(fmt.clone());
        Ok(fmt)
    }

    /// Server clock as a naive UTC timestamp ([RFC 3977 §7.1](https://datatracker.ietf.org/doc/html/rfc3977#section-7.1)).
    pub async fn date(&mut self) -> Result<NaiveDateTime, NntpError> {
        let resp = self.short_command("DATE".to_string()).await?;
        if resp.code != 111 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        let stamp = resp
            .message
            .split_whitespace()
            .next()
            .unwrap_or_default();
        if stamp.len() != 14 {
            return Err(NntpError::DataError(format!(
                "invalid DATE response: {}",
                resp.message
            )));
        }
        wire::parse_timestamp(stamp, None)
    }

    /// Server help text ([RFC 3977 §7.2](https://datatracker.ietf.org/doc/html/rfc3977#section-7.2)).
    pub async fn help(&mut self) -> Result<Vec<String>, NntpError> {
        let (resp, lines) = self.block_text("HELP".to_string()).await?;
        if resp.code != 100 {
            return Err(NntpError::UnexpectedResponse(resp.code, resp.message));
        }
        Ok(lines)
    }

    /// Legacy SLAVE command (RFC 977 §3.12); a no-op on modern servers.
    pub async fn slave(&mut self) -> Result<NntpResponse, NntpError> {
        self.short_command("SLAVE".to_string()).await
    }

    /// Post an article ([RFC 3977 §6.3.1](https://datatracker.ietf.org/doc/html/rfc3977#section-6.3.1)).
    ///
    /// Lines are CRLF-normalized and dot-stuffed before transmission.
    pub async fn post(&mut self, article: &[u8]) -> Result<NntpResponse, NntpError> {
        self.deposit("POST".to_string(), article).await
    }

    /// Offer an article to the server ([RFC 3977 §6.3.2](https://datatracker.ietf.org/doc/html/rfc3977#section-6.3.2)).
    pub async fn ihave(
        &mut self,
        message_id: &str,
        article: &[u8],
    ) -> Result<NntpResponse, NntpError> {
        let mut command = String::from("IHAVE");
        ArticleSpec::from(message_id).append_to(&mut command);
        self.deposit(command, article).await
    }

    async fn deposit(&mut self, command: String, article: &[u8]) -> Result<NntpResponse, NntpError> {
        self.outgoing_article = Some(dot_stuff(article));
        self.machine.request_deposit(command);
        let result = self.drive_machine().await;
        self.outgoing_article = None;
        match result? {
            Event::Response(resp) => Ok(resp),
            other => Err(unexpected_event("article deposit", other)),
        }
    }

    /// Gracefully close the connection ([RFC 3977 §5.4](https://datatracker.ietf.org/doc/html/rfc3977#section-5.4)).
    pub async fn quit(&mut self) -> Result<(), NntpError> {
        self.machine.request_quit();
        let _ = self.drive_machine().await;
        Ok(())
    }

    async fn short_command(&mut self, command: String) -> Result<NntpResponse, NntpError> {
        self.machine.request_short(command);
        match self.drive_machine().await? {
            Event::Response(resp) => Ok(resp),
            other => Err(unexpected_event("command", other)),
        }
    }

    async fn block_command(
        &mut self,
        command: String,
    ) -> Result<(NntpResponse, Vec<Vec<u8>>), NntpError> {
        let resp = self.begin_block(command).await?;
        let mut lines = Vec::new();
        let mut reader = BlockReader::new(self);
        while let Some(line) = reader.read_line().await? {
            lines.push(line);
        }
        Ok((resp, lines))
    }

    async fn block_text(&mut self, command: String) -> Result<(NntpResponse, Vec<String>), NntpError> {
        let (resp, lines) = self.block_command(command).await?;
        let text = lines
            .into_iter()
            .map(|l| String::from_utf8_lossy(&l).into_owned())
            .collect();
        Ok((resp, text))
    }

    async fn drive_machine(&mut self) -> Result<Event, NntpError> {
        self.check_sync()?;
        loop {
            match self.machine.poll_output() {
                Some(Output::SendCommand(cmd)) => {
                    self.send_raw(&cmd).await?;
                }
                Some(Output::NeedResponseLine) => {
                    let line = self.read_response_line().await?;
                    self.machine.handle_input(Input::ResponseLine(&line));
                }
                Some(Output::NeedBlockLine) => {
                    return Err(NntpError::ProtocolError(
                        "unexpected NeedBlockLine in drive_machine".into(),
                    ));
                }
                Some(Output::SendArticle) => {
                    let article = self.outgoing_article.take().ok_or_else(|| {
                        NntpError::ProtocolError("no article queued for deposit".into())
                    })?;
                    self.write_raw(&article).await?;
                    self.machine.article_sent();
                }
                Some(Output::UpgradeToTls) => {
                    self.do_tls_upgrade().await?;
                }
                Some(Output::UpgradeToDeflate) => {
                    self.do_deflate_upgrade()?;
                }
                Some(Output::Event(Event::Error(e))) => {
                    return Err(proto_to_nntp(e));
                }
                Some(Output::Event(event)) => {
                    return Ok(event);
                }
                None => {
                    return Err(NntpError::ProtocolError(
                        "machine produced no output".into(),
                    ));
                }
            }
        }
    }

    /// Send a block command and drive until the block's first line is
    /// wanted, returning the initial status line.
    async fn begin_block(&mut self, command: String) -> Result<NntpResponse, NntpError> {
        self.check_sync()?;
        self.machine.request_block(command);
        let mut started = None;
        loop {
            match self.machine.poll_output() {
                Some(Output::SendCommand(cmd)) => {
                    self.send_raw(&cmd).await?;
                }
                Some(Output::NeedResponseLine) => {
                    let line = self.read_response_line().await?;
                    self.machine.handle_input(Input::ResponseLine(&line));
                }
                Some(Output::Event(Event::BlockStarted(resp))) => {
                    started = Some(resp);
                }
                Some(Output::NeedBlockLine) => {
                    return started.ok_or_else(|| {
                        NntpError::ProtocolError("block requested before status line".into())
                    });
                }
                Some(Output::Event(Event::Error(e))) => {
                    return Err(proto_to_nntp(e));
                }
                Some(Output::Event(other)) => {
                    return Err(unexpected_event("block command", other));
                }
                Some(other) => {
                    return Err(NntpError::ProtocolError(format!(
                        "unexpected output awaiting block: {other:?}"
                    )));
                }
                None => {
                    return Err(NntpError::ProtocolError(
                        "machine produced no output".into(),
                    ));
                }
            }
        }
    }

    fn check_sync(&self) -> Result<(), NntpError> {
        if self.desynced {
            return Err(NntpError::ProtocolError(
                "connection out of sync: a data block was dropped before its terminator".into(),
            ));
        }
        Ok(())
    }

    fn drain_single_event(&mut self) -> Result<Event, NntpError> {
        loop {
            match self.machine.poll_output() {
                Some(Output::Event(Event::Error(e))) => return Err(proto_to_nntp(e)),
                Some(Output::Event(event)) => return Ok(event),
                Some(Output::NeedBlockLine) => continue,
                Some(other) => {
                    return Err(NntpError::ProtocolError(format!(
                        "unexpected output while draining event: {other:?}"
                    )));
                }
                None => {
                    return Err(NntpError::ProtocolError("no event produced".into()));
                }
            }
        }
    }

    fn drain_block_line(&mut self) -> Result<Option<Vec<u8>>, NntpError> {
        let mut result = None;
        while let Some(output) = self.machine.poll_output() {
            match output {
                Output::Event(Event::BlockLine(data)) => {
                    result = Some(data);
                }
                Output::Event(Event::BlockEnd) => return Ok(None),
                Output::Event(Event::Error(e)) => return Err(proto_to_nntp(e)),
                Output::NeedBlockLine => {
                    break;
                }
                other => {
                    return Err(NntpError::ProtocolError(format!(
                        "unexpected output in block drain: {other:?}"
                    )));
                }
            }
        }
        Ok(result)
    }

    async fn send_raw(&mut self, cmd: &str) -> Result<(), NntpError> {
        if cmd.starts_with("AUTHINFO PASS") {
            trace!(command = "AUTHINFO PASS [redacted]", "send");
        } else {
            trace!(command = cmd, "send");
        }
        let line = format!("{cmd}\r\n");
        self.write_raw(line.as_bytes()).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), NntpError> {
        match &mut self.stream {
            NntpStream::Plain(s) => s.get_mut().write_all(data).await?,
            NntpStream::Tls(s) => s.get_mut().write_all(data).await?,
        }
        Ok(())
    }

    // Status text is decoded lossily; only block payloads keep raw bytes.
    async fn read_response_line(&mut self) -> Result<String, NntpError> {
        let mut buf = Vec::new();
        let bytes = match &mut self.stream {
            NntpStream::Plain(s) => read_capped_line(s, &mut buf).await?,
            NntpStream::Tls(s) => read_capped_line(&mut **s, &mut buf).await?,
        };
        if bytes == 0 {
            return Err(NntpError::ProtocolError("empty response".into()));
        }
        let line = String::from_utf8_lossy(machine::trim_crlf(&buf)).into_owned();
        trace!(response = %line, "recv");
        Ok(line)
    }

    fn do_deflate_upgrade(&mut self) -> Result<(), NntpError> {
        let old = std::mem::replace(
            &mut self.stream,
            NntpStream::Plain(BufReader::new(
                Box::new(tokio::io::empty()) as Box<dyn NntpIo>
            )),
        );

        match old {
            NntpStream::Plain(buf_reader) => {
                let buffered = buf_reader.buffer().to_vec();
                let inner = buf_reader.into_inner();
                let deflate = DeflateStream::new_with_buffered(inner, &buffered);
                self.stream = NntpStream::Plain(BufReader::new(Box::new(deflate)));
                Ok(())
            }
            NntpStream::Tls(buf_reader) => {
                let buffered = buf_reader.buffer().to_vec();
                let inner = buf_reader.into_inner();
                let deflate =
                    DeflateStream::new_with_buffered(Box::new(inner) as Box<dyn NntpIo>, &buffered);
                self.stream = NntpStream::Plain(BufReader::new(Box::new(deflate)));
                Ok(())
            }
        }
    }

    async fn do_tls_upgrade(&mut self) -> Result<(), NntpError> {
        let old = std::mem::replace(
            &mut self.stream,
            NntpStream::Plain(BufReader::new(
                Box::new(tokio::io::empty()) as Box<dyn NntpIo>
            )),
        );

        match old {
            NntpStream::Plain(buf_reader) => {
                let inner = buf_reader.into_inner();
                let config = match &self.tls_config {
                    Some(c) => c.clone(),
                    None => build_tls_config(self.cert_verification)?,
                };
                let host = self.host.clone();
                let tls = tls_connect(inner, &host, config).await?;
                self.stream = NntpStream::Tls(Box::new(BufReader::new(tls)));
                Ok(())
            }
            NntpStream::Tls(_) => Err(NntpError::TlsError("already using TLS".into())),
        }
    }
}

fn unexpected_event(context: &str, event: Event) -> NntpError {
    NntpError::ProtocolError(format!("unexpected event from {context}: {event:?}"))
}

fn proto_to_nntp(e: ProtoError) -> NntpError {
    match e {
        ProtoError::Temporary { code: 480, .. } => NntpError::AuthRequired,
        ProtoError::Temporary { code, message } => NntpError::Temporary { code, message },
        ProtoError::Permanent { code, message } => NntpError::Permanent { code, message },
        ProtoError::UnexpectedResponse(code, msg) => NntpError::UnexpectedResponse(code, msg),
        ProtoError::ProtocolError(msg) => NntpError::ProtocolError(msg),
    }
}

/// 423 and 430 both mean the requested article does not exist.
fn map_missing(e: NntpError, spec: &ArticleSpec) -> NntpError {
    match e {
        NntpError::Temporary {
            code: 420 | 423 | 430, ..
        } => NntpError::ArticleNotFound(spec.to_string()),
        other => other,
    }
}

fn parse_stat(resp: &NntpResponse) -> Result<ArticleStat, NntpError> {
    if !(220..=229).contains(&resp.code) {
        return Err(NntpError::UnexpectedResponse(
            resp.code,
            resp.message.clone(),
        ));
    }
    let mut words = resp.message.split_whitespace();
    let number = words
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| NntpError::DataError(format!("invalid status line: {}", resp.message)))?;
    let message_id = words
        .next()
        .ok_or_else(|| NntpError::DataError(format!("invalid status line: {}", resp.message)))?
        .to_string();
    Ok(ArticleStat { number, message_id })
}

fn parse_group_summary(requested: &str, resp: &NntpResponse) -> GroupSummary {
    let words: Vec<&str> = resp.message.split_whitespace().collect();
    let num = |i: usize| words.get(i).and_then(|w| w.parse().ok()).unwrap_or(0);
    GroupSummary {
        count: num(0),
        first: num(1),
        last: num(2),
        name: words
            .get(3)
            .map(|w| w.to_ascii_lowercase())
            .unwrap_or_else(|| requested.to_ascii_lowercase()),
    }
}

fn parse_group_listing(line: &str) -> Result<GroupListing, NntpError> {
    let mut words = line.split_whitespace();
    let bad = || NntpError::DataError(format!("invalid group line: {line}"));
    let name = words.next().ok_or_else(bad)?.to_string();
    let high = words.next().and_then(|w| w.parse().ok()).ok_or_else(bad)?;
    let low = words.next().and_then(|w| w.parse().ok()).ok_or_else(bad)?;
    let flag = words.next().unwrap_or("").to_string();
    Ok(GroupListing {
        name,
        high,
        low,
        flag,
    })
}

/// CRLF-normalize and dot-stuff an outgoing article, appending the
/// terminating dot line ([RFC 3977 §3.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1.1)).
fn dot_stuff(article: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(article.len() + 16);
    let mut segments = article.split(|&b| b == b'\n').peekable();
    while let Some(segment) = segments.next() {
        // A trailing newline yields one empty final segment; skip it.
        if segments.peek().is_none() && segment.is_empty() {
            break;
        }
        let line = match segment.last() {
            Some(b'\r') => &segment[..segment.len() - 1],
            _ => segment,
        };
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Build a shared TLS [`ClientConfig`] suitable for reuse across
/// connections. rustls stores session tickets inside the config, so a
/// shared `Arc<ClientConfig>` lets later handshakes resume
/// ([RFC 8446 §2.2](https://datatracker.ietf.org/doc/html/rfc8446#section-2.2)).
///
/// When `cert_verification` is `false`, a no-op verifier is installed
/// (useful for servers with self-signed certificates).
pub fn build_tls_config(cert_verification: bool) -> Result<Arc<ClientConfig>, NntpError> {
    let provider = rustls::crypto::ring::default_provider();
    let _ = provider.clone().install_default();

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = if cert_verification {
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

async fn tls_connect(
    io: Box<dyn NntpIo>,
    hostname: &str,
    tls_config: Arc<ClientConfig>,
) -> Result<TlsStream<Box<dyn NntpIo>>, NntpError> {
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| NntpError::TlsError(format!("invalid hostname: {hostname}")))?;

    connector
        .connect(server_name, io)
        .await
        .map_err(|e| NntpError::TlsError(e.to_string()))
}

#[derive(Debug)]
struct NoVerifier {
    supported_schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerifier {
    fn new() -> Self {
        let schemes = rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes();
        Self {
            supported_schemes: schemes,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_schemes.clone()
    }
}
