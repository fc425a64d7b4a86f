//! Fixture-driven NNTP server stub for integration tests.
//!
//! Speaks enough of RFC 3977 (plus XOVER/XHDR/XGTITLE from RFC 2980) to
//! exercise a reader client end to end. Articles and groups come from a
//! JSON fixture file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Debug, Deserialize, Clone)]
pub struct FixtureConfig {
    pub greeting: Option<String>,
    pub groups: HashMap<String, GroupConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    #[serde(default)]
    pub description: String,
    pub articles: Vec<ArticleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArticleConfig {
    pub number: u64,
    pub message_id: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ArticleConfig {
    fn header(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }
}

impl GroupConfig {
    fn by_number(&self, number: u64) -> Option<&ArticleConfig> {
        self.articles.iter().find(|a| a.number == number)
    }

    fn by_message_id(&self, id: &str) -> Option<&ArticleConfig> {
        let bare = id.trim_matches(['<', '>']);
        self.articles
            .iter()
            .find(|a| a.message_id.trim_matches(['<', '>']) == bare)
    }

    fn low(&self) -> u64 {
        self.articles.iter().map(|a| a.number).min().unwrap_or(0)
    }

    fn high(&self) -> u64 {
        self.articles.iter().map(|a| a.number).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct StubConfig {
    pub bind: SocketAddr,
    pub fixtures_path: PathBuf,
    pub require_auth: bool,
    pub username: String,
    pub password: String,
    pub disconnect_after: usize,
    pub delay_ms: u64,
}

#[derive(Debug)]
struct SessionState {
    authenticated: bool,
    current_group: Option<String>,
    current_article: Option<u64>,
    commands_seen: usize,
}

#[derive(Clone)]
pub struct StubServer {
    state: Arc<ServerState>,
}

impl StubServer {
    pub fn new(config: StubConfig, fixtures: FixtureConfig) -> Self {
        Self {
            state: Arc::new(ServerState::new(config, fixtures)),
        }
    }

    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.state.config.bind).await?;
        loop {
            let (stream, _) = listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(err) = handle_client(stream, state).await {
                    eprintln!("client error: {err}");
                }
            });
        }
    }

    pub async fn serve_once(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.state.config.bind).await?;
        let (stream, _) = listener.accept().await?;
        handle_client(stream, Arc::clone(&self.state)).await?;
        Ok(())
    }

    /// Serve a fixed number of connections, then stop.
    pub async fn serve_for(
        self,
        max_connections: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.state.config.bind).await?;
        let mut handles = Vec::new();
        for _ in 0..max_connections {
            let (stream, _) = listener.accept().await?;
            let state = Arc::clone(&self.state);
            handles.push(tokio::spawn(async move {
                if let Err(err) = handle_client(stream, state).await {
                    eprintln!("client error: {err}");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Articles accepted via POST or IHAVE, one `Vec<String>` of
    /// unstuffed lines per article.
    pub async fn posted_articles(&self) -> Vec<Vec<String>> {
        self.state.posted.lock().await.clone()
    }
}

struct ServerState {
    config: StubConfig,
    fixtures: FixtureConfig,
    posted: Mutex<Vec<Vec<String>>>,
}

impl ServerState {
    fn new(config: StubConfig, fixtures: FixtureConfig) -> Self {
        Self {
            config,
            fixtures,
            posted: Mutex::new(Vec::new()),
        }
    }
}

pub fn load_fixtures(
    path: &Path,
) -> Result<FixtureConfig, Box<dyn std::error::Error + Send + Sync>> {
    let data = std::fs::read_to_string(path)?;
    let fixtures = serde_json::from_str(&data)?;
    Ok(fixtures)
}

type StubResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

async fn handle_client(stream: TcpStream, state: Arc<ServerState>) -> StubResult {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let greeting = state
        .fixtures
        .greeting
        .clone()
        .unwrap_or_else(|| "200 lapsang test server ready".to_string());
    writer
        .write_all(format!("{greeting}\r\n").as_bytes())
        .await?;

    let mut session = SessionState {
        authenticated: !state.config.require_auth,
        current_group: None,
        current_article: None,
        commands_seen: 0,
    };

    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            break;
        }

        let command_line = line.trim();
        if command_line.is_empty() {
            continue;
        }

        session.commands_seen += 1;
        maybe_delay(&state.config).await;
        if should_disconnect(&state.config, &session) {
            return Ok(());
        }

        let mut parts = command_line.split_whitespace();
        let command = parts.next().unwrap_or("").to_uppercase();
        let args: Vec<&str> = parts.collect();
        match command.as_str() {
            "QUIT" => {
                writer.write_all(b"205 closing connection\r\n").await?;
                break;
            }
            "CAPABILITIES" => {
                if !session.authenticated {
                    writer.write_all(b"480 authentication required\r\n").await?;
                    continue;
                }
                let lines = [
                    "VERSION 2",
                    "READER",
                    "OVER MSGID",
                    "POST",
                    "IHAVE",
                    "NEWNEWS",
                    "LIST ACTIVE NEWSGROUPS OVERVIEW.FMT",
                ];
                writer.write_all(b"101 capability list follows\r\n").await?;
                send_block(lines.iter().map(|s| s.to_string()).collect(), &mut writer).await?;
            }
            "MODE" => {
                if args.first().is_some_and(|a| a.eq_ignore_ascii_case("READER")) {
                    if !session.authenticated {
                        writer.write_all(b"480 authentication required\r\n").await?;
                    } else {
                        writer.write_all(b"200 posting allowed\r\n").await?;
                    }
                } else {
                    writer.write_all(b"501 syntax error\r\n").await?;
                }
            }
            "AUTHINFO" => {
                handle_authinfo(&args, &state, &mut session, &mut writer).await?;
            }
            "GROUP" => {
                handle_group(args.first().copied().unwrap_or(""), &state, &mut session, &mut writer)
                    .await?;
            }
            "LISTGROUP" => {
                handle_listgroup(args.first().copied(), &state, &mut session, &mut writer).await?;
            }
            "LIST" => {
                handle_list(&args, &state, &session, &mut writer).await?;
            }
            "STAT" | "ARTICLE" | "HEAD" | "BODY" => {
                handle_article(&command, &args, &state, &mut session, &mut writer).await?;
            }
            "NEXT" | "LAST" => {
                handle_pointer_move(&command, &state, &mut session, &mut writer).await?;
            }
            "OVER" | "XOVER" => {
                handle_over(&args, &state, &session, &mut writer).await?;
            }
            "XHDR" => {
                handle_xhdr(&args, &state, &session, &mut writer).await?;
            }
            "NEWGROUPS" => {
                handle_newgroups(&state, &session, &mut writer).await?;
            }
            "NEWNEWS" => {
                handle_newnews(args.first().copied().unwrap_or("*"), &state, &session, &mut writer)
                    .await?;
            }
            "DATE" => {
                let now = chrono::Utc::now().format("%Y%m%d%H%M%S");
                writer.write_all(format!("111 {now}\r\n").as_bytes()).await?;
            }
            "POST" | "IHAVE" => {
                handle_deposit(&command, &state, &session, &mut reader, &mut writer).await?;
            }
            "XGTITLE" => {
                handle_xgtitle(args.first().copied().unwrap_or("*"), &state, &mut writer).await?;
            }
            "HELP" => {
                writer.write_all(b"100 help text follows\r\n").await?;
                send_block(
                    vec!["Supported commands: GROUP, ARTICLE, OVER, POST, QUIT".to_string()],
                    &mut writer,
                )
                .await?;
            }
            "SLAVE" => {
                writer.write_all(b"202 slave status noted\r\n").await?;
            }
            _ => {
                writer.write_all(b"500 command not recognized\r\n").await?;
            }
        }
    }

    Ok(())
}

async fn handle_authinfo(
    args: &[&str],
    state: &Arc<ServerState>,
    session: &mut SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if args.len() < 2 {
        writer.write_all(b"501 syntax error\r\n").await?;
        return Ok(());
    }

    let verb = args[0].to_uppercase();
    let value = args[1];

    match verb.as_str() {
        "USER" => {
            if value == state.config.username {
                writer.write_all(b"381 password required\r\n").await?;
            } else {
                writer.write_all(b"481 authentication rejected\r\n").await?;
            }
        }
        "PASS" => {
            if value == state.config.password {
                session.authenticated = true;
                writer.write_all(b"281 authentication accepted\r\n").await?;
            } else {
                writer.write_all(b"481 authentication rejected\r\n").await?;
            }
        }
        _ => {
            writer.write_all(b"501 syntax error\r\n").await?;
        }
    }

    Ok(())
}

async fn handle_group(
    group: &str,
    state: &Arc<ServerState>,
    session: &mut SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }

    if let Some(config) = state.fixtures.groups.get(group) {
        session.current_group = Some(group.to_string());
        session.current_article = config.articles.first().map(|a| a.number);
        let count = config.articles.len();
        let response = format!("211 {count} {} {} {group}\r\n", config.low(), config.high());
        writer.write_all(response.as_bytes()).await?;
    } else {
        writer.write_all(b"411 no such group\r\n").await?;
    }

    Ok(())
}

async fn handle_listgroup(
    group: Option<&str>,
    state: &Arc<ServerState>,
    session: &mut SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }

    let name = match group.or(session.current_group.as_deref()) {
        Some(name) => name.to_string(),
        None => {
            writer.write_all(b"412 no newsgroup selected\r\n").await?;
            return Ok(());
        }
    };

    let Some(config) = state.fixtures.groups.get(&name) else {
        writer.write_all(b"411 no such group\r\n").await?;
        return Ok(());
    };

    session.current_group = Some(name.clone());
    session.current_article = config.articles.first().map(|a| a.number);
    let count = config.articles.len();
    writer
        .write_all(format!("211 {count} {} {} {name}\r\n", config.low(), config.high()).as_bytes())
        .await?;
    send_block(
        config.articles.iter().map(|a| a.number.to_string()).collect(),
        writer,
    )
    .await?;
    Ok(())
}

async fn handle_list(
    args: &[&str],
    state: &Arc<ServerState>,
    session: &SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }

    let keyword = args.first().map(|a| a.to_uppercase());
    let pattern = args.get(1).copied().unwrap_or("*");
    match keyword.as_deref() {
        None | Some("ACTIVE") => {
            writer.write_all(b"215 list of newsgroups follows\r\n").await?;
            let lines = state
                .fixtures
                .groups
                .iter()
                .filter(|(name, _)| wildmat(pattern, name))
                .map(|(name, g)| format!("{name} {} {} y", g.high(), g.low()));
            send_block(lines.collect(), writer).await?;
        }
        Some("NEWSGROUPS") => {
            writer.write_all(b"215 descriptions follow\r\n").await?;
            let lines = state
                .fixtures
                .groups
                .iter()
                .filter(|(name, _)| wildmat(pattern, name))
                .map(|(name, g)| format!("{name}\t{}", g.description));
            send_block(lines.collect(), writer).await?;
        }
        Some("OVERVIEW.FMT") => {
            writer.write_all(b"215 order of fields\r\n").await?;
            let lines = [
                "Subject:",
                "From:",
                "Date:",
                "Message-ID:",
                "References:",
                ":bytes",
                ":lines",
            ];
            send_block(lines.iter().map(|s| s.to_string()).collect(), writer).await?;
        }
        _ => {
            writer.write_all(b"501 unknown LIST keyword\r\n").await?;
        }
    }
    Ok(())
}

async fn handle_article(
    verb: &str,
    args: &[&str],
    state: &Arc<ServerState>,
    session: &mut SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }

    let Some(group) = session
        .current_group
        .as_ref()
        .and_then(|g| state.fixtures.groups.get(g))
    else {
        if args.first().is_some_and(|a| a.starts_with('<')) {
            // Message-id lookups are valid without a group; search all.
            return article_by_id_anywhere(verb, args[0], state, writer).await;
        }
        writer.write_all(b"412 no newsgroup selected\r\n").await?;
        return Ok(());
    };

    let found = match args.first() {
        Some(arg) if arg.starts_with('<') => match group.by_message_id(arg) {
            Some(a) => Some((0, a)),
            None => {
                writer.write_all(b"430 no such article\r\n").await?;
                return Ok(());
            }
        },
        Some(arg) => match arg.parse::<u64>().ok().and_then(|n| group.by_number(n)) {
            Some(a) => {
                session.current_article = Some(a.number);
                Some((a.number, a))
            }
            None => {
                writer
                    .write_all(b"423 no article with that number\r\n")
                    .await?;
                return Ok(());
            }
        },
        None => match session.current_article.and_then(|n| group.by_number(n)) {
            Some(a) => Some((a.number, a)),
            None => {
                writer.write_all(b"420 no current article\r\n").await?;
                return Ok(());
            }
        },
    };

    if let Some((number, article)) = found {
        send_article(verb, number, article, writer).await?;
    }
    Ok(())
}

async fn article_by_id_anywhere(
    verb: &str,
    id: &str,
    state: &Arc<ServerState>,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    for group in state.fixtures.groups.values() {
        if let Some(article) = group.by_message_id(id) {
            return send_article(verb, 0, article, writer).await;
        }
    }
    writer.write_all(b"430 no such article\r\n").await?;
    Ok(())
}

async fn send_article(
    verb: &str,
    number: u64,
    article: &ArticleConfig,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    let id = &article.message_id;
    match verb {
        "STAT" => {
            writer
                .write_all(format!("223 {number} {id}\r\n").as_bytes())
                .await?;
        }
        "HEAD" => {
            writer
                .write_all(format!("221 {number} {id}\r\n").as_bytes())
                .await?;
            send_block(
                article.headers.iter().map(|(n, v)| format!("{n}: {v}")).collect(),
                writer,
            )
            .await?;
        }
        "BODY" => {
            writer
                .write_all(format!("222 {number} {id}\r\n").as_bytes())
                .await?;
            send_block(article.body.split('\n').map(str::to_string).collect(), writer).await?;
        }
        _ => {
            writer
                .write_all(format!("220 {number} {id}\r\n").as_bytes())
                .await?;
            let lines = article
                .headers
                .iter()
                .map(|(n, v)| format!("{n}: {v}"))
                .chain(std::iter::once(String::new()))
                .chain(article.body.split('\n').map(str::to_string));
            send_block(lines.collect(), writer).await?;
        }
    }
    Ok(())
}

async fn handle_pointer_move(
    verb: &str,
    state: &Arc<ServerState>,
    session: &mut SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }
    let Some(group) = session
        .current_group
        .as_ref()
        .and_then(|g| state.fixtures.groups.get(g))
    else {
        writer.write_all(b"412 no newsgroup selected\r\n").await?;
        return Ok(());
    };
    let Some(current) = session.current_article else {
        writer.write_all(b"420 no current article\r\n").await?;
        return Ok(());
    };

    let next = if verb == "NEXT" {
        group
            .articles
            .iter()
            .filter(|a| a.number > current)
            .min_by_key(|a| a.number)
    } else {
        group
            .articles
            .iter()
            .filter(|a| a.number < current)
            .max_by_key(|a| a.number)
    };

    match next {
        Some(article) => {
            session.current_article = Some(article.number);
            writer
                .write_all(format!("223 {} {}\r\n", article.number, article.message_id).as_bytes())
                .await?;
        }
        None if verb == "NEXT" => {
            writer.write_all(b"421 no next article\r\n").await?;
        }
        None => {
            writer.write_all(b"422 no previous article\r\n").await?;
        }
    }
    Ok(())
}

async fn handle_over(
    args: &[&str],
    state: &Arc<ServerState>,
    session: &SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }
    let Some(group) = session
        .current_group
        .as_ref()
        .and_then(|g| state.fixtures.groups.get(g))
    else {
        writer.write_all(b"412 no newsgroup selected\r\n").await?;
        return Ok(());
    };

    let (start, end) = match args.first() {
        Some(range) => parse_range(range),
        None => match session.current_article {
            Some(n) => (n, n),
            None => {
                writer.write_all(b"420 no current article\r\n").await?;
                return Ok(());
            }
        },
    };

    writer.write_all(b"224 overview follows\r\n").await?;
    let lines = group
        .articles
        .iter()
        .filter(|a| a.number >= start && a.number <= end)
        .map(|a| {
            format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                a.number,
                a.header("Subject"),
                a.header("From"),
                a.header("Date"),
                a.message_id,
                a.header("References"),
                a.body.len(),
                a.body.split('\n').count(),
            )
        });
    send_block(lines.collect(), writer).await?;
    Ok(())
}

async fn handle_xhdr(
    args: &[&str],
    state: &Arc<ServerState>,
    session: &SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }
    let Some(group) = session
        .current_group
        .as_ref()
        .and_then(|g| state.fixtures.groups.get(g))
    else {
        writer.write_all(b"412 no newsgroup selected\r\n").await?;
        return Ok(());
    };
    let Some(header) = args.first() else {
        writer.write_all(b"501 syntax error\r\n").await?;
        return Ok(());
    };
    let (start, end) = args.get(1).map(|r| parse_range(r)).unwrap_or((0, u64::MAX));

    writer.write_all(b"221 header follows\r\n").await?;
    let lines = group
        .articles
        .iter()
        .filter(|a| a.number >= start && a.number <= end)
        .map(|a| format!("{} {}", a.number, a.header(header)));
    send_block(lines.collect(), writer).await?;
    Ok(())
}

async fn handle_newgroups(
    state: &Arc<ServerState>,
    session: &SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }
    writer.write_all(b"231 new groups follow\r\n").await?;
    let lines = state
        .fixtures
        .groups
        .iter()
        .map(|(name, g)| format!("{name} {} {} y", g.high(), g.low()));
    send_block(lines.collect(), writer).await?;
    Ok(())
}

async fn handle_newnews(
    pattern: &str,
    state: &Arc<ServerState>,
    session: &SessionState,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }
    writer.write_all(b"230 new articles follow\r\n").await?;
    let lines = state
        .fixtures
        .groups
        .iter()
        .filter(|(name, _)| wildmat(pattern, name))
        .flat_map(|(_, g)| g.articles.iter().map(|a| a.message_id.clone()));
    send_block(lines.collect(), writer).await?;
    Ok(())
}

async fn handle_xgtitle(
    pattern: &str,
    state: &Arc<ServerState>,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    writer.write_all(b"282 list of groups and descriptions\r\n").await?;
    let lines = state
        .fixtures
        .groups
        .iter()
        .filter(|(name, _)| wildmat(pattern, name))
        .map(|(name, g)| format!("{name}\t{}", g.description));
    send_block(lines.collect(), writer).await?;
    Ok(())
}

async fn handle_deposit(
    verb: &str,
    state: &Arc<ServerState>,
    session: &SessionState,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> StubResult {
    if !session.authenticated {
        writer.write_all(b"480 authentication required\r\n").await?;
        return Ok(());
    }

    if verb == "POST" {
        writer.write_all(b"340 send article\r\n").await?;
    } else {
        writer.write_all(b"335 send it\r\n").await?;
    }

    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            break;
        }
        if let Some(rest) = trimmed.strip_prefix("..") {
            lines.push(format!(".{rest}"));
        } else {
            lines.push(trimmed.to_string());
        }
    }
    state.posted.lock().await.push(lines);

    if verb == "POST" {
        writer.write_all(b"240 article received\r\n").await?;
    } else {
        writer.write_all(b"235 article transferred\r\n").await?;
    }
    Ok(())
}

// Takes owned lines: a borrowing iterator held across the awaits breaks
// lifetime inference for the spawned per-client future.
async fn send_block(lines: Vec<String>, writer: &mut OwnedWriteHalf) -> StubResult {
    for line in lines {
        let mut line = line.replace('\r', "");
        if line.starts_with('.') {
            line.insert(0, '.');
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    Ok(())
}

fn parse_range(range: &str) -> (u64, u64) {
    match range.split_once('-') {
        Some((start, "")) => (start.parse().unwrap_or(0), u64::MAX),
        Some((start, end)) => (start.parse().unwrap_or(0), end.parse().unwrap_or(0)),
        None => {
            let n = range.parse().unwrap_or(0);
            (n, n)
        }
    }
}

/// Minimal wildmat: `*` matches everything, a trailing `*` matches a
/// prefix, anything else is an exact match.
fn wildmat(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

async fn maybe_delay(config: &StubConfig) {
    if config.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.delay_ms)).await;
    }
}

fn should_disconnect(config: &StubConfig, session: &SessionState) -> bool {
    config.disconnect_after > 0 && session.commands_seen >= config.disconnect_after
}
