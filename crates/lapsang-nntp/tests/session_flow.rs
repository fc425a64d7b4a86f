//! End-to-end session tests against the fixture-driven stub server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use lapsang_nntp::{ArticleSpec, Encryption, NntpConnection, NntpError, OverSpec, ServerConfig};
use lapsang_nntp_stub::{StubConfig, StubServer, load_fixtures};
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn fixtures_basic_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("fixtures")
        .join("nntp")
        .join("fixtures-basic.json")
}

fn available_port() -> u16 {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").expect("bind port");
    socket.local_addr().expect("local addr").port()
}

fn stub_config(port: u16, require_auth: bool) -> StubConfig {
    StubConfig {
        bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        fixtures_path: fixtures_basic_path(),
        require_auth,
        username: "test".to_string(),
        password: "secret".to_string(),
        disconnect_after: 0,
        delay_ms: 0,
    }
}

fn start_stub(port: u16, require_auth: bool) -> (StubServer, JoinHandle<()>) {
    let fixtures = load_fixtures(&fixtures_basic_path()).expect("fixtures load");
    let server = StubServer::new(stub_config(port, require_auth), fixtures);
    let task = server.clone();
    let handle = tokio::spawn(async move {
        let _ = task.serve().await;
    });
    (server, handle)
}

fn server_config(port: u16) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        username: None,
        password: None,
        encryption: Encryption::None,
        readermode: false,
        cert_verification: true,
        timeout_secs: Some(5),
    }
}

async fn connect(config: &ServerConfig) -> NntpConnection {
    // The stub binds its listener in a spawned task; retry briefly in
    // case the test connects first.
    for _ in 0..50 {
        match timeout(Duration::from_secs(5), NntpConnection::connect(config))
            .await
            .expect("connect timed out")
        {
            Ok(conn) => return conn,
            Err(NntpError::Io(_)) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("connect failed: {err}"),
        }
    }
    panic!("stub never came up");
}

#[tokio::test]
async fn greeting_and_capabilities() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    assert_eq!(conn.welcome().code, 200);
    assert!(conn.posting_allowed());
    assert!(conn.capabilities().supports("READER"));
    assert_eq!(conn.nntp_version(), 2);

    conn.quit().await.expect("quit");
    handle.abort();
}

#[tokio::test]
async fn group_select_and_article_fetch() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    let summary = conn.group("alt.test").await.expect("group");
    assert_eq!(summary.name, "alt.test");
    assert_eq!(summary.count, 2);
    assert_eq!(summary.first, 1);
    assert_eq!(summary.last, 2);

    let article = conn.article(ArticleSpec::Number(1)).await.expect("article");
    assert_eq!(article.number, 1);
    assert_eq!(article.message_id, "<first@example.org>");
    assert!(article.lines.contains(&b"Subject: First post".to_vec()));
    assert!(article.lines.contains(&b"hello".to_vec()));

    // Dot-stuffed line round-trips unstuffed.
    let body = conn.body(ArticleSpec::Number(2)).await.expect("body");
    assert_eq!(
        body.lines,
        vec![b".starts with a dot".to_vec(), b"plain line".to_vec()]
    );

    conn.quit().await.expect("quit");
    handle.abort();
}

#[tokio::test]
async fn article_by_message_id_without_group() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    let head = conn
        .head(ArticleSpec::MessageId("borrowck@example.org".to_string()))
        .await
        .expect("head");
    assert_eq!(head.message_id, "<borrowck@example.org>");
    assert!(
        head.lines
            .contains(&b"Subject: Borrow checker question".to_vec())
    );

    handle.abort();
}

#[tokio::test]
async fn missing_article_is_not_found() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    conn.group("alt.test").await.expect("group");

    let err = conn
        .stat(ArticleSpec::MessageId("nope@example.org".to_string()))
        .await
        .expect_err("should be missing");
    assert!(matches!(err, NntpError::ArticleNotFound(_)));

    let err = conn.article(ArticleSpec::Number(999)).await.expect_err("no such number");
    assert!(matches!(err, NntpError::ArticleNotFound(_)));

    handle.abort();
}

#[tokio::test]
async fn stat_next_last_move_pointer() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    conn.group("alt.test").await.expect("group");

    let stat = conn.stat(ArticleSpec::Current).await.expect("stat");
    assert_eq!(stat.number, 1);

    let next = conn.next().await.expect("next");
    assert_eq!(next.number, 2);
    assert_eq!(next.message_id, "<second@example.org>");

    let last = conn.last().await.expect("last");
    assert_eq!(last.number, 1);

    handle.abort();
}

#[tokio::test]
async fn auth_flow_with_deferred_reader_mode() {
    let port = available_port();
    let (_server, handle) = start_stub(port, true);

    let mut config = server_config(port);
    config.username = Some("test".to_string());
    config.password = Some("secret".to_string());
    config.readermode = true;

    let mut conn = connect(&config).await;
    assert!(conn.is_authenticated());
    // MODE READER was retried after login and replaced the welcome line.
    assert_eq!(conn.welcome().code, 200);
    assert_eq!(conn.welcome().message, "posting allowed");
    // Capabilities were re-queried on the authenticated session.
    assert!(conn.capabilities().supports("READER"));

    conn.group("alt.test").await.expect("group after auth");
    handle.abort();
}

#[tokio::test]
async fn reader_mode_skipped_when_reader_advertised() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut config = server_config(port);
    config.readermode = true;

    let conn = connect(&config).await;
    // The capability already covers reader mode, so MODE READER is not
    // sent and the welcome line is still the greeting.
    assert!(conn.capabilities().supports("READER"));
    assert_eq!(conn.welcome().message, "lapsang test server ready");
    handle.abort();
}

#[tokio::test]
async fn wrong_password_fails_auth() {
    let port = available_port();
    let (_server, handle) = start_stub(port, true);

    let mut config = server_config(port);
    config.username = Some("test".to_string());
    config.password = Some("wrong".to_string());

    let err = loop {
        match NntpConnection::connect(&config).await {
            Ok(_) => panic!("auth should fail"),
            Err(NntpError::Io(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, NntpError::AuthFailed(_)));
    handle.abort();
}

#[tokio::test]
async fn unauthenticated_reader_command_requires_auth() {
    let port = available_port();
    let (_server, handle) = start_stub(port, true);

    let mut conn = connect(&server_config(port)).await;
    // The 480 on CAPABILITIES fell back to an empty set instead of
    // failing the connect.
    assert!(conn.capabilities().is_empty());
    let err = conn.group("alt.test").await.expect_err("should need auth");
    assert!(matches!(err, NntpError::AuthRequired));
    handle.abort();
}

#[tokio::test]
async fn list_and_descriptions() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    let mut groups = conn.list(None).await.expect("list");
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].name, "alt.test");
    assert_eq!(groups[0].high, 2);
    assert_eq!(groups[0].low, 1);

    let desc = conn.description("comp.lang.rust").await.expect("description");
    assert_eq!(desc, "The Rust programming language");

    handle.abort();
}

#[tokio::test]
async fn listgroup_returns_article_numbers() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    let numbers = conn.listgroup(Some("alt.test")).await.expect("listgroup");
    assert_eq!(numbers, vec![1, 2]);

    handle.abort();
}

#[tokio::test]
async fn over_range_returns_overview_entries() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    conn.group("alt.test").await.expect("group");

    let entries = conn
        .over(OverSpec::Range {
            start: 1,
            end: Some(2),
        })
        .await
        .expect("over");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].number, 1);
    assert_eq!(entries[0].field("subject"), Some("First post"));
    assert_eq!(entries[1].field("references"), Some("<first@example.org>"));
    assert_eq!(entries[1].field("message-id"), Some("<second@example.org>"));

    handle.abort();
}

#[tokio::test]
async fn xhdr_returns_header_values() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    conn.group("alt.test").await.expect("group");

    let subjects = conn.xhdr("Subject", "1-2").await.expect("xhdr");
    assert_eq!(
        subjects,
        vec![
            ("1".to_string(), "First post".to_string()),
            ("2".to_string(), "Re: First post".to_string()),
        ]
    );

    handle.abort();
}

#[tokio::test]
async fn newnews_and_newgroups() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let since = NaiveDate::from_ymd_opt(2026, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();

    let mut conn = connect(&server_config(port)).await;
    let ids = conn.newnews("alt.test", since).await.expect("newnews");
    assert!(ids.contains(&"<first@example.org>".to_string()));
    assert!(ids.contains(&"<second@example.org>".to_string()));

    let groups = conn.newgroups(since).await.expect("newgroups");
    assert_eq!(groups.len(), 2);

    handle.abort();
}

#[tokio::test]
async fn date_returns_server_clock() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    let when = conn.date().await.expect("date");
    assert!(when.and_utc().timestamp() > 0);

    handle.abort();
}

#[tokio::test]
async fn post_article_reaches_server_unstuffed() {
    let port = available_port();
    let (server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    let resp = conn
        .post(b"Subject: test\n\n.leading dot\nbody line\n")
        .await
        .expect("post");
    assert_eq!(resp.code, 240);

    let posted = server.posted_articles().await;
    assert_eq!(posted.len(), 1);
    assert_eq!(
        posted[0],
        vec![
            "Subject: test".to_string(),
            String::new(),
            ".leading dot".to_string(),
            "body line".to_string(),
        ]
    );

    handle.abort();
}

#[tokio::test]
async fn body_reader_streams_lines() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    conn.group("alt.test").await.expect("group");

    let mut reader = conn
        .body_reader(ArticleSpec::Number(1))
        .await
        .expect("body reader");
    assert_eq!(reader.read_line().await.unwrap(), Some(b"hello".to_vec()));
    assert_eq!(reader.read_line().await.unwrap(), Some(b"world".to_vec()));
    assert_eq!(reader.read_line().await.unwrap(), None);
    drop(reader);

    // The connection remains usable after a streamed block.
    let stat = conn.stat(ArticleSpec::Number(2)).await.expect("stat");
    assert_eq!(stat.number, 2);

    handle.abort();
}

#[tokio::test]
async fn help_and_slave() {
    let port = available_port();
    let (_server, handle) = start_stub(port, false);

    let mut conn = connect(&server_config(port)).await;
    let lines = conn.help().await.expect("help");
    assert!(!lines.is_empty());

    let resp = conn.slave().await.expect("slave");
    assert_eq!(resp.code, 202);

    handle.abort();
}
