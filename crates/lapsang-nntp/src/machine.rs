//! Pure state machine for the NNTP protocol ([RFC 3977](https://datatracker.ietf.org/doc/html/rfc3977)).
//!
//! Drives command/response exchanges without performing I/O directly. The
//! caller feeds in response and block lines and reacts to queued outputs.

use std::collections::VecDeque;

use crate::model::NntpResponse;

/// Response codes that introduce a multi-line data block
/// ([RFC 3977 §3.2](https://datatracker.ietf.org/doc/html/rfc3977#section-3.2)).
///
/// 282 is the XGTITLE success code from RFC 2980; the rest are the
/// standard reader responses.
pub const MULTILINE_CODES: &[u16] = &[100, 101, 211, 215, 220, 221, 222, 224, 225, 230, 231, 282];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input<'a> {
    ResponseLine(&'a str),
    BlockLine(&'a [u8]),
    BlockEnd,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    SendCommand(String),
    NeedResponseLine,
    NeedBlockLine,
    /// The server accepted POST or IHAVE; the caller must transmit the
    /// dot-stuffed article and then call [`NntpMachine::article_sent`].
    SendArticle,
    UpgradeToTls,
    UpgradeToDeflate,
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// 4xx response: the command failed but may succeed later.
    Temporary { code: u16, message: String },
    /// 5xx response: the command failed and will not succeed.
    Permanent { code: u16, message: String },
    /// A 1xx-3xx response that does not fit the exchange.
    UnexpectedResponse(u16, String),
    ProtocolError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    GreetingOk(NntpResponse),
    Authenticated(NntpResponse),
    /// Final status line of a single-line exchange, or the terminal
    /// response of a POST/IHAVE deposit.
    Response(NntpResponse),
    /// Initial status line of a multi-line exchange; block lines follow.
    BlockStarted(NntpResponse),
    /// One dot-unstuffed line of the current block, without CRLF.
    BlockLine(Vec<u8>),
    BlockEnd,
    TlsActive,
    CompressActive,
    QuitAck,
    Error(ProtoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitGreeting,
    Idle,
    AwaitShortResponse,
    AwaitBlockResponse,
    ReadingBlock,
    AwaitAuthUser,
    AwaitAuthPass,
    AwaitStartTlsResponse,
    AwaitCompressResponse,
    AwaitDepositGo,
    SendingArticle,
    AwaitDepositResult,
    AwaitQuit,
    Done,
}

#[derive(Debug)]
pub struct NntpMachine {
    state: State,
    outputs: VecDeque<Output>,
    pending_password: Option<String>,
    authenticated: bool,
    tls_active: bool,
}

impl NntpMachine {
    pub fn new() -> Self {
        let mut m = Self {
            state: State::AwaitGreeting,
            outputs: VecDeque::new(),
            pending_password: None,
            authenticated: false,
            tls_active: false,
        };
        m.outputs.push_back(Output::NeedResponseLine);
        m
    }

    pub fn new_after_greeting() -> Self {
        Self {
            state: State::Idle,
            outputs: VecDeque::new(),
            pending_password: None,
            authenticated: false,
            tls_active: false,
        }
    }

    /// Mark the connection as TLS from the start (implicit TLS on port 563).
    pub fn set_tls_active(&mut self) {
        self.tls_active = true;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls_active
    }

    /// Issue a command whose reply is a single status line
    /// ([RFC 3977 §3.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1)).
    pub fn request_short(&mut self, command: impl Into<String>) {
        self.outputs.push_back(Output::SendCommand(command.into()));
        self.outputs.push_back(Output::NeedResponseLine);
        self.state = State::AwaitShortResponse;
    }

    /// Issue a command whose success reply carries a multi-line data block
    /// terminated by a lone dot ([RFC 3977 §3.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1.1)).
    pub fn request_block(&mut self, command: impl Into<String>) {
        self.outputs.push_back(Output::SendCommand(command.into()));
        self.outputs.push_back(Output::NeedResponseLine);
        self.state = State::AwaitBlockResponse;
    }

    /// Authenticate with AUTHINFO USER/PASS ([RFC 4643 §2.3](https://datatracker.ietf.org/doc/html/rfc4643#section-2.3)).
    pub fn request_auth(&mut self, user: &str, pass: Option<&str>) {
        self.pending_password = pass.map(str::to_string);
        self.outputs
            .push_back(Output::SendCommand(format!("AUTHINFO USER {user}")));
        self.outputs.push_back(Output::NeedResponseLine);
        self.state = State::AwaitAuthUser;
    }

    /// Initiate STARTTLS upgrade ([RFC 4642 §2](https://datatracker.ietf.org/doc/html/rfc4642#section-2)).
    ///
    /// Refused when TLS is already active or after authentication; RFC 4642
    /// forbids STARTTLS in both situations.
    pub fn request_starttls(&mut self) {
        if self.tls_active {
            self.emit_error(ProtoError::ProtocolError("TLS is already active".into()));
            return;
        }
        if self.authenticated {
            self.emit_error(ProtoError::ProtocolError(
                "STARTTLS not allowed after authentication".into(),
            ));
            return;
        }
        self.outputs
            .push_back(Output::SendCommand("STARTTLS".to_string()));
        self.outputs.push_back(Output::NeedResponseLine);
        self.state = State::AwaitStartTlsResponse;
    }

    /// Negotiate NNTP compression ([RFC 8054](https://datatracker.ietf.org/doc/html/rfc8054)).
    pub fn request_compress(&mut self) {
        self.outputs
            .push_back(Output::SendCommand("COMPRESS DEFLATE".to_string()));
        self.outputs.push_back(Output::NeedResponseLine);
        self.state = State::AwaitCompressResponse;
    }

    /// Begin a POST or IHAVE deposit ([RFC 3977 §6.3](https://datatracker.ietf.org/doc/html/rfc3977#section-6.3)).
    ///
    /// A 3xx go-ahead yields [`Output::SendArticle`]; the caller transmits
    /// the article and then calls [`NntpMachine::article_sent`].
    pub fn request_deposit(&mut self, command: impl Into<String>) {
        self.outputs.push_back(Output::SendCommand(command.into()));
        self.outputs.push_back(Output::NeedResponseLine);
        self.state = State::AwaitDepositGo;
    }

    /// Signal that the dot-stuffed article has been written in full.
    pub fn article_sent(&mut self) {
        if self.state == State::SendingArticle {
            self.outputs.push_back(Output::NeedResponseLine);
            self.state = State::AwaitDepositResult;
        }
    }

    /// Close the connection with QUIT ([RFC 3977 §5.4](https://datatracker.ietf.org/doc/html/rfc3977#section-5.4)).
    pub fn request_quit(&mut self) {
        self.outputs
            .push_back(Output::SendCommand("QUIT".to_string()));
        self.outputs.push_back(Output::NeedResponseLine);
        self.state = State::AwaitQuit;
    }

    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    pub fn handle_input(&mut self, input: Input<'_>) {
        match (&self.state, input) {
            (State::Done, _) => {}

            (_, Input::Eof) => {
                self.emit_error(ProtoError::ProtocolError("unexpected EOF".into()));
                self.state = State::Done;
            }

            (State::AwaitGreeting, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) if resp.code == 200 || resp.code == 201 => {
                    self.outputs.push_back(Output::Event(Event::GreetingOk(resp)));
                    self.state = State::Idle;
                }
                Ok(resp) => {
                    self.emit_error(ProtoError::UnexpectedResponse(resp.code, resp.message));
                    self.state = State::Done;
                }
                Err(e) => {
                    self.emit_error(e);
                    self.state = State::Done;
                }
            },

            (State::AwaitShortResponse, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) => {
                    self.outputs.push_back(Output::Event(Event::Response(resp)));
                    self.state = State::Idle;
                }
                Err(e) => self.fail(e),
            },

            (State::AwaitBlockResponse, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) if MULTILINE_CODES.contains(&resp.code) => {
                    self.outputs
                        .push_back(Output::Event(Event::BlockStarted(resp)));
                    self.outputs.push_back(Output::NeedBlockLine);
                    self.state = State::ReadingBlock;
                }
                Ok(resp) => {
                    self.emit_error(ProtoError::UnexpectedResponse(resp.code, resp.message));
                    self.state = State::Idle;
                }
                Err(e) => self.fail(e),
            },

            // Dot-unstuffing per RFC 3977 §3.1.1
            // <https://datatracker.ietf.org/doc/html/rfc3977#section-3.1.1>
            (State::ReadingBlock, Input::BlockLine(data)) => {
                let unstuffed = if data.starts_with(b"..") {
                    data[1..].to_vec()
                } else {
                    data.to_vec()
                };
                self.outputs
                    .push_back(Output::Event(Event::BlockLine(unstuffed)));
                self.outputs.push_back(Output::NeedBlockLine);
            }

            (State::ReadingBlock, Input::BlockEnd) => {
                self.outputs.push_back(Output::Event(Event::BlockEnd));
                self.state = State::Idle;
            }

            (State::AwaitAuthUser, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) => match resp.code {
                    281 => {
                        self.authenticated = true;
                        self.pending_password = None;
                        self.outputs
                            .push_back(Output::Event(Event::Authenticated(resp)));
                        self.state = State::Idle;
                    }
                    381 => {
                        if let Some(pass) = self.pending_password.take() {
                            self.outputs
                                .push_back(Output::SendCommand(format!("AUTHINFO PASS {pass}")));
                            self.outputs.push_back(Output::NeedResponseLine);
                            self.state = State::AwaitAuthPass;
                        } else {
                            self.emit_error(ProtoError::ProtocolError(
                                "password required but not provided".into(),
                            ));
                            self.state = State::Idle;
                        }
                    }
                    _ => {
                        self.pending_password = None;
                        self.emit_error(ProtoError::UnexpectedResponse(resp.code, resp.message));
                        self.state = State::Idle;
                    }
                },
                Err(e) => {
                    self.pending_password = None;
                    self.fail(e);
                }
            },

            (State::AwaitAuthPass, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) => match resp.code {
                    281 => {
                        self.authenticated = true;
                        self.outputs
                            .push_back(Output::Event(Event::Authenticated(resp)));
                        self.state = State::Idle;
                    }
                    _ => {
                        self.emit_error(ProtoError::UnexpectedResponse(resp.code, resp.message));
                        self.state = State::Idle;
                    }
                },
                Err(e) => self.fail(e),
            },

            // No fresh greeting follows the TLS handshake; the session
            // resumes where it left off (RFC 4642 §2.4).
            (State::AwaitStartTlsResponse, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) if resp.code == 382 => {
                    self.tls_active = true;
                    self.outputs.push_back(Output::UpgradeToTls);
                    self.outputs.push_back(Output::Event(Event::TlsActive));
                    self.state = State::Idle;
                }
                Ok(resp) => {
                    self.emit_error(ProtoError::UnexpectedResponse(resp.code, resp.message));
                    self.state = State::Idle;
                }
                Err(e) => self.fail(e),
            },

            (State::AwaitCompressResponse, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) if resp.code == 206 => {
                    self.outputs.push_back(Output::UpgradeToDeflate);
                    self.outputs.push_back(Output::Event(Event::CompressActive));
                    self.state = State::Idle;
                }
                Ok(resp) => {
                    self.emit_error(ProtoError::UnexpectedResponse(resp.code, resp.message));
                    self.state = State::Idle;
                }
                Err(e) => self.fail(e),
            },

            (State::AwaitDepositGo, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) if resp.code / 100 == 3 => {
                    self.outputs.push_back(Output::SendArticle);
                    self.state = State::SendingArticle;
                }
                Ok(resp) => {
                    self.emit_error(ProtoError::UnexpectedResponse(resp.code, resp.message));
                    self.state = State::Idle;
                }
                Err(e) => self.fail(e),
            },

            (State::AwaitDepositResult, Input::ResponseLine(line)) => match classify(line) {
                Ok(resp) => {
                    self.outputs.push_back(Output::Event(Event::Response(resp)));
                    self.state = State::Idle;
                }
                Err(e) => self.fail(e),
            },

            (State::AwaitQuit, Input::ResponseLine(_)) => {
                self.outputs.push_back(Output::Event(Event::QuitAck));
                self.state = State::Done;
            }

            (State::Idle, Input::ResponseLine(line)) => {
                self.emit_error(ProtoError::ProtocolError(format!(
                    "unexpected response while idle: {line}"
                )));
            }

            (state, input) => {
                self.emit_error(ProtoError::ProtocolError(format!(
                    "unexpected input {input:?} in state {state:?}"
                )));
                self.state = State::Done;
            }
        }
    }

    fn emit_error(&mut self, err: ProtoError) {
        self.outputs.push_back(Output::Event(Event::Error(err)));
    }

    /// A 4xx or 5xx status line leaves the session usable; a malformed
    /// line does not.
    fn fail(&mut self, err: ProtoError) {
        let fatal = matches!(err, ProtoError::ProtocolError(_));
        self.emit_error(err);
        self.state = if fatal { State::Done } else { State::Idle };
    }
}

impl Default for NntpMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a status line and classify it by its first digit
/// ([RFC 3977 §3.2](https://datatracker.ietf.org/doc/html/rfc3977#section-3.2)):
/// 1xx-3xx succeed, 4xx fail temporarily, 5xx fail permanently.
pub fn classify(line: &str) -> Result<NntpResponse, ProtoError> {
    let resp = parse_response(line)?;
    match resp.code / 100 {
        1..=3 => Ok(resp),
        4 => Err(ProtoError::Temporary {
            code: resp.code,
            message: resp.message,
        }),
        5 => Err(ProtoError::Permanent {
            code: resp.code,
            message: resp.message,
        }),
        _ => Err(ProtoError::ProtocolError(format!(
            "response code out of range: {}",
            resp.code
        ))),
    }
}

pub fn parse_response(line: &str) -> Result<NntpResponse, ProtoError> {
    let Some(digits) = line.get(..3) else {
        return Err(ProtoError::ProtocolError("invalid response line".into()));
    };
    let code = digits
        .parse::<u16>()
        .map_err(|_| ProtoError::ProtocolError("invalid response line".into()))?;
    let message = line[3..].trim().to_string();
    Ok(NntpResponse { code, message })
}

pub fn is_block_terminator(line: &[u8]) -> bool {
    line == b"."
}

pub fn trim_crlf(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    &buf[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_outputs(m: &mut NntpMachine) -> Vec<Output> {
        let mut out = Vec::new();
        while let Some(o) = m.poll_output() {
            out.push(o);
        }
        out
    }

    fn find_event(outputs: &[Output]) -> Option<&Event> {
        outputs.iter().find_map(|o| match o {
            Output::Event(e) => Some(e),
            _ => None,
        })
    }

    fn find_events(outputs: &[Output]) -> Vec<&Event> {
        outputs
            .iter()
            .filter_map(|o| match o {
                Output::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    // Greeting (RFC 3977 §5.1)

    #[test]
    fn greeting_ok() {
        let mut m = NntpMachine::new();
        let out = drain_outputs(&mut m);
        assert_eq!(out, vec![Output::NeedResponseLine]);

        m.handle_input(Input::ResponseLine("200 Welcome"));
        let out = drain_outputs(&mut m);
        assert_eq!(
            find_event(&out),
            Some(&Event::GreetingOk(NntpResponse {
                code: 200,
                message: "Welcome".to_string()
            }))
        );
    }

    #[test]
    fn greeting_201_posting_not_allowed() {
        let mut m = NntpMachine::new();
        drain_outputs(&mut m);
        m.handle_input(Input::ResponseLine("201 No posting"));
        let out = drain_outputs(&mut m);
        assert!(matches!(find_event(&out), Some(Event::GreetingOk(r)) if r.code == 201));
    }

    #[test]
    fn greeting_rejected() {
        let mut m = NntpMachine::new();
        drain_outputs(&mut m);
        m.handle_input(Input::ResponseLine("502 Go away"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Permanent { code: 502, .. }))
        ));
    }

    // Single-line exchanges (RFC 3977 §3.1)

    #[test]
    fn short_exchange() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_short("DATE");
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("DATE".to_string())));
        assert!(out.contains(&Output::NeedResponseLine));

        m.handle_input(Input::ResponseLine("111 20260830120000"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Response(r)) if r.code == 111 && r.message == "20260830120000"
        ));
    }

    #[test]
    fn short_temporary_failure_leaves_session_usable() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_short("GROUP no.such.group");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("411 No such newsgroup"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 411, .. }))
        ));

        m.request_short("DATE");
        m.handle_input(Input::ResponseLine("111 20260830120000"));
        let out = drain_outputs(&mut m);
        assert!(matches!(find_event(&out), Some(Event::Response(r)) if r.code == 111));
    }

    #[test]
    fn short_permanent_failure() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_short("SLAVE");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("500 What?"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Permanent { code: 500, .. }))
        ));
    }

    #[test]
    fn short_malformed_line_is_fatal() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_short("DATE");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("xx"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::ProtocolError(_)))
        ));

        // Done state ignores further input
        m.handle_input(Input::ResponseLine("111 20260830120000"));
        assert!(drain_outputs(&mut m).is_empty());
    }

    // Multi-line exchanges (RFC 3977 §3.1.1)

    #[test]
    fn block_fetch_success() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_block("BODY <test@example>");
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("BODY <test@example>".to_string())));

        m.handle_input(Input::ResponseLine("222 1 <test@example>"));
        let out = drain_outputs(&mut m);
        assert!(matches!(find_event(&out), Some(Event::BlockStarted(r)) if r.code == 222));
        assert!(out.contains(&Output::NeedBlockLine));

        m.handle_input(Input::BlockLine(b"line1"));
        let out = drain_outputs(&mut m);
        let events = find_events(&out);
        assert_eq!(events[0], &Event::BlockLine(b"line1".to_vec()));
        assert!(out.contains(&Output::NeedBlockLine));

        m.handle_input(Input::BlockLine(b"..dot"));
        let out = drain_outputs(&mut m);
        let events = find_events(&out);
        assert_eq!(events[0], &Event::BlockLine(b".dot".to_vec()));

        m.handle_input(Input::BlockEnd);
        let out = drain_outputs(&mut m);
        assert_eq!(find_event(&out), Some(&Event::BlockEnd));
    }

    #[test]
    fn block_not_found_is_temporary() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_block("BODY <missing@example>");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("430 No Such Article"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 430, .. }))
        ));
    }

    #[test]
    fn block_single_line_code_is_unexpected() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_block("ARTICLE 1");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("223 1 <a@b>"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::UnexpectedResponse(223, _)))
        ));
    }

    #[test]
    fn block_auth_required() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_block("BODY <test@example>");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("480 Auth required"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 480, .. }))
        ));
    }

    // Authentication (RFC 4643 §2.3)

    #[test]
    fn auth_success_281_immediate() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_auth("user", Some("pass"));
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("AUTHINFO USER user".to_string())));
        assert!(out.contains(&Output::NeedResponseLine));

        m.handle_input(Input::ResponseLine("281 OK"));
        let out = drain_outputs(&mut m);
        assert!(matches!(find_event(&out), Some(Event::Authenticated(_))));
        assert!(m.is_authenticated());
    }

    #[test]
    fn auth_success_381_then_281() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_auth("user", Some("secret"));
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("381 More auth info"));
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("AUTHINFO PASS secret".to_string())));

        m.handle_input(Input::ResponseLine("281 OK"));
        let out = drain_outputs(&mut m);
        assert!(matches!(find_event(&out), Some(Event::Authenticated(_))));
        assert!(m.is_authenticated());
    }

    #[test]
    fn auth_password_required_but_missing() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_auth("user", None);
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("381 Password required"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::ProtocolError(_)))
        ));
        assert!(!m.is_authenticated());
    }

    #[test]
    fn auth_rejected_481() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_auth("user", Some("wrong"));
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("381 More auth"));
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("481 Authentication failed"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 481, .. }))
        ));
        assert!(!m.is_authenticated());
    }

    // STARTTLS (RFC 4642)

    #[test]
    fn starttls_flow() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_starttls();
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("STARTTLS".to_string())));

        m.handle_input(Input::ResponseLine("382 Continue with TLS negotiation"));
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::UpgradeToTls));
        assert_eq!(find_event(&out), Some(&Event::TlsActive));
        assert!(m.is_tls_active());
    }

    #[test]
    fn starttls_refused() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_starttls();
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("502 STARTTLS not supported"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Permanent { code: 502, .. }))
        ));
        assert!(!m.is_tls_active());
    }

    #[test]
    fn starttls_rejected_when_tls_already_active() {
        let mut m = NntpMachine::new_after_greeting();
        m.set_tls_active();
        m.request_starttls();
        let out = drain_outputs(&mut m);
        assert!(!out.iter().any(|o| matches!(o, Output::SendCommand(_))));
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::ProtocolError(_)))
        ));
    }

    #[test]
    fn starttls_rejected_after_auth() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_auth("user", Some("pass"));
        drain_outputs(&mut m);
        m.handle_input(Input::ResponseLine("281 OK"));
        drain_outputs(&mut m);

        m.request_starttls();
        let out = drain_outputs(&mut m);
        assert!(!out.iter().any(|o| matches!(o, Output::SendCommand(_))));
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::ProtocolError(_)))
        ));
    }

    // Compression (RFC 8054)

    #[test]
    fn compress_flow() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_compress();
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("COMPRESS DEFLATE".to_string())));

        m.handle_input(Input::ResponseLine("206 Compression active"));
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::UpgradeToDeflate));
        assert_eq!(find_event(&out), Some(&Event::CompressActive));
    }

    #[test]
    fn compress_refused() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_compress();
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("403 Unable to activate compression"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 403, .. }))
        ));
    }

    // Posting (RFC 3977 §6.3)

    #[test]
    fn post_flow() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_deposit("POST");
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("POST".to_string())));

        m.handle_input(Input::ResponseLine("340 Send article"));
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendArticle));

        m.article_sent();
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::NeedResponseLine));

        m.handle_input(Input::ResponseLine("240 Article received"));
        let out = drain_outputs(&mut m);
        assert!(matches!(find_event(&out), Some(Event::Response(r)) if r.code == 240));
    }

    #[test]
    fn post_not_permitted() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_deposit("POST");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("440 Posting not permitted"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 440, .. }))
        ));
        assert!(!drain_outputs(&mut m).contains(&Output::SendArticle));
    }

    #[test]
    fn ihave_not_wanted() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_deposit("IHAVE <a@b>");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("435 Article not wanted"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 435, .. }))
        ));
    }

    #[test]
    fn ihave_rejected_after_transfer() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_deposit("IHAVE <a@b>");
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("335 Send it"));
        drain_outputs(&mut m);
        m.article_sent();
        drain_outputs(&mut m);

        m.handle_input(Input::ResponseLine("437 Article rejected"));
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::Temporary { code: 437, .. }))
        ));
    }

    // Session teardown

    #[test]
    fn quit() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_quit();
        let out = drain_outputs(&mut m);
        assert!(out.contains(&Output::SendCommand("QUIT".to_string())));

        m.handle_input(Input::ResponseLine("205 bye"));
        let out = drain_outputs(&mut m);
        assert_eq!(find_event(&out), Some(&Event::QuitAck));
    }

    #[test]
    fn eof_mid_exchange() {
        let mut m = NntpMachine::new_after_greeting();
        m.request_short("DATE");
        drain_outputs(&mut m);

        m.handle_input(Input::Eof);
        let out = drain_outputs(&mut m);
        assert!(matches!(
            find_event(&out),
            Some(Event::Error(ProtoError::ProtocolError(_)))
        ));
    }

    // Helpers

    #[test]
    fn classify_code_ranges() {
        assert!(classify("215 list follows").is_ok());
        assert!(matches!(
            classify("441 posting failed"),
            Err(ProtoError::Temporary { code: 441, .. })
        ));
        assert!(matches!(
            classify("501 syntax error"),
            Err(ProtoError::Permanent { code: 501, .. })
        ));
        assert!(matches!(
            classify("999 nonsense"),
            Err(ProtoError::ProtocolError(_))
        ));
        assert!(matches!(classify("ab"), Err(ProtoError::ProtocolError(_))));
    }

    #[test]
    fn multiline_codes_cover_reader_commands() {
        for code in [100, 211, 215, 220, 221, 222, 224, 225, 230, 231, 282] {
            assert!(MULTILINE_CODES.contains(&code), "missing {code}");
        }
        assert!(!MULTILINE_CODES.contains(&223));
    }

    #[test]
    fn trim_crlf_variants() {
        assert_eq!(trim_crlf(b"abc\r\n"), b"abc");
        assert_eq!(trim_crlf(b"abc\n"), b"abc");
        assert_eq!(trim_crlf(b"abc"), b"abc");
        assert_eq!(trim_crlf(b""), b"");
    }

    #[test]
    fn block_terminator() {
        assert!(is_block_terminator(b"."));
        assert!(!is_block_terminator(b".."));
        assert!(!is_block_terminator(b""));
    }
}
