//! Line-oriented Telnet interface
//!
//! Each input line is either a raw JSON request (starts with `{`) or a short
//! admin command resolved by prefix against a sorted table. Some commands are
//! answered locally; the rest become requests for the controller. Replies are
//! formatted as readable text followed by the prompt.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::server::channel::{ChannelEndpoint, KickSignal};
use crate::server::protocol::{Reply, Request, commands};
use crate::server::websocket::preview;

const PROMPT: &str = "> ";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest accepted input line, terminator included
const MAX_LINE_BYTES: usize = 64 * 1024;

/// IAC IP IAC DO TIMING-MARK: what a telnet client sends on Ctrl-C
const INTERRUPT: &[u8] = b"\xff\xf4\xff\xfd\x06";

/// Rows per literal query; keeps a stray `SELECT *` from flooding the terminal
const LITERAL_QUERY_LIMIT: u64 = 100;

const LITERAL_QUERY_WARNING: &str = "[Warning for Literal Queries]\n\
    Literal queries bypass tag bookkeeping. If you changed any tags, run \
    'db recreate tags' afterwards.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineCommand {
    RepeatLast,
    Commands,
    Db,
    Exit,
    Motd,
    NeedFull,
    Restart,
    Shutdown,
}

/// Sorted so that prefix resolution is deterministic
const COMMAND_TABLE: &[(&str, LineCommand)] = &[
    ("!", LineCommand::RepeatLast),
    ("commands", LineCommand::Commands),
    ("db", LineCommand::Db),
    ("exit", LineCommand::Exit),
    ("motd", LineCommand::Motd),
    ("quit", LineCommand::Exit),
    ("restar", LineCommand::NeedFull),
    ("restart", LineCommand::Restart),
    ("shutdow", LineCommand::NeedFull),
    ("shutdown", LineCommand::Shutdown),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbCommand {
    Drop,
    Meta,
    Query,
    Recreate,
}

const DB_TABLE: &[(&str, DbCommand)] = &[
    ("drop", DbCommand::Drop),
    ("meta", DbCommand::Meta),
    ("query", DbCommand::Query),
    ("recreate", DbCommand::Recreate),
];

fn resolve<T: Copy>(table: &[(&str, T)], word: &str) -> Option<T> {
    table
        .iter()
        .find(|(name, _)| name.starts_with(word))
        .map(|(_, command)| *command)
}

fn names<T>(table: &[(&str, T)]) -> String {
    table
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}

/// What the connection should do in response to a line
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Say { text: String, prompt: bool },
    Forward(Request),
    Exit,
}

impl Action {
    fn say(text: impl Into<String>) -> Self {
        Self::Say {
            text: text.into(),
            prompt: true,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Default)]
pub struct TelnetSession {
    last_command: String,
}

impl TelnetSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_line(&mut self, line: &str) -> Vec<Action> {
        let line = line.trim();

        if line.starts_with('{') {
            return match Request::decode(line) {
                Ok(request) => vec![Action::Forward(request)],
                Err(e) => vec![Action::say(e.to_string())],
            };
        }

        if !line.starts_with('!') {
            self.last_command = line.to_string();
        }
        self.run(line)
    }

    fn run(&mut self, line: &str) -> Vec<Action> {
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            return vec![Action::say("")];
        };
        let args: Vec<&str> = words.collect();

        let Some(command) = resolve(COMMAND_TABLE, word) else {
            return vec![Action::say("Invalid command.")];
        };

        match command {
            LineCommand::RepeatLast => {
                let last = self.last_command.clone();
                self.run(&last)
            }
            LineCommand::Commands => {
                vec![Action::say(format!("Commands:\n{}", names(COMMAND_TABLE)))]
            }
            LineCommand::Db => Self::run_db(&args),
            LineCommand::Exit => vec![Action::Exit],
            LineCommand::Motd => vec![Action::Forward(Request::new(commands::MOTD))],
            LineCommand::NeedFull => vec![Action::say("You need to type that command out in full.")],
            LineCommand::Restart => vec![
                Action::Say {
                    text: "[Server restarting]".to_string(),
                    prompt: false,
                },
                Action::Forward(Request::new(commands::RESTART)),
            ],
            LineCommand::Shutdown => vec![
                Action::Say {
                    text: "[Server shutting down]".to_string(),
                    prompt: false,
                },
                Action::Forward(Request::new(commands::SHUTDOWN)),
            ],
        }
    }

    fn run_db(args: &[&str]) -> Vec<Action> {
        let Some((word, rest)) = args.split_first() else {
            return vec![Action::say(format!(
                "You need to specify a DB operation to perform.\nOptions are:\n{}",
                names(DB_TABLE)
            ))];
        };
        let Some(command) = resolve(DB_TABLE, word) else {
            return vec![Action::say("Invalid command.")];
        };

        match command {
            DbCommand::Meta => vec![Action::Forward(Request::new(commands::META))],
            DbCommand::Query => match quoted(&rest.join(" ")) {
                Some(query) => vec![Action::Forward(
                    Request::new(commands::LITERAL_QUERY)
                        .with_param("query", query)
                        .with_param("limit", LITERAL_QUERY_LIMIT),
                )],
                None => vec![Action::say(
                    "The query to be executed needs to be properly wrapped in double inverted commas.",
                )],
            },
            DbCommand::Drop => match rest.first() {
                Some(target) => vec![Action::Forward(
                    Request::new(commands::DROP).with_param("target", *target),
                )],
                None => vec![Action::say("You need to specify a target to drop.")],
            },
            DbCommand::Recreate => match rest.first() {
                Some(target) => vec![Action::Forward(
                    Request::new(commands::RECREATE).with_param("target", *target),
                )],
                None => vec![Action::say("You need to specify a target to rebuild.")],
            },
        }
    }

    /// Readable rendering of a controller reply. Strings (the motd) go out
    /// as-is, anything else as pretty JSON.
    pub fn format_reply(reply: &Reply) -> String {
        let text = format_raw(&reply.data);
        if reply.command == commands::LITERAL_QUERY {
            format!("{}\n\n{}", text, LITERAL_QUERY_WARNING)
        } else {
            text
        }
    }
}

/// Text between the first and last double quote, if non-empty
fn quoted(raw: &str) -> Option<&str> {
    let start = raw.find('"')?;
    let end = raw.rfind('"')?;
    if end <= start + 1 {
        return None;
    }
    Some(&raw[start + 1..end])
}

fn format_raw(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// CRLF line endings, padded with blank lines when non-empty, then the prompt
fn render(text: &str, prompt: bool) -> String {
    let body = text.lines().collect::<Vec<_>>().join("\r\n");
    let mut out = if body.is_empty() {
        String::new()
    } else {
        format!("\r\n{}\r\n\r\n", body)
    };
    if prompt {
        out.push_str(PROMPT);
    }
    out
}

// ============================================================================
// Connection
// ============================================================================

async fn write_out(writer: &mut OwnedWriteHalf, kick: &KickSignal, text: &str) -> bool {
    tokio::select! {
        biased;
        _ = kick.requested() => false,
        written = writer.write_all(text.as_bytes()) => written.is_ok(),
    }
}

/// Read up to the next newline, never letting `buf` grow past
/// `MAX_LINE_BYTES + 1`. A longer line comes back without its terminator.
async fn read_line(reader: &mut BufReader<OwnedReadHalf>, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let room = (MAX_LINE_BYTES + 1).saturating_sub(buf.len()) as u64;
    let mut limited = reader.take(room);
    limited.read_until(b'\n', buf).await
}

/// Serve one Telnet connection until the client leaves or the channel is kicked.
pub async fn serve(stream: TcpStream, peer: String, mut endpoint: ChannelEndpoint) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut session = TelnetSession::new();
    // read_until appends partial input here, so it survives a lost select race
    let mut buf = Vec::new();

    if !endpoint.requests.deliver(Request::new(commands::MOTD)).await {
        return;
    }

    'connection: loop {
        tokio::select! {
            _ = endpoint.kick.requested() => {
                let pending: String = endpoint
                    .drain_replies()
                    .iter()
                    .map(|reply| render(&TelnetSession::format_reply(reply), false))
                    .collect();
                if !pending.is_empty()
                    && tokio::time::timeout(FLUSH_TIMEOUT, writer.write_all(pending.as_bytes()))
                        .await
                        .is_err()
                {
                    tracing::debug!("[{}] Gave up flushing replies", peer);
                }
                break;
            }
            read = read_line(&mut reader, &mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("[{}] Read failed: {}", peer, e);
                        break;
                    }
                }
                if buf.len() > MAX_LINE_BYTES && !buf.ends_with(b"\n") {
                    tracing::warn!("[{}] Line longer than {} bytes", peer, MAX_LINE_BYTES);
                    endpoint.requests.reject("input line too long").await;
                    break;
                }
                let raw = std::mem::take(&mut buf);

                if raw.starts_with(INTERRUPT) {
                    tracing::info!("[{}] Client sent an interrupt", peer);
                    break;
                }
                let line = match String::from_utf8(raw) {
                    Ok(line) => line,
                    Err(_) => {
                        tracing::warn!("[{}] Undecodable input", peer);
                        endpoint.requests.reject("input is not valid UTF-8").await;
                        break;
                    }
                };
                tracing::info!("[{}] [RECV] {}", peer, preview(line.trim_end()));

                for action in session.handle_line(&line) {
                    match action {
                        Action::Say { text, prompt } => {
                            if !write_out(&mut writer, &endpoint.kick, &render(&text, prompt)).await {
                                break 'connection;
                            }
                        }
                        Action::Forward(request) => {
                            if !endpoint.requests.deliver(request).await {
                                break 'connection;
                            }
                        }
                        Action::Exit => break 'connection,
                    }
                }
            }
            reply = endpoint.replies.recv() => {
                let Some(reply) = reply else { break };
                let text = TelnetSession::format_reply(&reply);
                tracing::info!("[{}] [SEND] {}", peer, preview(&text));
                if !write_out(&mut writer, &endpoint.kick, &render(&text, true)).await {
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    tracing::info!("[{}] Client disconnected", peer);
}
