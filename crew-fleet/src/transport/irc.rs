//! IRC transport.
//!
//! Each tenant's bot is one IRC client: it registers with `PASS <token>`,
//! joins the tenant's primary and secondary channels, and answers every
//! channel message from other users through the bound handler. Long replies
//! are word-wrapped and paced to stay under flood limits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{Connection, ConnectionParams, InboundHandler, InboundMessage, Transport};

/// Longest PRIVMSG body we send in one line.
const MAX_LINE: usize = 400;
/// Pause between the lines of a multi-line reply.
const LINE_PACING: Duration = Duration::from_millis(100);
const MAX_NICK_TRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct IrcConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Bot nicks are `<prefix><tenant id>`.
    pub nick_prefix: String,
    pub realname: String,
    /// Budget for connect + registration.
    pub register_timeout: Duration,
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick_prefix: "crew-".to_string(),
            realname: "crew-fleet team bot".to_string(),
            register_timeout: Duration::from_secs(15),
        }
    }
}

pub struct IrcTransport {
    config: IrcConfig,
}

impl IrcTransport {
    pub fn new(config: IrcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for IrcTransport {
    async fn open(
        &self,
        params: ConnectionParams,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Box<dyn Connection>> {
        let base_nick = nick_for(&self.config.nick_prefix, &params.tenant_id);
        let (reader, writer, nick) = tokio::time::timeout(
            self.config.register_timeout,
            register(&self.config, &params, &base_nick),
        )
        .await
        .with_context(|| format!("IRC registration timed out for {}", params.tenant_id))??;

        Ok(Box::new(IrcConnection::start(
            params, nick, reader, writer, handler,
        )))
    }
}

/// Connect, authenticate with the tenant token and wait for the welcome.
async fn register(
    config: &IrcConfig,
    params: &ConnectionParams,
    base_nick: &str,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf, String)> {
    let stream = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server_addr))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    send_line(&mut writer, &format!("PASS {}", params.token)).await?;
    send_line(&mut writer, &format!("NICK {base_nick}")).await?;
    send_line(
        &mut writer,
        &format!("USER {base_nick} 0 * :{}", config.realname),
    )
    .await?;

    let mut nick = base_nick.to_string();
    let mut nick_tries = 0u32;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            anyhow::bail!("server closed the connection during registration");
        }
        let Some(line) = Line::parse(&String::from_utf8_lossy(&buf)) else {
            continue;
        };
        match line.command.as_str() {
            "PING" => {
                let token = line.params.first().map(String::as_str).unwrap_or("");
                send_line(&mut writer, &format!("PONG :{token}")).await?;
            }
            // RPL_WELCOME
            "001" => {
                if let Some(confirmed) = line.params.first() {
                    nick = confirmed.clone();
                }
                break;
            }
            // ERR_NICKNAMEINUSE
            "433" => {
                nick_tries += 1;
                if nick_tries > MAX_NICK_TRIES {
                    anyhow::bail!("nick {base_nick} and its variants are in use");
                }
                nick = format!("{base_nick}{nick_tries}");
                send_line(&mut writer, &format!("NICK {nick}")).await?;
            }
            // ERR_PASSWDMISMATCH
            "464" => anyhow::bail!("server rejected the transport token"),
            "ERROR" => anyhow::bail!(
                "server error: {}",
                line.params.last().map(String::as_str).unwrap_or("")
            ),
            _ => {}
        }
    }

    send_line(
        &mut writer,
        &format!(
            "JOIN {},{}",
            params.primary_channel_id, params.secondary_channel_id
        ),
    )
    .await?;
    Ok((reader, writer, nick))
}

enum Command {
    Privmsg { target: String, text: String },
}

/// A registered IRC client bound to one tenant.
pub struct IrcConnection {
    tenant_id: String,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl IrcConnection {
    fn start(
        params: ConnectionParams,
        nick: String,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let session = Session {
            tenant_id: params.tenant_id.clone(),
            nick,
            channels: vec![params.primary_channel_id, params.secondary_channel_id],
            handler,
            replies: cmd_tx.clone(),
        };
        let task = tokio::spawn(session.run(reader, writer, cmd_rx, cancel.clone()));
        tracing::info!(tenant_id = %params.tenant_id, "IRC connection up");
        Self {
            tenant_id: params.tenant_id,
            cmd_tx,
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl Connection for IrcConnection {
    async fn send(&self, channel_id: &str, text: &str) -> Result<()> {
        for line in wrap_lines(text, MAX_LINE) {
            self.cmd_tx
                .send(Command::Privmsg {
                    target: channel_id.to_string(),
                    text: line,
                })
                .await
                .map_err(|_| anyhow::anyhow!("IRC connection for {} is closed", self.tenant_id))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .context("IRC connection did not shut down in time")?
                .context("IRC connection task failed")?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.cmd_tx.is_closed()
    }
}

struct Session {
    tenant_id: String,
    nick: String,
    channels: Vec<String>,
    handler: Arc<dyn InboundHandler>,
    replies: mpsc::Sender<Command>,
}

impl Session {
    async fn run(
        self,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        mut cmd_rx: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        let mut answering = JoinSet::new();
        if let Err(e) = self
            .pump(&mut reader, &mut writer, &mut cmd_rx, &mut answering, &cancel)
            .await
        {
            tracing::warn!(tenant_id = %self.tenant_id, error = %e, "IRC connection lost");
        }
        // answers still being worked out die with the connection
        answering.shutdown().await;
        let _ = writer.shutdown().await;
    }

    async fn pump(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        cmd_rx: &mut mpsc::Receiver<Command>,
        answering: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // read_until keeps partial input across cancelled polls
        let mut buf = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = send_line(writer, "QUIT :shutting down").await;
                    return Ok(());
                }
                result = reader.read_until(b'\n', &mut buf) => {
                    if result? == 0 {
                        anyhow::bail!("EOF");
                    }
                    let line = Line::parse(&String::from_utf8_lossy(&buf));
                    buf.clear();
                    if let Some(line) = line {
                        self.on_line(writer, answering, line).await?;
                    }
                }
                Some(_) = answering.join_next(), if !answering.is_empty() => {}
                Some(cmd) = cmd_rx.recv() => match cmd {
                    Command::Privmsg { target, text } => {
                        send_line(writer, &format!("PRIVMSG {target} :{text}")).await?;
                    }
                },
            }
        }
    }

    async fn on_line(
        &self,
        writer: &mut OwnedWriteHalf,
        answering: &mut JoinSet<()>,
        line: Line,
    ) -> Result<()> {
        match line.command.as_str() {
            "PING" => {
                let token = line.params.first().map(String::as_str).unwrap_or("");
                send_line(writer, &format!("PONG :{token}")).await?;
            }
            "PRIVMSG" => {
                let (Some(target), Some(text)) = (line.params.first(), line.params.get(1)) else {
                    return Ok(());
                };
                let from = line.nick().unwrap_or("");
                if from.eq_ignore_ascii_case(&self.nick)
                    || !self.channels.iter().any(|c| c.eq_ignore_ascii_case(target))
                    || text.starts_with('\x01')
                    || text.trim().is_empty()
                {
                    return Ok(());
                }
                self.dispatch(answering, InboundMessage {
                    channel_id: target.clone(),
                    sender: from.to_string(),
                    text: text.clone(),
                });
            }
            "KICK" => {
                if let Some(channel) = line.params.first()
                    && line.params.get(1).is_some_and(|n| n.eq_ignore_ascii_case(&self.nick))
                {
                    tracing::warn!(tenant_id = %self.tenant_id, %channel, "Kicked, rejoining");
                    send_line(writer, &format!("JOIN {channel}")).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Answer off the read loop; the reply goes back through the command
    /// queue so the writer stays single-owner.
    fn dispatch(&self, answering: &mut JoinSet<()>, message: InboundMessage) {
        let handler = Arc::clone(&self.handler);
        let replies = self.replies.clone();
        answering.spawn(async move {
            let channel = message.channel_id.clone();
            let reply = handler.on_message(message).await;
            for line in wrap_lines(&reply, MAX_LINE) {
                let cmd = Command::Privmsg {
                    target: channel.clone(),
                    text: line,
                };
                if replies.send(cmd).await.is_err() {
                    break;
                }
                tokio::time::sleep(LINE_PACING).await;
            }
        });
    }
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    Ok(())
}

/// A parsed IRC protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    prefix: Option<String>,
    command: String,
    params: Vec<String>,
}

impl Line {
    fn parse(raw: &str) -> Option<Self> {
        let mut rest = raw.trim_end_matches(['\r', '\n']);
        if let Some(tagged) = rest.strip_prefix('@') {
            rest = tagged.split_once(' ')?.1;
        }
        let prefix = match rest.strip_prefix(':') {
            Some(prefixed) => {
                let (prefix, tail) = prefixed.split_once(' ')?;
                rest = tail;
                Some(prefix.to_string())
            }
            None => None,
        };
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut parts = head.split_whitespace();
        let command = parts.next()?.to_uppercase();
        let mut params: Vec<String> = parts.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }
        Some(Self {
            prefix,
            command,
            params,
        })
    }

    fn nick(&self) -> Option<&str> {
        self.prefix.as_deref().and_then(|p| p.split('!').next())
    }
}

/// IRC-safe nick for a tenant.
fn nick_for(prefix: &str, tenant_id: &str) -> String {
    let mut nick: String = format!("{prefix}{tenant_id}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    nick.truncate(30);
    nick
}

/// Wrap text into lines of at most `max_len` bytes, breaking on spaces.
/// Words longer than a line are cut on char boundaries.
fn wrap_lines(text: &str, max_len: usize) -> Vec<String> {
    let mut result = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.len() <= max_len {
            result.push(line.to_string());
            continue;
        }
        let mut current = String::new();
        for word in line.split_whitespace() {
            if word.len() > max_len {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
                let mut pieces = split_word(word, max_len);
                // the tail can still share a line with what follows
                if let Some(tail) = pieces.pop() {
                    result.extend(pieces);
                    current = tail;
                }
                continue;
            }
            if !current.is_empty() && current.len() + word.len() + 1 > max_len {
                result.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            result.push(current);
        }
    }
    result
}

/// Cut `word` into pieces of at most `max_len` bytes without splitting a
/// UTF-8 sequence.
fn split_word(word: &str, max_len: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut piece = String::new();
    for c in word.chars() {
        if !piece.is_empty() && piece.len() + c.len_utf8() > max_len {
            pieces.push(std::mem::take(&mut piece));
        }
        piece.push(c);
    }
    if !piece.is_empty() {
        pieces.push(piece);
    }
    pieces
}
