use std::{io, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stderr, Stdout},
    net::TcpStream,
    select,
    sync::Mutex,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    envelope::{Conversation, Identity, Message, Operation, Response, ServerEvent},
    frame::{FrameReader, write_frame, write_record},
    prompt::{ConsoleCommand, USAGE},
};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Longest a single read may block before the cancellation token is
    /// checked again.
    pub poll_interval: Duration,
    /// Silence from the server longer than this is logged. It never ends the
    /// receive loop.
    pub idle_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(10 * 60),
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    let identity = Identity::generate(args.name.as_str());
    let cache = ConversationCache::default();
    let cancel = CancellationToken::new();

    let mut issuer = Issuer::new(writer, identity, cache.clone());
    issuer.handshake().await?;

    let receiver = Receiver::new(
        FrameReader::new(BufReader::new(reader)),
        cache,
        Console::stdio(),
        cancel.clone(),
        args.receiver_config(),
    );
    let receiver_task = tokio::spawn(receive(receiver));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let result = run_issuer_loop(&mut issuer, &mut stdin, &mut input, &cancel).await;

    cancel.cancel();
    if let Err(error) = receiver_task.await {
        warn!(?error, "receiver task failed");
    }
    issuer.shutdown().await;

    result
}

async fn receive<R, O, E>(mut receiver: Receiver<R, O, E>)
where
    R: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    match receiver.run().await {
        Ok(ReceiveEnd::Cancelled) => {}
        Ok(ReceiveEnd::ServerClosed) => {
            if let Err(error) = receiver.console.line("*** server closed the connection").await {
                warn!(?error, "failed to write to stdout");
            }
        }
        Err(error) => warn!(?error, "lost connection to server"),
    }
    // Whatever stopped the receiver, the issuer has nobody left to talk to.
    receiver.cancel.cancel();
}

async fn run_issuer_loop<W, I>(
    issuer: &mut Issuer<W>,
    stdin: &mut I,
    input: &mut String,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
{
    loop {
        input.clear();
        select! {
            _ = cancel.cancelled() => break,
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, issuer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input<W>(
    bytes_read: io::Result<usize>,
    input: &str,
    issuer: &mut Issuer<W>,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    if bytes_read? == 0 {
        return Ok(false);
    }
    if input.trim().is_empty() {
        return Ok(true);
    }

    let command = match ConsoleCommand::parse(input) {
        Ok(command) => command,
        Err(error) => {
            write_stderr(&format!("!!! {error}")).await?;
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        ConsoleCommand::Help => write_stdout(USAGE).await?,
        command => issuer
            .execute(command)
            .await
            .context("failed to send operation")?,
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// The client's copy of the server's conversation list, replaced wholesale by
/// every `list` response.
#[derive(Debug, Clone, Default)]
pub struct ConversationCache {
    conversations: Arc<Mutex<Vec<Conversation>>>,
}

impl ConversationCache {
    pub async fn replace(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().await = conversations;
    }

    pub async fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.lock().await.clone()
    }

    pub async fn find(&self, nickname: &str) -> Option<Conversation> {
        self.conversations
            .lock()
            .await
            .iter()
            .find(|conversation| conversation.nickname == nickname)
            .cloned()
    }
}

/// The only writer on a client connection.
pub struct Issuer<W> {
    writer: W,
    identity: Identity,
    cache: ConversationCache,
}

impl<W> Issuer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, identity: Identity, cache: ConversationCache) -> Self {
        Self {
            writer,
            identity,
            cache,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Introduces this client. Must be the first frame on the connection.
    pub async fn handshake(&mut self) -> io::Result<()> {
        write_record(&mut self.writer, &self.identity).await
    }

    pub async fn issue(&mut self, operation: &Operation) -> io::Result<()> {
        let payload = operation
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        write_frame(&mut self.writer, &payload).await
    }

    pub async fn execute(&mut self, command: ConsoleCommand) -> io::Result<()> {
        let operation = match command {
            ConsoleCommand::Create { nickname } => Operation::Create { nickname },
            ConsoleCommand::Subscribe { nickname } => Operation::Subscribe { nickname },
            ConsoleCommand::Message { nickname, text } => self.message(&nickname, text).await,
            ConsoleCommand::List => Operation::List,
            ConsoleCommand::Help | ConsoleCommand::Quit => return Ok(()),
        };
        self.issue(&operation).await
    }

    async fn message(&self, nickname: &str, text: String) -> Operation {
        let conversation = self
            .cache
            .find(nickname)
            .await
            .unwrap_or_else(|| Conversation::named(nickname));
        Operation::Message(Message {
            conversation,
            sender: self.identity.clone(),
            text,
        })
    }

    pub async fn shutdown(&mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }
}

/// Where the receiver renders what the server says.
pub struct Console<O, E> {
    pub out: O,
    pub err: E,
}

impl Console<Stdout, Stderr> {
    pub fn stdio() -> Self {
        Self {
            out: tokio::io::stdout(),
            err: tokio::io::stderr(),
        }
    }
}

impl<O, E> Console<O, E>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    pub async fn line(&mut self, line: &str) -> io::Result<()> {
        write_line(&mut self.out, line).await
    }

    pub async fn error(&mut self, line: &str) -> io::Result<()> {
        write_line(&mut self.err, line).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    Cancelled,
    ServerClosed,
}

/// The only reader on a client connection.
pub struct Receiver<R, O, E> {
    frames: FrameReader<R>,
    cache: ConversationCache,
    console: Console<O, E>,
    cancel: CancellationToken,
    config: ReceiverConfig,
}

impl<R, O, E> Receiver<R, O, E>
where
    R: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    pub fn new(
        frames: FrameReader<R>,
        cache: ConversationCache,
        console: Console<O, E>,
        cancel: CancellationToken,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            frames,
            cache,
            console,
            cancel,
            config,
        }
    }

    /// Reads and renders responses until cancelled or the server hangs up.
    ///
    /// Each read is bounded by the poll interval. An expired read is not a
    /// failure: the frame reader keeps the bytes it already has and the
    /// next attempt resumes where this one stopped.
    pub async fn run(&mut self) -> io::Result<ReceiveEnd> {
        let mut last_heard = Instant::now();

        loop {
            let read = select! {
                _ = self.cancel.cancelled() => return Ok(ReceiveEnd::Cancelled),
                read = timeout(self.config.poll_interval, self.frames.read_frame()) => read,
            };

            let frame = match read {
                Ok(frame) => frame?,
                Err(_elapsed) => {
                    if self.cancel.is_cancelled() {
                        return Ok(ReceiveEnd::Cancelled);
                    }
                    if last_heard.elapsed() >= self.config.idle_timeout {
                        info!(idle = ?last_heard.elapsed(), "no traffic from server, still listening");
                        last_heard = Instant::now();
                    }
                    continue;
                }
            };

            let Some(frame) = frame else {
                return Ok(ReceiveEnd::ServerClosed);
            };
            last_heard = Instant::now();
            self.handle_frame(&frame).await?;
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let response: Response = match serde_json::from_slice(frame) {
            Ok(response) => response,
            Err(error) => {
                warn!(?error, "ignoring malformed response");
                return Ok(());
            }
        };

        match ServerEvent::try_from(response) {
            Ok(event) => self.apply(event).await,
            Err(error) => {
                debug!(?error, "ignoring response with unexpected payload");
                Ok(())
            }
        }
    }

    pub async fn apply(&mut self, event: ServerEvent) -> io::Result<()> {
        match event {
            ServerEvent::Welcome(identity) => {
                self.console
                    .line(&format!("*** connected as {}", identity.name))
                    .await
            }
            ServerEvent::Created(conversation) => {
                self.console
                    .line(&format!("*** created conversation {}", conversation.nickname))
                    .await
            }
            ServerEvent::Subscribed(conversation) => {
                self.console
                    .line(&format!("*** subscribed to {}", conversation.nickname))
                    .await
            }
            ServerEvent::Conversations(conversations) => {
                let line = if conversations.is_empty() {
                    "*** no conversations yet".to_string()
                } else {
                    let nicknames: Vec<_> = conversations
                        .iter()
                        .map(|conversation| conversation.nickname.as_str())
                        .collect();
                    format!("*** conversations: {}", nicknames.join(", "))
                };
                self.cache.replace(conversations).await;
                self.console.line(&line).await
            }
            ServerEvent::Delivered(message) => {
                self.console
                    .line(&format!(
                        "[{}] <{}> {}",
                        message.conversation.nickname, message.sender.name, message.text
                    ))
                    .await
            }
            ServerEvent::Acknowledged(_) => Ok(()),
            ServerEvent::Failed { message, .. } => self.console.error(&format!("!!! {message}")).await,
        }
    }

    pub fn into_console(self) -> Console<O, E> {
        self.console
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    write_line(&mut tokio::io::stdout(), line).await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    write_line(&mut tokio::io::stderr(), line).await
}
