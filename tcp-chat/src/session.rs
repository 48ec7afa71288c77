//! Per-connection state machine: handshake, operation loop, teardown.
//!
//! A connection runs as two tasks. The session task is the only reader and
//! processes operations one at a time, in arrival order. A companion writer
//! task owns the write half and drains the session's mailbox, which carries
//! both the session's own replies and messages pushed by the router. The two
//! share a cancellation token so either side going away stops the other.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Result, anyhow, bail};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    envelope::{Identity, Message, Operation, OperationType, Response},
    error::{OperationError, UnknownOperationType},
    frame::{FrameReader, write_record},
    router::{Mailbox, MailboxReceiver, SessionId, mailbox},
    server::{ServerState, UnknownOperations},
};

pub(crate) async fn handle_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut frames =
        FrameReader::with_max_frame_len(BufReader::new(reader), state.config.max_frame_len);

    let (outbox, inbox) = mailbox(state.config.mailbox_capacity);
    let writer_task = spawn_writer(writer, inbox, cancel.clone());

    let result = serve(&state, &mut frames, &outbox, &cancel, peer).await;

    cancel.cancel();
    drop(outbox);
    match writer_task.await {
        Ok(Err(err)) => debug!(?peer, error = ?err, "failed to write to client"),
        Err(err) => warn!(?peer, error = ?err, "writer task failed"),
        Ok(Ok(())) => {}
    }

    result
}

async fn serve<R>(
    state: &ServerState,
    frames: &mut FrameReader<R>,
    outbox: &Mailbox,
    cancel: &CancellationToken,
    peer: Option<SocketAddr>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let Some(identity) = perform_handshake(frames, outbox, cancel).await? else {
        debug!(?peer, "connection closed before handshake");
        return Ok(());
    };

    let session = state.router.next_session_id();
    state
        .router
        .register(session, identity.clone(), outbox.clone())
        .await;
    info!(?peer, session, name = %identity.name, id = %identity.id, "session joined");

    let welcome = Response::ok_with(OperationType::AboutMe, &identity)
        .unwrap_or_else(|err| failure(session, Some(OperationType::AboutMe), err));
    let result = match deliver(outbox, welcome).await {
        Ok(()) => run_session(state, session, &identity, frames, outbox, cancel).await,
        Err(err) => Err(err),
    };

    cleanup_session(state, session, peer).await;
    result
}

/// Waits for the bare identity frame that opens every connection.
async fn perform_handshake<R>(
    frames: &mut FrameReader<R>,
    outbox: &Mailbox,
    cancel: &CancellationToken,
) -> Result<Option<Identity>>
where
    R: AsyncBufRead + Unpin,
{
    let frame = select! {
        _ = cancel.cancelled() => return Ok(None),
        frame = frames.read_frame() => frame?,
    };
    let Some(frame) = frame else {
        return Ok(None);
    };

    match serde_json::from_slice::<Identity>(&frame) {
        Ok(identity) => Ok(Some(identity)),
        Err(source) => {
            let error = OperationError::Malformed {
                what: "identity",
                source,
            };
            deliver(
                outbox,
                Response::error(Some(OperationType::AboutMe), error.to_string()),
            )
            .await?;
            bail!("handshake failed: {error}");
        }
    }
}

async fn run_session<R>(
    state: &ServerState,
    session: SessionId,
    identity: &Identity,
    frames: &mut FrameReader<R>,
    outbox: &Mailbox,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let frame = select! {
            _ = cancel.cancelled() => {
                debug!(session, "session cancelled");
                return Ok(());
            }
            frame = frames.read_frame() => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        let response = match Operation::decode(&frame) {
            Ok(operation) => dispatch(state, session, identity, operation).await,
            Err(rejected) => failure(session, rejected.kind, rejected.error),
        };
        deliver(outbox, response).await?;
    }
}

async fn dispatch(
    state: &ServerState,
    session: SessionId,
    identity: &Identity,
    operation: Operation,
) -> Response {
    let kind = operation.kind();
    let result = match operation {
        Operation::Create { nickname } => create_conversation(state, &nickname).await,
        Operation::Subscribe { nickname } => subscribe(state, session, &nickname).await,
        Operation::Message(message) => publish(state, identity, message).await,
        Operation::List => list_conversations(state).await,
        Operation::Unknown(name) => unknown_operation(state.config.unknown_operations, name),
    };

    result.unwrap_or_else(|err| failure(session, kind, err))
}

async fn create_conversation(state: &ServerState, nickname: &str) -> Result<Response, OperationError> {
    let conversation = state.registry.create(nickname).await?;
    info!(nickname = %conversation.nickname, id = %conversation.id, "conversation created");
    Response::ok_with(OperationType::Create, &conversation)
}

async fn subscribe(
    state: &ServerState,
    session: SessionId,
    nickname: &str,
) -> Result<Response, OperationError> {
    let conversation = state.registry.lookup_by_nickname(nickname).await?;
    if !state.router.subscribe(session, &conversation).await {
        warn!(session, "subscribe from a session the router no longer knows");
    }
    debug!(session, nickname, "subscribed");
    Response::ok_with(OperationType::Subscribe, &conversation)
}

async fn publish(
    state: &ServerState,
    identity: &Identity,
    message: Message,
) -> Result<Response, OperationError> {
    // The registry's record is authoritative, and a session speaks only as
    // the identity it introduced itself with.
    let conversation = state
        .registry
        .lookup_by_nickname(&message.conversation.nickname)
        .await?;
    let message = Message {
        conversation,
        sender: identity.clone(),
        text: message.text,
    };

    let delivered = state.router.publish(&message).await?;
    debug!(
        conversation = %message.conversation.nickname,
        delivered,
        "message published"
    );
    Ok(Response::ok_empty(Some(OperationType::Message)))
}

async fn list_conversations(state: &ServerState) -> Result<Response, OperationError> {
    let conversations = state.registry.list().await;
    Response::ok_with(OperationType::List, &conversations)
}

fn unknown_operation(policy: UnknownOperations, name: String) -> Result<Response, OperationError> {
    match policy {
        UnknownOperations::Ignore => Ok(Response::ok_empty(None)),
        UnknownOperations::Reject => Err(UnknownOperationType(name).into()),
    }
}

fn failure(session: SessionId, kind: Option<OperationType>, err: OperationError) -> Response {
    debug!(session, error = ?err, "operation failed");
    Response::error(kind, err.to_string())
}

async fn deliver(outbox: &Mailbox, response: Response) -> Result<()> {
    outbox
        .reply(response)
        .await
        .map_err(|_| anyhow!("connection writer has gone away"))
}

async fn cleanup_session(state: &ServerState, session: SessionId, peer: Option<SocketAddr>) {
    if let Some(identity) = state.router.unregister(session).await {
        info!(?peer, session, name = %identity.name, "session left");
    }
}

fn spawn_writer<W>(
    writer: W,
    mailbox: MailboxReceiver,
    cancel: CancellationToken,
) -> JoinHandle<std::io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(drain_mailbox(writer, mailbox, cancel))
}

/// Writes queued responses until the mailbox closes or the session is
/// cancelled. Responses already queued when cancellation arrives are still
/// written as long as the socket accepts them without blocking.
async fn drain_mailbox<W>(
    mut writer: W,
    mut mailbox: MailboxReceiver,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let response = select! {
            biased;
            response = mailbox.recv() => response,
            _ = cancel.cancelled() => None,
        };
        let Some(response) = response else {
            break Ok(());
        };

        let written = select! {
            biased;
            written = write_record(&mut writer, &response) => written,
            _ = cancel.cancelled() => break Ok(()),
        };
        if let Err(err) = written {
            // Nobody can hear this session any more; stop its reader too.
            cancel.cancel();
            break Err(err);
        }
    };

    mailbox.close();
    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down writer");
    }
    result
}
