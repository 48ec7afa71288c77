use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    select,
    sync::{
        Mutex,
        mpsc::{self, error::SendError},
    },
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    envelope::{Conversation, Identity, Message, OperationType, Response},
    error::OperationError,
};

pub type SessionId = u64;

/// Outbound queue of one connection, drained by the task that owns the
/// connection's write half.
///
/// The session's own replies and messages pushed by the router travel on
/// separate channels. Replies are bounded, so a client that stops reading
/// eventually stalls its own operation loop. Pushes are unbounded, so a
/// publisher never waits on a subscriber and an open subscriber never loses
/// a message.
#[derive(Debug, Clone)]
pub struct Mailbox {
    replies: mpsc::Sender<Response>,
    pushes: mpsc::UnboundedSender<Response>,
}

/// Receiving end of a [`Mailbox`].
#[derive(Debug)]
pub struct MailboxReceiver {
    replies: mpsc::Receiver<Response>,
    pushes: mpsc::UnboundedReceiver<Response>,
}

pub fn mailbox(reply_capacity: usize) -> (Mailbox, MailboxReceiver) {
    let (replies_tx, replies_rx) = mpsc::channel(reply_capacity);
    let (pushes_tx, pushes_rx) = mpsc::unbounded_channel();
    (
        Mailbox {
            replies: replies_tx,
            pushes: pushes_tx,
        },
        MailboxReceiver {
            replies: replies_rx,
            pushes: pushes_rx,
        },
    )
}

impl Mailbox {
    /// Queues a reply, waiting for room. Fails once the receiver is gone.
    pub async fn reply(&self, response: Response) -> Result<(), SendError<Response>> {
        self.replies.send(response).await
    }

    /// Queues a pushed message without waiting. Fails once the receiver is
    /// gone.
    pub fn push(&self, response: Response) -> Result<(), SendError<Response>> {
        self.pushes.send(response)
    }
}

impl MailboxReceiver {
    /// Next queued response from either channel. Returns `None` once both are
    /// closed and empty. Cancel safe.
    pub async fn recv(&mut self) -> Option<Response> {
        select! {
            biased;
            Some(response) = self.replies.recv() => Some(response),
            Some(response) = self.pushes.recv() => Some(response),
            else => None,
        }
    }

    pub fn close(&mut self) {
        self.replies.close();
        self.pushes.close();
    }
}

/// Fans published messages out to every subscribed session.
///
/// Each session has its own mailbox, so one publish produces one delivery
/// per subscriber. The session table, including every subscription set, sits
/// behind a single lock and is only read or written while holding it.
pub struct Router {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
}

struct SessionEntry {
    identity: Identity,
    subscriptions: HashSet<Uuid>,
    mailbox: Mailbox,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, session: SessionId, identity: Identity, mailbox: Mailbox) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            session,
            SessionEntry {
                identity,
                subscriptions: HashSet::new(),
                mailbox,
            },
        );
    }

    /// Adds `conversation` to the session's subscription set. Returns `false`
    /// if the session is not registered.
    pub async fn subscribe(&self, session: SessionId, conversation: &Conversation) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&session) {
            Some(entry) => {
                entry.subscriptions.insert(conversation.id);
                true
            }
            None => false,
        }
    }

    pub async fn subscriptions(&self, session: SessionId) -> HashSet<Uuid> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&session)
            .map(|entry| entry.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Drops the session together with its subscriptions and its handle on
    /// the mailbox.
    pub async fn unregister(&self, session: SessionId) -> Option<Identity> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&session).map(|entry| entry.identity)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Queues `message` on the mailbox of every session subscribed to its
    /// conversation and returns how many mailboxes accepted it.
    ///
    /// Never waits on a subscriber. Only a session that is already closing
    /// misses the message.
    pub async fn publish(&self, message: &Message) -> Result<usize, OperationError> {
        let push = Response::ok_with(OperationType::Message, message)?;
        let conversation = message.conversation.id;

        let sessions = self.sessions.lock().await;
        let mut delivered = 0;
        for (session, entry) in sessions.iter() {
            if !entry.subscriptions.contains(&conversation) {
                continue;
            }

            match entry.mailbox.push(push.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => debug!(
                    session,
                    name = %entry.identity.name,
                    "mailbox closed, skipping"
                ),
            }
        }

        Ok(delivered)
    }
}
