use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{frame::DEFAULT_MAX_FRAME_LEN, registry::Registry, router::Router, session};

/// What the server does with an operation type it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownOperations {
    /// Reply `ok` with an empty payload.
    #[default]
    Ignore,
    /// Reply with an error naming the type.
    Reject,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Replies a session may have queued before its operation loop waits for
    /// the client to catch up. Pushed messages are not counted.
    pub mailbox_capacity: usize,
    pub max_frame_len: usize,
    pub unknown_operations: UnknownOperations,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            unknown_operations: UnknownOperations::Ignore,
        }
    }
}

/// State shared by every session of one server.
pub(crate) struct ServerState {
    pub(crate) registry: Registry,
    pub(crate) router: Router,
    pub(crate) config: ServerConfig,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            router: Router::new(),
            config,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_config(listener, ServerConfig::default())
    }

    pub fn with_config(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then cancels every
    /// open session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        let sessions = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&sessions);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &sessions);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(sessions: &CancellationToken) {
    info!("server shutting down");
    sessions.cancel();
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    sessions: &CancellationToken,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, state, sessions.child_token()),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    cancel: CancellationToken,
) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = session::handle_connection(stream, state, cancel).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}
