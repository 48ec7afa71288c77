use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{
    client::ReceiverConfig,
    frame::DEFAULT_MAX_FRAME_LEN,
    server::{ServerConfig, UnknownOperations},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the server should bind to, as host:port. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: String,

    /// Replies that may queue up for one client before the server stops reading its requests.
    #[arg(long, default_value_t = 64)]
    pub mailbox_capacity: usize,

    /// Largest frame, in bytes, the server accepts from a client.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,

    /// Answer unknown operation types with an error instead of an empty `ok`.
    #[arg(long)]
    pub reject_unknown_operations: bool,
}

impl ServerArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            mailbox_capacity: self.mailbox_capacity.max(1),
            max_frame_len: self.max_frame_bytes,
            unknown_operations: if self.reject_unknown_operations {
                UnknownOperations::Reject
            } else {
                UnknownOperations::Ignore
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name other participants see.
    #[arg(long)]
    pub name: String,

    /// Address of the server, as host:port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: String,

    /// How often, in milliseconds, a waiting read checks whether to stop.
    #[arg(long, default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Seconds of server silence before the client notes it in the log.
    #[arg(long, default_value_t = 600)]
    pub idle_timeout_secs: u64,
}

impl ClientArgs {
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}
