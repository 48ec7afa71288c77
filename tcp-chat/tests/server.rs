use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use tcp_chat::{
    envelope::{Conversation, Identity, Message, Operation, OperationType, Response, Status},
    frame::{FrameReader, write_frame, write_record},
    server::{Server, ServerConfig, UnknownOperations},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

struct TestServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::with_config(listener, config);
        let addr = server.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct TestClient {
    identity: Identity,
    frames: FrameReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn raw(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            identity: Identity::generate("nobody"),
            frames: FrameReader::new(BufReader::new(reader)),
            writer,
        })
    }

    async fn join(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut client = Self::raw(addr).await?;
        client.identity = Identity::generate(name);
        write_record(&mut client.writer, &client.identity).await?;

        let welcome = client.next().await?;
        assert_eq!(welcome.status, Status::Ok);
        assert_eq!(welcome.operation_type, Some(OperationType::AboutMe));
        assert_eq!(welcome.payload::<Identity>()?, client.identity);

        Ok(client)
    }

    async fn next(&mut self) -> Result<Response> {
        let frame = timeout(READ_TIMEOUT, self.frames.read_frame())
            .await
            .context("timed out waiting for a response")??
            .context("server closed the connection")?;
        Ok(serde_json::from_slice(&frame)?)
    }

    async fn request(&mut self, operation: Operation) -> Result<Response> {
        write_frame(&mut self.writer, &operation.encode()?).await?;
        self.next().await
    }

    async fn send_raw(&mut self, frame: &[u8]) -> Result<Response> {
        write_frame(&mut self.writer, frame).await?;
        self.next().await
    }

    async fn create(&mut self, nickname: &str) -> Result<Response> {
        self.request(Operation::Create {
            nickname: nickname.into(),
        })
        .await
    }

    async fn subscribe(&mut self, nickname: &str) -> Result<Response> {
        self.request(Operation::Subscribe {
            nickname: nickname.into(),
        })
        .await
    }

    async fn say(&mut self, nickname: &str, text: &str) -> Result<Response> {
        self.request(Operation::Message(Message {
            conversation: Conversation::named(nickname),
            sender: self.identity.clone(),
            text: text.into(),
        }))
        .await
    }

    async fn assert_quiet(&mut self) {
        let read = timeout(QUIET_PERIOD, self.frames.read_frame()).await;
        assert!(read.is_err(), "expected no traffic, got {read:?}");
    }

    async fn assert_closed(&mut self) -> Result<()> {
        let frame = timeout(READ_TIMEOUT, self.frames.read_frame())
            .await
            .context("timed out waiting for close")??;
        assert!(frame.is_none(), "expected end of stream");
        Ok(())
    }
}

fn error_message(response: &Response) -> &str {
    assert_eq!(response.status, Status::Error, "expected an error: {response:?}");
    response
        .error
        .as_ref()
        .map(|error| error.message.as_str())
        .unwrap_or_default()
}

#[tokio::test]
async fn only_subscribers_receive_published_messages() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(server.addr, "alice").await?;
    let mut bob = TestClient::join(server.addr, "bob").await?;

    let created = alice.create("general").await?;
    let general: Conversation = created.payload()?;
    assert_eq!(general.nickname, "general");

    let subscribed = alice.subscribe("general").await?;
    assert_eq!(subscribed.status, Status::Ok);
    assert_eq!(subscribed.payload::<Conversation>()?, general);

    let ack = bob.say("general", "hello alice").await?;
    assert_eq!(ack, Response::ok_empty(Some(OperationType::Message)));

    let pushed = alice.next().await?;
    assert_eq!(pushed.operation_type, Some(OperationType::Message));
    let message: Message = pushed.payload()?;
    assert_eq!(message.text, "hello alice");
    assert_eq!(message.sender, bob.identity);
    assert_eq!(message.conversation, general);

    bob.assert_quiet().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn every_subscriber_gets_its_own_copy() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut speaker = TestClient::join(server.addr, "speaker").await?;
    speaker.create("town-square").await?;

    let mut listeners = Vec::new();
    for name in ["ann", "ben", "cat"] {
        let mut listener = TestClient::join(server.addr, name).await?;
        listener.subscribe("town-square").await?;
        listeners.push(listener);
    }

    speaker.say("town-square", "hear ye").await?;

    for listener in &mut listeners {
        let message: Message = listener.next().await?.payload()?;
        assert_eq!(message.text, "hear ye");
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn subscriber_that_falls_behind_still_gets_every_message() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(server.addr, "alice").await?;
    let mut bob = TestClient::join(server.addr, "bob").await?;
    alice.create("g").await?;
    alice.subscribe("g").await?;

    // Far more than the reply capacity and the socket buffers hold while
    // alice is not reading.
    let bulk = "x".repeat(8 * 1024);
    let published = 300;
    for n in 0..published {
        let ack = bob.say("g", &format!("{n} {bulk}")).await?;
        assert_eq!(ack.status, Status::Ok);
    }

    for n in 0..published {
        let message: Message = alice.next().await?.payload()?;
        let (seq, _) = message
            .text
            .split_once(' ')
            .context("sequence number prefix")?;
        assert_eq!(seq, n.to_string());
    }
    alice.assert_quiet().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_nickname_does_not_end_the_session() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(server.addr, "alice").await?;

    let response = alice.subscribe("ghost").await?;
    assert_eq!(response.operation_type, Some(OperationType::Subscribe));
    assert!(error_message(&response).contains("ghost"));

    let created = alice.create("real").await?;
    assert_eq!(created.status, Status::Ok);
    let subscribed = alice.subscribe("real").await?;
    assert_eq!(subscribed.status, Status::Ok);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_and_fallback_nicknames() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(server.addr, "alice").await?;
    let mut bob = TestClient::join(server.addr, "bob").await?;

    assert_eq!(alice.create("general").await?.status, Status::Ok);
    let duplicate = bob.create("general").await?;
    assert!(error_message(&duplicate).contains("already exists"));

    assert_eq!(bob.create("random").await?.status, Status::Ok);
    let fallback: Conversation = alice.create("").await?.payload()?;
    assert_eq!(fallback.nickname, "2");

    let listed: Vec<Conversation> = bob.request(Operation::List).await?.payload()?;
    let nicknames: Vec<_> = listed.iter().map(|c| c.nickname.as_str()).collect();
    assert_eq!(nicknames, ["general", "random", "2"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_operations_are_answered_not_fatal() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(server.addr, "alice").await?;

    let not_json = alice.send_raw(b"definitely not json").await?;
    assert!(error_message(&not_json).contains("unmarshaling"));

    let bad_payload = alice
        .send_raw(br#"{"type":"message","message":"no record here"}"#)
        .await?;
    assert_eq!(bad_payload.operation_type, Some(OperationType::Message));
    assert!(error_message(&bad_payload).contains("message"));

    let empty = alice.send_raw(b"").await?;
    assert_eq!(empty.status, Status::Error);

    let listed = alice.request(Operation::List).await?;
    assert_eq!(listed.status, Status::Ok);
    assert_eq!(listed.payload::<Vec<Conversation>>()?, Vec::new());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_operation_types_follow_configuration() -> Result<()> {
    let lenient = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(lenient.addr, "alice").await?;
    let ignored = alice.request(Operation::Unknown("dance".into())).await?;
    assert_eq!(ignored, Response::ok_empty(None));
    lenient.stop().await;

    let strict = TestServer::start(ServerConfig {
        unknown_operations: UnknownOperations::Reject,
        ..ServerConfig::default()
    })
    .await?;
    let mut bob = TestClient::join(strict.addr, "bob").await?;
    let rejected = bob.request(Operation::Unknown("dance".into())).await?;
    assert!(error_message(&rejected).contains("dance"));
    assert_eq!(bob.request(Operation::List).await?.status, Status::Ok);
    strict.stop().await;

    Ok(())
}

#[tokio::test]
async fn bad_handshake_is_answered_then_closed() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut stranger = TestClient::raw(server.addr).await?;

    let response = stranger
        .send_raw(br#"{"type":"list","message":{}}"#)
        .await?;
    assert_eq!(response.operation_type, Some(OperationType::AboutMe));
    assert!(error_message(&response).contains("identity"));
    stranger.assert_closed().await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn departed_subscriber_does_not_disturb_others() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(server.addr, "alice").await?;
    let mut bob = TestClient::join(server.addr, "bob").await?;
    alice.create("general").await?;
    alice.subscribe("general").await?;
    bob.subscribe("general").await?;

    alice.writer.shutdown().await?;
    drop(alice);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut carol = TestClient::join(server.addr, "carol").await?;
    let ack = carol.say("general", "anyone left?").await?;
    assert_eq!(ack.status, Status::Ok);

    let message: Message = bob.next().await?.payload()?;
    assert_eq!(message.text, "anyone left?");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_open_sessions() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = TestClient::join(server.addr, "alice").await?;

    server.stop().await;
    alice.assert_closed().await?;
    Ok(())
}
