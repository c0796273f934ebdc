use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdout, Command},
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("stream-cable");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let url = read_server_url(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = connect(&url).await?;
    let mut bob = connect(&url).await?;
    let alice_room = join(&mut alice, "alice", "lobby").await?;
    let bob_room = join(&mut bob, "bob", "lobby").await?;

    // Alice greets Bob; the broadcast reaches both participants.
    speak(&mut alice, &alice_room, "Hello from Alice").await?;
    let greeting = json!({ "nickname": "alice", "message": "Hello from Alice" });
    assert_eq!(
        next_json(&mut bob, "waiting for bob to hear alice").await?,
        json!({ "identifier": bob_room, "message": greeting })
    );
    assert_eq!(
        next_json(&mut alice, "waiting for alice echo").await?,
        json!({ "identifier": alice_room, "message": greeting })
    );

    // Alice moves to another room; Bob's reply only reaches Bob. Alice's
    // frames are handled in order, so the new confirmation means she left.
    alice
        .send(Message::text(
            json!({ "command": "unsubscribe", "identifier": alice_room }).to_string(),
        ))
        .await
        .context("alice unsubscribe")?;
    join(&mut alice, "alice", "quiet").await?;
    speak(&mut bob, &bob_room, "Hi Alice!").await?;
    let reply = json!({ "nickname": "bob", "message": "Hi Alice!" });
    assert_eq!(
        next_json(&mut bob, "waiting for bob echo").await?,
        json!({ "identifier": bob_room, "message": reply })
    );
    assert!(
        timeout(Duration::from_millis(200), alice.next()).await.is_err(),
        "alice should hear nothing after leaving"
    );

    alice.close(None).await.context("alice close")?;
    bob.close(None).await.context("bob close")?;

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--ping-interval")
        .arg("0")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_url(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    loop {
        let line = read_line(reader)
            .await?
            .context("server exited before listening")?;
        if !line.contains("listening on") {
            continue;
        }

        let url = line
            .split_whitespace()
            .last()
            .context("unexpected server banner format")?;
        if !url.starts_with("ws://") {
            return Err(anyhow!("server banner missing url: {line}"));
        }
        return Ok(url.to_string());
    }
}

async fn connect(url: &str) -> Result<Socket> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("actioncable-v1-json"),
    );
    let (mut socket, _) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let welcome = next_json(&mut socket, "waiting for welcome").await?;
    if welcome != json!({ "type": "welcome" }) {
        bail!("expected welcome, got {welcome}");
    }
    Ok(socket)
}

async fn join(socket: &mut Socket, nickname: &str, room: &str) -> Result<String> {
    let identifier =
        json!({ "channel": "ChatChannel", "room": room, "nickname": nickname }).to_string();
    socket
        .send(Message::text(
            json!({ "command": "subscribe", "identifier": identifier }).to_string(),
        ))
        .await
        .with_context(|| format!("{nickname} subscribe"))?;

    let confirmation = next_json(socket, "waiting for confirmation").await?;
    if confirmation != json!({ "type": "confirm_subscription", "identifier": identifier }) {
        bail!("expected confirmation for {nickname}, got {confirmation}");
    }
    Ok(identifier)
}

async fn speak(socket: &mut Socket, identifier: &str, message: &str) -> Result<()> {
    let data = json!({ "action": "speak", "message": message }).to_string();
    socket
        .send(Message::text(
            json!({ "command": "message", "identifier": identifier, "data": data }).to_string(),
        ))
        .await
        .with_context(|| format!("failed to speak '{message}'"))
}

async fn next_json(socket: &mut Socket, description: &str) -> Result<Value> {
    loop {
        let message = match timeout(READ_TIMEOUT, socket.next()).await {
            Ok(Some(message)) => message.with_context(|| description.to_string())?,
            Ok(None) => return Err(anyhow!("{description}: socket closed")),
            Err(_) => return Err(anyhow!("{description}: timed out")),
        };
        match message {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(anyhow!("{description}: unexpected message {other:?}")),
        }
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}
