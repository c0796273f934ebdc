use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, Uri},
    response::Response,
    routing::any,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, watch},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId, Outbound, RequestInfo},
    upgrade::{upgrade_required, UpgradeDecision},
    Cable,
};

/// Serves one [`Cable`] on a websocket route.
pub struct CableServer {
    listener: TcpListener,
    cable: Arc<Cable>,
}

#[derive(Clone)]
struct HostState {
    cable: Arc<Cable>,
    shutdown: watch::Receiver<bool>,
    // Every session holds a clone; the server waits for all of them to drop.
    drain: mpsc::Sender<()>,
}

impl CableServer {
    pub fn new(listener: TcpListener, cable: Arc<Cable>) -> Self {
        Self { listener, cable }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn cable(&self) -> &Arc<Cable> {
        &self.cable
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let CableServer { listener, cable } = self;
        let path = cable.config().path.clone();
        if !path.starts_with('/') {
            anyhow::bail!("cable path must start with '/', got {path:?}");
        }

        let (stop, stopped) = watch::channel(false);
        let (drain, mut drained) = mpsc::channel::<()>(1);
        let state = HostState {
            cable: Arc::clone(&cable),
            shutdown: stopped,
            drain,
        };
        let app = axum::Router::new()
            .route(&path, any(upgrade))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let signal = {
            let cable = Arc::clone(&cable);
            async move {
                shutdown.await;
                handle_shutdown(&cable, &stop);
            }
        };
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await?;

        let timeout = cable.config().shutdown_timeout();
        match tokio::time::timeout(timeout, drained.recv()).await {
            Ok(_) => info!("all sessions closed"),
            Err(_) => warn!(?timeout, "sessions still open after shutdown timeout"),
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

fn handle_shutdown(cable: &Cable, stop: &watch::Sender<bool>) {
    info!(
        sessions = cable.handler().session_count(),
        "cable shutting down"
    );
    cable.scheduler().stop();
    stop.send_replace(true);
}

async fn upgrade(
    State(state): State<HostState>,
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let decision = state.cable.negotiate(ws.is_some());
    let (ws, protocol) = match (ws, decision) {
        (Some(ws), UpgradeDecision::Accept { protocol }) => (ws, protocol),
        _ => return upgrade_required(),
    };

    let request = RequestInfo {
        path: uri.path().to_string(),
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_string(), value.to_string()))
            })
            .collect(),
    };

    ws.protocols([protocol])
        .on_upgrade(move |socket| run_session(socket, state, request))
}

async fn run_session(socket: WebSocket, state: HostState, request: RequestInfo) {
    let HostState {
        cable,
        mut shutdown,
        drain: _drain,
    } = state;

    let (connection, outbound) = cable.open_connection(request);
    let id = connection.id();
    info!(connection = id, "socket opened");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_frames(id, sink, outbound));

    loop {
        select! {
            _ = stopped(&mut shutdown) => {
                cable.handler().on_shutdown(&connection).await;
                break;
            }
            message = stream.next() => {
                if !handle_socket_message(&cable, &connection, message) {
                    break;
                }
            }
        }
    }

    cable.handler().on_close(&connection);
    if let Err(err) = writer.await {
        warn!(connection = id, error = ?err, "socket writer failed");
    }
    info!(connection = id, "socket closed");
}

/// Returns `false` once the client is gone.
fn handle_socket_message(
    cable: &Cable,
    connection: &Connection,
    message: Option<Result<Message, axum::Error>>,
) -> bool {
    match message {
        Some(Ok(Message::Text(text))) => {
            cable.handler().on_message(connection, text);
            true
        }
        Some(Ok(Message::Binary(bytes))) => {
            match String::from_utf8(bytes) {
                Ok(text) => cable.handler().on_message(connection, text),
                Err(_) => warn!(connection = connection.id(), "dropping non-utf8 binary frame"),
            }
            true
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => true,
        Some(Ok(Message::Close(_))) | None => false,
        Some(Err(err)) => {
            debug!(connection = connection.id(), error = %err, "socket read failed");
            false
        }
    }
}

async fn write_frames(
    connection: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(text) => {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(connection, error = %err, "failed to deliver frame");
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
