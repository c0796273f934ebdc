//! Bridge between raw socket callbacks and the protocol.
//!
//! Every connection gets one actor task, spawned on the [`Scheduler`] when
//! the socket opens. Socket events are queued to it in arrival order, so a
//! connection's hooks never overlap while different connections run in
//! parallel. A hook that fails or panics is logged and the actor moves on
//! to the next event; nothing reaches the socket host. Panics are logged
//! with the location and backtrace recorded by a process-wide panic hook.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, Once, PoisonError},
};

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    connection::{Connection, ConnectionId},
    protocol::{Capabilities, Protocol},
    scheduler::Scheduler,
};

enum Event {
    Open,
    Message(String),
    Close,
}

pub struct ConnectionHandler {
    protocol: Arc<dyn Protocol>,
    capabilities: Capabilities,
    scheduler: Scheduler,
    sessions: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Event>>>,
}

impl ConnectionHandler {
    pub fn new(protocol: Arc<dyn Protocol>, scheduler: Scheduler) -> Self {
        install_panic_hook();
        let capabilities = protocol.capabilities();
        Self {
            protocol,
            capabilities,
            scheduler,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Number of connections with a live actor.
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Starts the connection's actor and queues the protocol's `on_open`.
    pub fn on_open(&self, connection: Arc<Connection>) {
        let (events, queue) = mpsc::unbounded_channel();
        let id = connection.id();
        let actor = run_session(
            Arc::clone(&self.protocol),
            self.capabilities,
            Arc::clone(&connection),
            queue,
        );

        if self.scheduler.spawn(actor).is_none() {
            debug!(connection = id, "scheduler stopped; refusing connection");
            connection.close();
            return;
        }

        // The actor is already running, so the queue cannot be closed yet.
        let _ = events.send(Event::Open);
        self.lock().insert(id, events);
    }

    pub fn on_message(&self, connection: &Connection, raw: String) {
        if !self.scheduler.is_running() {
            debug!(connection = connection.id(), "scheduler stopped; dropping message");
            return;
        }
        self.enqueue(connection.id(), Event::Message(raw));
    }

    /// Queues `on_close`. Once the scheduler is stopped the hook is skipped
    /// and the connection is torn down in place.
    pub fn on_close(&self, connection: &Connection) {
        let session = self.lock().remove(&connection.id());

        if !self.scheduler.is_running() {
            debug!(connection = connection.id(), "scheduler stopped; on_close suppressed");
            drop(session);
            connection.close();
            return;
        }

        match session {
            Some(events) => {
                if events.send(Event::Close).is_err() {
                    connection.close();
                }
            }
            None => {
                connection.close();
            }
        }
    }

    /// Runs the protocol's `on_shutdown` right away, outside the actor queue.
    pub async fn on_shutdown(&self, connection: &Arc<Connection>) {
        if !self.capabilities.on_shutdown {
            return;
        }
        run_isolated(
            "on_shutdown",
            connection.id(),
            self.protocol.on_shutdown(connection),
        )
        .await;
    }

    fn enqueue(&self, id: ConnectionId, event: Event) {
        let sessions = self.lock();
        match sessions.get(&id) {
            Some(events) if events.send(event).is_ok() => {}
            _ => debug!(connection = id, "no session for connection; event dropped"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<Event>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_session(
    protocol: Arc<dyn Protocol>,
    capabilities: Capabilities,
    connection: Arc<Connection>,
    mut queue: mpsc::UnboundedReceiver<Event>,
) {
    let id = connection.id();

    while let Some(event) = queue.recv().await {
        match event {
            Event::Open => {
                run_isolated("on_open", id, protocol.on_open(&connection)).await;
            }
            Event::Message(raw) => {
                run_isolated("on_message", id, protocol.on_message(&connection, &raw)).await;
            }
            Event::Close => {
                if capabilities.on_close {
                    run_isolated("on_close", id, protocol.on_close(&connection)).await;
                }
                break;
            }
        }
    }

    connection.close();
    debug!(connection = id, "session finished");
}

/// Awaits one hook, logging instead of propagating its error or panic.
/// Returns whether the hook succeeded.
async fn run_isolated<F>(hook: &'static str, connection: ConnectionId, task: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!(hook, connection, error = ?err, "unhandled error in connection task");
            false
        }
        Err(panic) => {
            let report = take_panic_report().unwrap_or_else(PanicReport::unknown);
            error!(
                hook,
                connection,
                panic = panic_message(panic.as_ref()),
                location = %report.location,
                backtrace = %report.backtrace,
                "connection task panicked"
            );
            false
        }
    }
}

/// Where the last panic on this thread happened.
struct PanicReport {
    location: String,
    backtrace: Backtrace,
}

impl PanicReport {
    fn unknown() -> Self {
        Self {
            location: "unknown".to_string(),
            backtrace: Backtrace::disabled(),
        }
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains onto the current panic hook so panics also leave a
/// [`PanicReport`] for the task boundary that catches them. The backtrace
/// is only captured when `RUST_BACKTRACE` asks for one.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let report = PanicReport {
                location: info
                    .location()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown".to_string()),
                backtrace: Backtrace::capture(),
            };
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(report));
            default_hook(info);
        }));
    });
}

/// The panic is caught on the thread that raised it, so the report is
/// still in this thread's slot.
fn take_panic_report() -> Option<PanicReport> {
    LAST_PANIC.with(|last| last.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        connection::{Outbound, RequestInfo},
        error::Result,
        router::Router,
    };

    /// Echoes messages back; `fail` errors and `panic` panics.
    #[derive(Default)]
    struct Echo {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Protocol for Echo {
        async fn init(&self, _router: Arc<Router>, _scheduler: &Scheduler) -> Result<()> {
            Ok(())
        }

        fn protocol_definition(&self) -> &'static str {
            "echo"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                on_close: true,
                on_shutdown: true,
            }
        }

        async fn on_open(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
            connection.write("open");
            Ok(())
        }

        async fn on_message(&self, connection: &Arc<Connection>, raw: &str) -> anyhow::Result<()> {
            match raw {
                "fail" => anyhow::bail!("refusing to echo"),
                "panic" => panic!("echo exploded"),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    connection.write("slow");
                }
                other => {
                    connection.write(other);
                }
            }
            Ok(())
        }

        async fn on_close(&self, _connection: &Arc<Connection>) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_shutdown(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
            connection.write("bye");
            Ok(())
        }

        async fn broadcast(&self, _stream: &str, _data: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (
        Arc<Echo>,
        ConnectionHandler,
        Arc<Connection>,
        mpsc::Receiver<Outbound>,
    ) {
        let protocol = Arc::new(Echo::default());
        let handler = ConnectionHandler::new(protocol.clone(), Scheduler::current());
        let (connection, outbound) = Connection::open(Arc::new(Router::new()), RequestInfo::default());
        (protocol, handler, connection, outbound)
    }

    async fn next(outbound: &mut mpsc::Receiver<Outbound>) -> Option<Outbound> {
        tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .expect("frame in time")
    }

    fn frame(text: &str) -> Option<Outbound> {
        Some(Outbound::Frame(text.to_string()))
    }

    #[tokio::test]
    async fn events_run_in_socket_order() {
        let (_protocol, handler, connection, mut outbound) = setup();

        handler.on_open(Arc::clone(&connection));
        handler.on_message(&connection, "slow".into());
        handler.on_message(&connection, "fast".into());

        assert_eq!(next(&mut outbound).await, frame("open"));
        assert_eq!(next(&mut outbound).await, frame("slow"));
        assert_eq!(next(&mut outbound).await, frame("fast"));
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_kill_the_session() {
        let (_protocol, handler, connection, mut outbound) = setup();

        handler.on_open(Arc::clone(&connection));
        handler.on_message(&connection, "fail".into());
        handler.on_message(&connection, "panic".into());
        handler.on_message(&connection, "still here".into());

        assert_eq!(next(&mut outbound).await, frame("open"));
        assert_eq!(next(&mut outbound).await, frame("still here"));
        assert!(connection.is_open());
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("hook exploded");
    }

    #[tokio::test]
    async fn panics_are_reported_with_their_location() {
        install_panic_hook();

        assert!(!run_isolated("on_message", 7, explode()).await);
        assert!(take_panic_report().is_none(), "report consumed by the task boundary");

        let caught = AssertUnwindSafe(explode()).catch_unwind().await;
        assert!(caught.is_err());
        let report = take_panic_report().expect("panic report");
        assert!(report.location.contains("handler.rs"), "{}", report.location);
    }

    #[tokio::test]
    async fn close_runs_the_hook_then_closes() {
        let (protocol, handler, connection, mut outbound) = setup();

        handler.on_open(Arc::clone(&connection));
        handler.on_close(&connection);

        assert_eq!(next(&mut outbound).await, frame("open"));
        assert_eq!(next(&mut outbound).await, Some(Outbound::Close));
        assert_eq!(protocol.closes.load(Ordering::SeqCst), 1);
        assert_eq!(handler.session_count(), 0);
    }

    #[tokio::test]
    async fn close_after_stop_skips_the_hook() {
        let (protocol, handler, connection, mut outbound) = setup();
        handler.on_open(Arc::clone(&connection));
        assert_eq!(next(&mut outbound).await, frame("open"));

        handler.scheduler().stop();
        handler.on_close(&connection);

        assert!(!connection.is_open());
        assert_eq!(next(&mut outbound).await, Some(Outbound::Close));
        tokio::task::yield_now().await;
        assert_eq!(protocol.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_runs_directly() {
        let (_protocol, handler, connection, mut outbound) = setup();

        handler.scheduler().stop();
        handler.on_shutdown(&connection).await;

        assert_eq!(outbound.try_recv().ok(), frame("bye"));
    }

    #[tokio::test]
    async fn stopped_scheduler_refuses_new_connections() {
        let (_protocol, handler, connection, mut outbound) = setup();

        handler.scheduler().stop();
        handler.on_open(Arc::clone(&connection));

        assert_eq!(outbound.try_recv().ok(), Some(Outbound::Close));
        assert_eq!(handler.session_count(), 0);
    }
}
