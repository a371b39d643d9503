use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::backends::Backend;
use crate::codec::{Codec, CodecKind, Request};
use crate::command::{CommandSpec, Handler, Registry};
use crate::connection::{Connection, ConnectionHandle};
use crate::event::Event;

const CMD_QUIT: &str = "QUIT";
const OK: &str = "OK";
pub(crate) const ERR_INVALID_COMMAND: &str = "invalid command format";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub codec: CodecKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 7331,
            codec: CodecKind::Bulk,
        }
    }
}

/// Point-in-time snapshot served by the `INFO` command.
#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub clients: usize,
    pub tasks: usize,
    pub cpus: usize,
    pub pid: u32,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// Hook invoked with a connection's remote address once that connection has
/// exited; backends use it to drop per-connection state.
pub type DisconnectHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// The daemon: owns the listener, the command registry, the table of live
/// connections, and the loaded backends. Handlers and backends receive an
/// `Arc<Server>` (or a `Weak` to it), never globals, so several servers can
/// coexist in one process.
pub struct Server {
    addr: SocketAddr,
    listener: TcpListener,
    codec: Arc<dyn Codec>,
    registry: Registry,
    connections: Mutex<HashMap<SocketAddr, ConnectionHandle>>,
    backends: Mutex<Vec<Arc<dyn Backend>>>,
    disconnect_hooks: Mutex<Vec<DisconnectHook>>,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    quit: CancellationToken,
    closed: AtomicBool,
    tasks: AtomicUsize,
    started: Instant,
}

impl Server {
    /// Binds the listener and returns the server together with the receiving
    /// end of its event channel. The caller is expected to drain the events;
    /// the core sends them synchronously and never buffers.
    pub async fn bind(config: ServerConfig) -> crate::Result<(Arc<Server>, mpsc::Receiver<Event>)> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(1);

        let server = Arc::new(Server {
            addr,
            listener,
            codec: config.codec.codec(),
            registry: Registry::new(),
            connections: Mutex::new(HashMap::new()),
            backends: Mutex::new(Vec::new()),
            disconnect_hooks: Mutex::new(Vec::new()),
            events: events_tx,
            shutdown: CancellationToken::new(),
            quit: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tasks: AtomicUsize::new(0),
            started: Instant::now(),
        });

        Ok((server, events_rx))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn register_command(&self, spec: CommandSpec, handler: Handler) {
        self.registry.register(spec, handler);
    }

    pub fn register_help(&self, spec: CommandSpec) {
        self.registry.register_help(spec);
    }

    pub fn help(&self) -> HashMap<String, CommandSpec> {
        self.registry.help()
    }

    pub async fn load_backend(&self, backend: Arc<dyn Backend>) -> crate::Result<()> {
        self.backends.lock().unwrap().push(backend.clone());
        backend.load().await
    }

    /// Registers a hook run after a connection leaves the table.
    pub fn on_disconnect(&self, hook: DisconnectHook) {
        self.disconnect_hooks.lock().unwrap().push(hook);
    }

    /// Looks up a live connection by its remote address.
    pub fn client(&self, addr: &SocketAddr) -> Option<ConnectionHandle> {
        self.connections.lock().unwrap().get(addr).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled once `close` has fully torn the server down.
    pub fn wait_quit(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            clients: self.connections.lock().unwrap().len(),
            tasks: self.tasks.load(Ordering::SeqCst),
            cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Accepts connections until `close` is called, spawning one dispatcher
    /// task per client. Accept failures are reported and do not stop the
    /// loop.
    pub async fn accept_connections(self: Arc<Self>) {
        self.emit(Event::info(format!("server listening on {}", self.addr)))
            .await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => self.handle_connection(socket, addr),
                    Err(err) => {
                        self.emit(Event::error("accept error", err)).await;
                    }
                },
            }
        }
    }

    fn handle_connection(self: &Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        info!("accepted connection from {:?}", addr);
        let conn = Connection::new(socket, addr, self.codec.clone());
        let handle = conn.handle();
        self.connections.lock().unwrap().insert(addr, handle);

        // The exit watcher is the one place a connection is unregistered, so
        // backends observe every disconnect exactly once.
        let server = self.clone();
        let exit = conn.handle().exit_signal();
        tokio::spawn(async move {
            exit.cancelled().await;
            server.connections.lock().unwrap().remove(&addr);
            let hooks: Vec<DisconnectHook> =
                server.disconnect_hooks.lock().unwrap().clone();
            for hook in hooks {
                hook(addr);
            }
            debug!("client {} disconnected", addr);
        });

        let server = self.clone();
        tokio::spawn(async move {
            server.tasks.fetch_add(1, Ordering::SeqCst);
            server.run_client(conn).await;
            server.tasks.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Per-connection dispatcher: read one request, run its handler, write
    /// the reply, repeat until end of stream or close.
    #[instrument(name = "connection", skip(self, conn), fields(client = %conn.addr()))]
    async fn run_client(&self, mut conn: Connection) {
        let client = conn.handle();
        let exit = client.exit_signal();

        loop {
            let request = tokio::select! {
                _ = exit.cancelled() => break,
                request = conn.read_request() => request,
            };

            match request {
                Ok(Some(request)) => {
                    if self.dispatch(request, &client).await.is_break() {
                        break;
                    }
                }
                // Clean end of stream; the peer hung up between requests.
                Ok(None) => break,
                Err(err) => {
                    self.emit(Event::error("read error", &err)).await;
                    let _ = client.write_error(&err.to_string());
                    let _ = client.flush().await;
                    break;
                }
            }
        }

        client.close();
        debug!("connection closed");
    }

    async fn dispatch(&self, request: Request, client: &ConnectionHandle) -> ControlFlow<()> {
        debug!("dispatching {}", request.name);

        // QUIT never reaches the registry: acknowledge and drop the line.
        if request.name == CMD_QUIT {
            let _ = client.write_simple(OK);
            let _ = client.flush().await;
            client.close();
            return ControlFlow::Break(());
        }

        let Some(handler) = self.registry.lookup(&request.name) else {
            self.emit(Event::error("command error", ERR_INVALID_COMMAND))
                .await;
            let _ = client.write_error(ERR_INVALID_COMMAND);
            let _ = client.flush().await;
            return ControlFlow::Continue(());
        };

        // Handlers run in their own task so a panic unwinds that task alone
        // and reaches us as a join error instead of tearing the process down.
        let future = handler(request.args, client.clone());
        match tokio::spawn(future).await {
            Ok(Ok(())) => ControlFlow::Continue(()),
            Ok(Err(err)) => {
                self.emit(Event::error("command error", &err)).await;
                let _ = client.write_error(&err.to_string());
                let _ = client.flush().await;
                ControlFlow::Continue(())
            }
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                let stack = std::backtrace::Backtrace::force_capture().to_string();
                self.emit(Event::fatal("client run panic", message, stack))
                    .await;
                client.close();
                ControlFlow::Break(())
            }
            Err(_) => ControlFlow::Break(()),
        }
    }

    /// Stops accepting, closes every live connection, and unloads backends
    /// in registration order. Idempotent; the quit token fires last.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.emit(Event::close("server is closing.")).await;
        self.shutdown.cancel();

        let handles: Vec<ConnectionHandle> =
            self.connections.lock().unwrap().values().cloned().collect();
        for handle in handles {
            handle.close();
        }

        let backends: Vec<Arc<dyn Backend>> = self.backends.lock().unwrap().clone();
        for backend in backends {
            if let Err(err) = backend.unload().await {
                self.emit(Event::error("backend unload error", err)).await;
            }
        }

        self.quit.cancel();
    }

    async fn emit(&self, event: Event) {
        // A dropped receiver means nobody is listening anymore; the event is
        // not worth blocking shutdown over.
        let _ = self.events.send(event).await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
