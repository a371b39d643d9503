use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, Request};
use crate::value::{self, write_payload, Value};

/// Capacity of the channel feeding a connection's writer task. Flush blocks
/// once this many framed chunks are in flight, which is the only
/// back-pressure beyond TCP's own.
const OUTBOX_CAPACITY: usize = 64;

/// One accepted socket paired with one codec. The `Connection` itself is the
/// reading side and lives in the dispatcher task; the cloneable
/// [`ConnectionHandle`] is the writing side, shared with backends that fan
/// messages out to other connections.
pub struct Connection {
    reader: OwnedReadHalf,
    // Data is read from the socket into the read buffer. When a request is
    // parsed, the corresponding bytes are removed from the buffer.
    buffer: BytesMut,
    codec: Arc<dyn Codec>,
    handle: ConnectionHandle,
}

impl Connection {
    pub fn new(stream: TcpStream, addr: SocketAddr, codec: Arc<dyn Codec>) -> Connection {
        let (reader, writer) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);

        let shared = Arc::new(Shared {
            staged: Mutex::new(BytesMut::new()),
            outbox: outbox_tx,
            closed: AtomicBool::new(false),
            exit: CancellationToken::new(),
        });

        tokio::spawn(run_writer(writer, outbox_rx, shared.clone()));

        Connection {
            reader,
            buffer: BytesMut::with_capacity(4096),
            codec,
            handle: ConnectionHandle { addr, shared },
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Decodes one request, reading more bytes whenever the buffer holds only
    /// a partial frame. Returns `None` on a clean end of stream; an end of
    /// stream in the middle of a frame is a framing error.
    pub async fn read_request(&mut self) -> crate::Result<Option<Request>> {
        loop {
            let mut cursor = Cursor::new(&self.buffer[..]);
            match self.codec.decode(&mut cursor) {
                Ok(request) => {
                    let position = cursor.position() as usize;
                    self.buffer.advance(position);
                    return Ok(Some(request));
                }
                Err(value::Error::Incomplete) => {}
                Err(err) => return Err(err.into()),
            }

            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(value::Error::BadLineFormat.into());
            }
        }
    }
}

struct Shared {
    staged: Mutex<BytesMut>,
    outbox: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    exit: CancellationToken,
}

/// The write half of a connection. Writes stage into a buffer; `flush` hands
/// the staged bytes to the writer task as one complete framed chunk, so a
/// backend writing from another task can never interleave partial encodings
/// with the dispatcher's own replies.
#[derive(Clone)]
pub struct ConnectionHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Marks the connection closed and fires the exit signal. Idempotent:
    /// concurrent and repeated calls beyond the first are no-ops.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.exit.cancel();
    }

    /// Token that resolves once the connection has closed, for exit watchers.
    pub fn exit_signal(&self) -> CancellationToken {
        self.shared.exit.clone()
    }

    pub fn write_value(&self, value: &Value) -> crate::Result<()> {
        self.stage(|buf| value.write_to(buf))
    }

    pub fn write_simple(&self, s: &str) -> crate::Result<()> {
        self.write_value(&Value::Simple(s.to_string()))
    }

    pub fn write_error(&self, message: &str) -> crate::Result<()> {
        self.write_value(&Value::Error(message.to_string()))
    }

    pub fn write_int(&self, n: i64) -> crate::Result<()> {
        self.write_value(&Value::Int(n))
    }

    pub fn write_float(&self, n: f64) -> crate::Result<()> {
        self.write_value(&Value::Float(n))
    }

    pub fn write_bool(&self, b: bool) -> crate::Result<()> {
        self.write_value(&Value::Bool(b))
    }

    pub fn write_byte(&self, b: u8) -> crate::Result<()> {
        self.write_value(&Value::Byte(b))
    }

    pub fn write_bytes(&self, data: &[u8]) -> crate::Result<()> {
        self.stage(|buf| write_payload(buf, data))
    }

    pub fn write_null(&self) -> crate::Result<()> {
        self.write_value(&Value::Null)
    }

    /// Writes an array of `$` payloads, the framing pub/sub delivery uses.
    pub fn write_bulk(&self, parts: &[Bytes]) -> crate::Result<()> {
        self.stage(|buf| {
            buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
            for part in parts {
                write_payload(buf, part);
            }
        })
    }

    /// Serializes any value as a `~json` structure reply.
    pub fn write_json<T: serde::Serialize>(&self, value: &T) -> crate::Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.stage(|buf| {
            buf.extend_from_slice(b"~json\r\n");
            write_payload(buf, &payload);
        })
    }

    /// Pushes everything staged so far to the socket as one chunk.
    pub async fn flush(&self) -> crate::Result<()> {
        let data = {
            let mut staged = self.shared.staged.lock().unwrap();
            if staged.is_empty() {
                return Ok(());
            }
            staged.split().freeze()
        };

        self.shared
            .outbox
            .send(data)
            .await
            .map_err(|_| -> crate::Error { "connection closed".into() })
    }

    fn stage(&self, write: impl FnOnce(&mut BytesMut)) -> crate::Result<()> {
        if self.is_closed() {
            return Err("connection closed".into());
        }
        let mut staged = self.shared.staged.lock().unwrap();
        write(&mut staged);
        Ok(())
    }
}

/// Owns the socket's write half. Runs until the exit signal fires or the
/// socket dies, draining chunks that were flushed before close so a final
/// reply (`QUIT`'s `+OK`) still reaches the peer before the FIN.
async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            message = outbox.recv() => match message {
                Some(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shared.exit.cancelled() => break,
        }
    }

    while let Ok(data) = outbox.try_recv() {
        if writer.write_all(&data).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;

    // A writer that died on its own (socket error) still closes the
    // connection for everyone else.
    shared.closed.store(true, Ordering::SeqCst);
    shared.exit.cancel();
}
