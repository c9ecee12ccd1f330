//! Monitor protocol client.
//!
//! Owns one transport to the hypervisor's control socket and exposes
//! request/response RPC over it. Replies are matched to callers strictly by
//! arrival order: the peer guarantees in-order responses on a single
//! connection, so a FIFO of waiters is sufficient and the optional `id`
//! field is never consulted for correlation. Asynchronous events are logged
//! and discarded.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::HostError;
use crate::protocol::{
    Greeting, MessageKind, MonitorEvent, MonitorRequest, MonitorResponse, QueryStatus,
    VersionInfo,
};

/// Connection attempts before giving up on a freshly bound socket.
const CONNECT_ATTEMPTS: u32 = 10;
/// First retry delay; doubles per attempt up to [`CONNECT_BACKOFF_CAP`].
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<MonitorResponse, HostError>>;

/// State shared between the client handle and its reader task.
struct Shared {
    /// Write half of the transport. `None` when disconnected; cleared by the
    /// reader on transport death so a stale handle can never strand a waiter.
    writer: Mutex<Option<BoxedWriter>>,

    /// Waiters for in-flight requests, resolved in arrival order.
    pending: StdMutex<VecDeque<Waiter>>,

    connected: AtomicBool,
}

impl Shared {
    /// Resolve every queued waiter with `ConnectionLost` and clear the FIFO.
    fn fail_pending(&self) {
        let drained: Vec<Waiter> = {
            let mut pending = self.pending.lock().expect("pending queue poisoned");
            pending.drain(..).collect()
        };
        for waiter in drained {
            let _ = waiter.send(Err(HostError::ConnectionLost));
        }
    }
}

/// Client for the hypervisor's monitor protocol.
///
/// One client drives at most one connection at a time. Requests may be
/// submitted concurrently; they are serialized onto the wire and their
/// replies matched first-in first-out.
pub struct MonitorClient {
    shared: Arc<Shared>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl MonitorClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                writer: Mutex::new(None),
                pending: StdMutex::new(VecDeque::new()),
                connected: AtomicBool::new(false),
            }),
            reader: StdMutex::new(None),
        }
    }

    /// Whether a handshaken connection is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Connect to a UNIX-domain control socket and complete the handshake.
    ///
    /// The socket may not be `accept()`-ready the moment it appears on the
    /// filesystem, so refused attempts are retried with exponential backoff
    /// before giving up.
    ///
    /// # Errors
    /// Returns [`HostError::NotConnected`] if a connection is already live,
    /// [`HostError::ConnectionLost`] when the socket never accepts or the
    /// transport closes mid-handshake, [`HostError::InvalidResponse`] for an
    /// unparseable greeting, and [`HostError::Monitor`] if capability
    /// negotiation is rejected.
    pub async fn connect_unix(&self, path: impl AsRef<Path>) -> Result<(), HostError> {
        let path = path.as_ref();
        if self.writer_present().await {
            return Err(HostError::NotConnected);
        }

        let mut delay = CONNECT_BACKOFF_INITIAL;
        let mut attempt = 1;
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    tracing::debug!(
                        socket = %path.display(),
                        attempt,
                        error = %e,
                        "control socket not ready, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(CONNECT_BACKOFF_CAP);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        socket = %path.display(),
                        attempts = CONNECT_ATTEMPTS,
                        error = %e,
                        "giving up on control socket"
                    );
                    return Err(HostError::ConnectionLost);
                }
            }
        };
        self.handshake(stream).await
    }

    /// Connect to a TCP control endpoint and complete the handshake.
    ///
    /// # Errors
    /// Same contract as [`MonitorClient::connect_unix`], without the
    /// connect-side retry: a TCP endpoint is either listening or not.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<(), HostError> {
        if self.writer_present().await {
            return Err(HostError::NotConnected);
        }
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            tracing::warn!(host, port, error = %e, "TCP connect failed");
            HostError::ConnectionLost
        })?;
        self.handshake(stream).await
    }

    async fn writer_present(&self) -> bool {
        self.shared.writer.lock().await.is_some()
    }

    /// Install the transport, wait for the greeting, negotiate capabilities.
    async fn handshake<S>(&self, stream: S) -> Result<(), HostError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (greeting_tx, greeting_rx) = oneshot::channel();

        *self.shared.writer.lock().await = Some(Box::new(write_half));
        let handle = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&self.shared),
            greeting_tx,
        ));
        *self.reader.lock().expect("reader slot poisoned") = Some(handle);

        let greeting = match greeting_rx.await {
            Ok(Ok(greeting)) => greeting,
            Ok(Err(e)) => {
                self.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                self.disconnect().await;
                return Err(HostError::ConnectionLost);
            }
        };
        tracing::info!(
            major = greeting.qmp.version.qemu.major,
            minor = greeting.qmp.version.qemu.minor,
            micro = greeting.qmp.version.qemu.micro,
            capabilities = greeting.qmp.capabilities.len(),
            "monitor greeting received"
        );

        self.shared.connected.store(true, Ordering::SeqCst);
        if let Err(e) = self.execute("qmp_capabilities", None).await {
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Submit one command and await its correlated reply.
    ///
    /// Returns the reply's `return` payload, which may be any JSON value
    /// including an empty object.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live connection,
    /// [`HostError::ConnectionLost`] if the transport dies while the request
    /// is in flight, [`HostError::Monitor`] for an error reply, and
    /// [`HostError::InvalidResponse`] for a structurally invalid one.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Value, HostError> {
        let mut request = MonitorRequest::new(command);
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }
        let frame = request
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let rx = {
            let mut writer_guard = self.shared.writer.lock().await;
            let writer = writer_guard.as_mut().ok_or(HostError::NotConnected)?;

            // Enqueue before writing, under the writer lock, so queue order
            // always equals wire order.
            let (tx, rx) = oneshot::channel();
            self.shared
                .pending
                .lock()
                .expect("pending queue poisoned")
                .push_back(tx);

            let write_result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = write_result {
                self.shared
                    .pending
                    .lock()
                    .expect("pending queue poisoned")
                    .pop_back();
                tracing::debug!(command, error = %e, "monitor write failed");
                return Err(HostError::ConnectionLost);
            }
            rx
        };

        match rx.await {
            Ok(result) => result?.into_result(),
            Err(_) => Err(HostError::ConnectionLost),
        }
    }

    /// Close the connection, releasing every waiting request with
    /// [`HostError::ConnectionLost`]. Idempotent: a disconnected client is
    /// left as-is.
    pub async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let handle = self.reader.lock().expect("reader slot poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.shared.fail_pending();
    }

    /// Query the guest run state, validating the reply's field presence and
    /// types.
    ///
    /// # Errors
    /// [`HostError::InvalidResponse`] when the reply is missing any of the
    /// `status`, `running`, or `singlestep` fields, plus the usual
    /// [`MonitorClient::execute`] failures.
    pub async fn query_status(&self) -> Result<QueryStatus, HostError> {
        let payload = self.execute("query-status", None).await?;
        serde_json::from_value(payload)
            .map_err(|e| HostError::InvalidResponse(format!("query-status: {e}")))
    }

    /// Query the hypervisor version.
    ///
    /// # Errors
    /// Same contract as [`MonitorClient::query_status`].
    pub async fn query_version(&self) -> Result<VersionInfo, HostError> {
        let payload = self.execute("query-version", None).await?;
        serde_json::from_value(payload)
            .map_err(|e| HostError::InvalidResponse(format!("query-version: {e}")))
    }

    /// Resume guest execution.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn cont(&self) -> Result<(), HostError> {
        self.execute("cont", None).await.map(drop)
    }

    /// Pause guest execution.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn stop(&self) -> Result<(), HostError> {
        self.execute("stop", None).await.map(drop)
    }

    /// Request a graceful guest power-down via ACPI.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn system_powerdown(&self) -> Result<(), HostError> {
        self.execute("system_powerdown", None).await.map(drop)
    }

    /// Hard-reset the guest.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn system_reset(&self) -> Result<(), HostError> {
        self.execute("system_reset", None).await.map(drop)
    }

    /// Ask the hypervisor process to exit.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn quit(&self) -> Result<(), HostError> {
        self.execute("quit", None).await.map(drop)
    }

    /// Create a block backend node for a host file.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn blockdev_add(
        &self,
        node_name: &str,
        file: &Path,
        read_only: bool,
    ) -> Result<(), HostError> {
        let mut args = Map::new();
        args.insert("node-name".to_owned(), node_name.into());
        args.insert("driver".to_owned(), "file".into());
        args.insert(
            "filename".to_owned(),
            file.to_string_lossy().into_owned().into(),
        );
        args.insert("read-only".to_owned(), read_only.into());
        self.execute("blockdev-add", Some(args)).await.map(drop)
    }

    /// Delete a block backend node.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn blockdev_del(&self, node_name: &str) -> Result<(), HostError> {
        let mut args = Map::new();
        args.insert("node-name".to_owned(), node_name.into());
        self.execute("blockdev-del", Some(args)).await.map(drop)
    }

    /// Bind a guest-visible frontend device to a backend node.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn device_add(
        &self,
        driver: &str,
        id: &str,
        drive: &str,
    ) -> Result<(), HostError> {
        let mut args = Map::new();
        args.insert("driver".to_owned(), driver.into());
        args.insert("id".to_owned(), id.into());
        args.insert("drive".to_owned(), drive.into());
        self.execute("device_add", Some(args)).await.map(drop)
    }

    /// Unplug a frontend device. Completion is signalled asynchronously by a
    /// `DEVICE_DELETED` event.
    ///
    /// # Errors
    /// Propagates [`MonitorClient::execute`] failures.
    pub async fn device_del(&self, id: &str) -> Result<(), HostError> {
        let mut args = Map::new();
        args.insert("id".to_owned(), id.into());
        self.execute("device_del", Some(args)).await.map(drop)
    }

    /// Return the raw block-device table as reported by the hypervisor.
    ///
    /// # Errors
    /// [`HostError::InvalidResponse`] when the reply is not an array, plus
    /// the usual [`MonitorClient::execute`] failures.
    pub async fn query_block(&self) -> Result<Vec<Value>, HostError> {
        match self.execute("query-block", None).await? {
            Value::Array(devices) => Ok(devices),
            other => Err(HostError::InvalidResponse(format!(
                "query-block: expected array, got {other}"
            ))),
        }
    }
}

impl Default for MonitorClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Read newline-delimited messages until the transport dies, dispatching
/// each by structural classification. On exit the connection is marked dead,
/// the writer is dropped, and all pending waiters are released.
async fn read_loop<R>(
    read_half: R,
    shared: Arc<Shared>,
    greeting_tx: oneshot::Sender<Result<Greeting, HostError>>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    let mut greeting_tx = Some(greeting_tx);

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                if line.last() != Some(&b'\n') {
                    // Transport closed mid-frame; the partial tail is not a
                    // message.
                    break;
                }
                dispatch_line(&line, &shared, &mut greeting_tx);
            }
            Err(e) => {
                tracing::debug!(error = %e, "monitor read failed");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    *shared.writer.lock().await = None;
    if let Some(tx) = greeting_tx.take() {
        let _ = tx.send(Err(HostError::ConnectionLost));
    }
    shared.fail_pending();
}

fn dispatch_line(
    line: &[u8],
    shared: &Shared,
    greeting_tx: &mut Option<oneshot::Sender<Result<Greeting, HostError>>>,
) {
    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "discarding malformed monitor line");
            return;
        }
    };

    match MessageKind::classify(&value) {
        MessageKind::Greeting => {
            let parsed = Greeting::from_value(value);
            match greeting_tx.take() {
                Some(tx) => {
                    let _ = tx.send(parsed);
                }
                None => tracing::warn!("unexpected greeting after handshake"),
            }
        }
        MessageKind::Event => match MonitorEvent::from_value(value) {
            Ok(event) => {
                tracing::debug!(
                    event = %event.event,
                    seconds = event.timestamp.seconds,
                    "monitor event"
                );
            }
            Err(e) => tracing::warn!(error = %e, "discarding malformed monitor event"),
        },
        MessageKind::Response => {
            let resolved = MonitorResponse::from_value(value);
            let waiter = shared
                .pending
                .lock()
                .expect("pending queue poisoned")
                .pop_front();
            match waiter {
                Some(tx) => {
                    if tx.send(resolved).is_err() {
                        tracing::debug!("reply arrived for an abandoned request");
                    }
                }
                None => tracing::warn!("dropping reply with no pending request"),
            }
        }
        MessageKind::Unknown => {
            tracing::warn!(message = %value, "unknown monitor message");
        }
    }
}
