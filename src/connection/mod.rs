//! A single multiplexed session to one coordinator.
//!
//! Requests are framed and correlated by stream id. A reader task feeds decoded frames
//! to a router task over a channel; the router is the only writer of the stream id
//! allocator and the pending-request table, so every id has exactly one outstanding
//! request and is eventually released on response, timeout accounting, or teardown.

pub(crate) mod establish;
mod stream;
mod stream_ids;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, WriteHalf},
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, trace, warn};

use crate::{
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    frame::{
        codec,
        request::Request,
        response::{ParsedResponse, Response, ServerEvent},
        Frame,
        FrameFlags,
        FrameReader,
        EVENT_STREAM_ID,
    },
    options::{EndPoint, ProtocolVersion},
    runtime::{self, ShutdownRequest},
};

pub(crate) use establish::{ConnectionEstablisher, NegotiatedSettings};
pub(crate) use stream::{AsyncStream, StreamOptions};

/// How long a draining connection waits for in-flight responses before failing them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Extra knobs for a single send.
#[derive(Clone, Debug, Default)]
pub(crate) struct SendOptions {
    /// Per-attempt response timeout. `None` waits indefinitely (used during
    /// handshakes, which have their own outer timeout).
    pub(crate) read_timeout: Option<Duration>,

    /// Key/value bag forwarded to the server in the frame envelope.
    pub(crate) custom_payload: Option<Vec<(String, Vec<u8>)>>,

    /// Ask the server to trace the request and return a tracing id.
    pub(crate) tracing: bool,
}

#[derive(Clone, Debug)]
enum Status {
    Open,
    Draining,
    Closed(Error),
}

/// Handle to one established connection. Cloneable; the underlying session closes when
/// it is defuncted, shut down, or every handle is dropped.
#[derive(Clone, Debug)]
pub(crate) struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    id: u64,
    endpoint: EndPoint,
    version: ProtocolVersion,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    next_token: AtomicU64,
    /// Stream ids currently allocated, orphaned ones included. Written only by the
    /// router; read by the pool for least-loaded borrowing.
    in_flight: AtomicUsize,
    /// Total responses delivered over the connection's lifetime.
    responses: AtomicU64,
    max_requests: usize,
}

enum Command {
    Send {
        token: u64,
        request: Request,
        options: SendOptions,
        reply: oneshot::Sender<Result<ParsedResponse>>,
    },
    /// The requester stopped waiting; keep the stream id reserved but count it
    /// against the defunct threshold.
    Abandon { token: u64 },
    Shutdown(ShutdownRequest),
}

impl Connection {
    /// Takes ownership of a handshaken stream and starts the reader and router tasks.
    pub(crate) fn start(
        stream: AsyncStream,
        endpoint: EndPoint,
        settings: NegotiatedSettings,
        max_requests: usize,
        heartbeat_interval: Duration,
        defunct_threshold: usize,
        event_sender: Option<mpsc::UnboundedSender<ServerEvent>>,
    ) -> Connection {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::Open);

        let inner = Arc::new(ConnectionInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.clone(),
            version: settings.version,
            commands: command_tx,
            status: status_rx,
            next_token: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            responses: AtomicU64::new(0),
            max_requests,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let compressor = settings.compressor;
        runtime::spawn(read_loop(read_half, frame_tx, compressor));

        let router = Router {
            connection: Arc::clone(&inner),
            write_half,
            compressor,
            ids: stream_ids::StreamIdSet::new(max_requests),
            pending: HashMap::new(),
            tokens: HashMap::new(),
            orphaned: 0,
            defunct_threshold,
            heartbeat_interval,
            last_activity: Instant::now(),
            heartbeat_stream: None,
            status: status_tx,
            event_sender,
            command_rx,
            frame_rx,
        };
        runtime::spawn(router.run());

        Connection { inner }
    }

    /// Driver-wide unique id for this connection; prepared-statement bindings are
    /// keyed by it.
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn endpoint(&self) -> &EndPoint {
        &self.inner.endpoint
    }

    #[allow(unused)]
    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.inner.version
    }

    /// Stream ids currently reserved.
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Whether a send right now could get a stream id.
    pub(crate) fn has_free_stream_id(&self) -> bool {
        self.in_flight() < self.inner.max_requests
    }

    #[allow(unused)]
    pub(crate) fn total_responses(&self) -> u64 {
        self.inner.responses.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        !matches!(*self.inner.status.borrow(), Status::Open)
    }

    /// Resolves with the close reason once the connection is defunct or shut down.
    pub(crate) async fn closed(&self) -> Error {
        let mut status = self.inner.status.clone();
        loop {
            if let Status::Closed(ref error) = *status.borrow_and_update() {
                return error.clone();
            }
            if status.changed().await.is_err() {
                return Error::connection_closed("connection task exited");
            }
        }
    }

    /// Sends one request and awaits its correlated response.
    ///
    /// On a read timeout the stream id stays reserved until the late response arrives
    /// or the connection defuncts; the timeout only abandons the wait.
    pub(crate) async fn send(
        &self,
        request: Request,
        options: SendOptions,
    ) -> Result<ParsedResponse> {
        match &*self.inner.status.borrow() {
            Status::Open => {}
            Status::Draining => return Err(ErrorKind::ShuttingDown.into()),
            Status::Closed(error) => return Err(error.clone()),
        }

        let read_timeout = options.read_timeout;
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Send {
                token,
                request,
                options,
                reply,
            })
            .map_err(|_| self.close_reason())?;

        let response = match read_timeout {
            Some(timeout) => match runtime::timeout(timeout, response).await {
                Some(response) => response,
                None => {
                    let _ = self.inner.commands.send(Command::Abandon { token });
                    return Err(ErrorKind::OperationTimedOut {
                        endpoint: self.inner.endpoint.clone(),
                    }
                    .into());
                }
            },
            None => response.await,
        };

        match response {
            Ok(result) => result,
            Err(_) => Err(self.close_reason()),
        }
    }

    /// Stops accepting new requests, drains in-flight ones within a grace window, and
    /// closes the socket. Idempotent.
    pub(crate) async fn shutdown(&self) {
        let (request, done) = ShutdownRequest::channel();
        if self.inner.commands.send(Command::Shutdown(request)).is_ok() {
            done.wait().await;
        }
    }

    fn close_reason(&self) -> Error {
        match &*self.inner.status.borrow() {
            Status::Closed(error) => error.clone(),
            Status::Draining => ErrorKind::ShuttingDown.into(),
            Status::Open => Error::connection_closed("connection task exited"),
        }
    }
}

enum ReaderMessage {
    Frame(Frame),
    Closed(Error),
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<AsyncStream>,
    frames: mpsc::UnboundedSender<ReaderMessage>,
    compressor: Option<Compressor>,
) {
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                let _ = frames.send(ReaderMessage::Closed(Error::connection_closed(
                    "connection closed by server",
                )));
                return;
            }
            Ok(n) => {
                reader.push(&buf[..n]);
                loop {
                    match reader.next_frame(compressor.as_ref()) {
                        Ok(Some(frame)) => {
                            if frames.send(ReaderMessage::Frame(frame)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            let _ = frames.send(ReaderMessage::Closed(error));
                            return;
                        }
                    }
                }
            }
            Err(error) => {
                let _ = frames.send(ReaderMessage::Closed(error.into()));
                return;
            }
        }
    }
}

enum PendingRequest {
    User {
        token: u64,
        reply: oneshot::Sender<Result<ParsedResponse>>,
    },
    /// The waiter timed out; the id is reserved until the response shows up.
    Orphaned,
    Heartbeat,
}

/// The per-connection dispatcher. Owns the write half, the stream id allocator, and
/// the pending table.
struct Router {
    connection: Arc<ConnectionInner>,
    write_half: WriteHalf<AsyncStream>,
    compressor: Option<Compressor>,
    ids: stream_ids::StreamIdSet,
    pending: HashMap<i16, PendingRequest>,
    tokens: HashMap<u64, i16>,
    orphaned: usize,
    defunct_threshold: usize,
    heartbeat_interval: Duration,
    last_activity: Instant,
    heartbeat_stream: Option<i16>,
    status: watch::Sender<Status>,
    event_sender: Option<mpsc::UnboundedSender<ServerEvent>>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    frame_rx: mpsc::UnboundedReceiver<ReaderMessage>,
}

impl Router {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.reset();

        let shutdown_request = loop {
            tokio::select! {
                biased;

                Some(message) = self.frame_rx.recv() => match message {
                    ReaderMessage::Frame(frame) => self.handle_frame(frame),
                    ReaderMessage::Closed(error) => {
                        self.defunct(error).await;
                        return;
                    }
                },
                command = self.command_rx.recv() => match command {
                    Some(Command::Send { token, request, options, reply }) => {
                        if let Err(error) = self.handle_send(token, request, options, reply).await {
                            self.defunct(error).await;
                            return;
                        }
                    }
                    Some(Command::Abandon { token }) => self.handle_abandon(token),
                    Some(Command::Shutdown(request)) => break Some(request),
                    // Every handle dropped; drain whatever is in flight and exit.
                    None => break None,
                },
                _ = heartbeat.tick() => {
                    if let Err(error) = self.handle_heartbeat().await {
                        self.defunct(error).await;
                        return;
                    }
                }
            }

            if self.orphaned > self.defunct_threshold {
                let orphaned = self.orphaned;
                self.defunct(Error::connection_closed(format!(
                    "{orphaned} requests timed out without a response"
                )))
                .await;
                return;
            }
        };

        self.drain(SHUTDOWN_GRACE).await;
        if let Some(request) = shutdown_request {
            request.complete();
        }
    }

    async fn handle_send(
        &mut self,
        token: u64,
        request: Request,
        options: SendOptions,
        reply: oneshot::Sender<Result<ParsedResponse>>,
    ) -> Result<()> {
        let Some(stream) = self.ids.allocate() else {
            let _ = reply.send(Err(ErrorKind::ConnectionBusy.into()));
            return Ok(());
        };

        match self.write_request(stream, &request, &options).await {
            Ok(()) => {
                self.connection.in_flight.fetch_add(1, Ordering::Relaxed);
                self.pending
                    .insert(stream, PendingRequest::User { token, reply });
                self.tokens.insert(token, stream);
                Ok(())
            }
            Err(error) => {
                self.ids.release(stream);
                let _ = reply.send(Err(error.clone()));
                // A failed socket write leaves the connection unusable.
                Err(error)
            }
        }
    }

    async fn write_request(
        &mut self,
        stream: i16,
        request: &Request,
        options: &SendOptions,
    ) -> Result<()> {
        let mut body = Vec::new();
        if let Some(ref payload) = options.custom_payload {
            codec::write_u16(&mut body, payload.len() as u16);
            for (key, value) in payload {
                codec::write_string(&mut body, key);
                codec::write_bytes_opt(&mut body, Some(value));
            }
        }
        request.write_body(self.connection.version, &mut body)?;

        let mut frame = Frame::new(stream, request.opcode(), body);
        if options.custom_payload.is_some() {
            frame.flags |= FrameFlags::CUSTOM_PAYLOAD;
        }
        if options.tracing {
            frame.flags |= FrameFlags::TRACING;
        }

        let bytes = frame.encode(self.connection.version, self.compressor.as_ref())?;
        self.write_half.write_all(&bytes).await?;
        self.write_half.flush().await?;
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) {
        self.last_activity = Instant::now();

        if frame.stream == EVENT_STREAM_ID {
            self.handle_event(frame);
            return;
        }

        let Some(pending) = self.pending.remove(&frame.stream) else {
            warn!(
                endpoint = %self.connection.endpoint,
                stream = frame.stream,
                "discarding response with no matching request"
            );
            return;
        };
        self.ids.release(frame.stream);
        self.connection.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.connection.responses.fetch_add(1, Ordering::Relaxed);

        match pending {
            PendingRequest::User { token, reply } => {
                self.tokens.remove(&token);
                let _ = reply.send(decode_response(&frame, self.connection.version));
            }
            PendingRequest::Orphaned => {
                self.orphaned -= 1;
                trace!(
                    endpoint = %self.connection.endpoint,
                    stream = frame.stream,
                    "late response released an orphaned stream id"
                );
            }
            PendingRequest::Heartbeat => {
                self.heartbeat_stream = None;
            }
        }
    }

    fn handle_event(&mut self, frame: Frame) {
        match Response::deserialize(&frame, self.connection.version) {
            Ok(parsed) => {
                if let Response::Event(event) = parsed.kind {
                    if let Some(ref sender) = self.event_sender {
                        let _ = sender.send(event);
                    }
                }
            }
            Err(error) => warn!(
                endpoint = %self.connection.endpoint,
                %error,
                "dropping undecodable event frame"
            ),
        }
    }

    fn handle_abandon(&mut self, token: u64) {
        let Some(stream) = self.tokens.remove(&token) else {
            // The response won the race with the timeout.
            return;
        };
        if let Some(entry) = self.pending.get_mut(&stream) {
            *entry = PendingRequest::Orphaned;
            self.orphaned += 1;
        }
    }

    async fn handle_heartbeat(&mut self) -> Result<()> {
        if self.heartbeat_stream.is_some() {
            return Err(Error::connection_closed(
                "heartbeat went unanswered for a full interval",
            ));
        }
        if self.last_activity.elapsed() < self.heartbeat_interval {
            return Ok(());
        }
        // All ids busy means the connection has traffic; the next response will
        // refresh last_activity.
        let Some(stream) = self.ids.allocate() else {
            return Ok(());
        };
        debug!(endpoint = %self.connection.endpoint, "sending OPTIONS heartbeat");
        self.write_request(stream, &Request::Options, &SendOptions::default())
            .await?;
        self.connection.in_flight.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(stream, PendingRequest::Heartbeat);
        self.heartbeat_stream = Some(stream);
        Ok(())
    }

    /// Fails every waiter with a single unified error and closes the socket.
    async fn defunct(mut self, error: Error) {
        debug!(endpoint = %self.connection.endpoint, %error, "connection defunct");
        let _ = self.status.send(Status::Closed(error.clone()));
        self.fail_pending(&error);
        self.reject_queued_commands(&error);
        let _ = self.write_half.shutdown().await;
    }

    /// Stops accepting sends and waits up to `grace` for in-flight responses before
    /// failing the rest with `ShuttingDown`.
    async fn drain(mut self, grace: Duration) {
        let _ = self.status.send(Status::Draining);
        let shutdown_error: Error = ErrorKind::ShuttingDown.into();
        self.reject_queued_commands(&shutdown_error);

        let deadline = Instant::now() + grace;
        while self
            .pending
            .values()
            .any(|p| matches!(p, PendingRequest::User { .. }))
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match runtime::timeout(remaining, self.frame_rx.recv()).await {
                Some(Some(ReaderMessage::Frame(frame))) => self.handle_frame(frame),
                Some(Some(ReaderMessage::Closed(_))) | Some(None) | None => break,
            }
        }

        let _ = self.status.send(Status::Closed(shutdown_error.clone()));
        self.fail_pending(&shutdown_error);
        self.reject_queued_commands(&shutdown_error);
        let _ = self.write_half.shutdown().await;
    }

    fn fail_pending(&mut self, error: &Error) {
        for (_, pending) in self.pending.drain() {
            if let PendingRequest::User { reply, .. } = pending {
                let _ = reply.send(Err(error.clone()));
            }
        }
        self.tokens.clear();
        self.orphaned = 0;
        self.connection.in_flight.store(0, Ordering::Relaxed);
    }

    fn reject_queued_commands(&mut self, error: &Error) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::Send { reply, .. } => {
                    let _ = reply.send(Err(error.clone()));
                }
                Command::Abandon { .. } => {}
                Command::Shutdown(request) => request.complete(),
            }
        }
    }
}

/// Maps a response frame to the waiter's result, turning server ERRORs into `Err`.
fn decode_response(frame: &Frame, version: ProtocolVersion) -> Result<ParsedResponse> {
    let parsed = Response::deserialize(frame, version)?;
    match parsed.kind {
        Response::Error(server_error) => Err(Error::new(ErrorKind::Server(server_error))),
        _ => Ok(parsed),
    }
}
