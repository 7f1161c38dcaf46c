//! Per-connection protocol engine.
//!
//! A [`Peer`] owns one transport and serves requests on it until either side
//! closes it. It runs as a single task; everything the application does
//! through a [`Session`] is posted to that task as a command, so connection
//! state is only ever touched from one place.
//!
//! # Data Flow
//! ```text
//! transport ──read──▶ read buffer ──▶ Parser ──request──▶ Handler::on_request
//!                                                               │
//!             ┌─────────── Session::write ◀─────────────────────┘
//!             ▼
//!        WriteQueue ──batch──▶ vectored write ──▶ transport
//!                                  ▲
//!        Writer (streaming) ───────┘
//! ```
//!
//! # Design Decisions
//! - At most one read and one write are outstanding at any time
//! - One deadline covers whichever network operations are outstanding; it is
//!   re-armed when an operation starts and cancelled once none remain
//! - The first failure is recorded and reported; later ones are dropped
//! - Every path ends in exactly one `Handler::on_close`

pub mod timeout;
pub mod write_queue;

use std::fmt;
use std::future::{self, Future};
use std::io::{self, IoSlice};
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::error::PeerError;
use crate::net::connection::{ConnectionId, ConnectionState};
use crate::net::transport::Transport;
use crate::observability::metrics;
use crate::proto::{HttpParser, ParseError, Parser, ParserLimits, Request};
use crate::session::{Command, Handler, Session, Writer};

use self::timeout::TimeoutGuard;
use self::write_queue::Batch;

type Op<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct ReadDone<T> {
    half: ReadHalf<T>,
    buf: BytesMut,
    result: io::Result<usize>,
}

enum Transmit {
    Queue,
    Stream(StreamState),
    Shutdown,
}

struct WriteDone<T> {
    half: WriteHalf<T>,
    transmit: Transmit,
    result: io::Result<usize>,
}

struct StreamState {
    writer: Box<dyn Writer>,
    keep_alive: bool,
    parked: bool,
}

enum ReadStep {
    NeedMore,
    Request(Request),
    Invalid(ParseError),
    Eof,
}

/// Connection engine for one transport.
pub struct Peer<T, P = HttpParser> {
    session: Session,
    handler: Arc<dyn Handler>,
    commands: mpsc::UnboundedReceiver<Command>,

    reader: Option<ReadHalf<T>>,
    writer: Option<WriteHalf<T>>,
    read_op: Option<Op<ReadDone<T>>>,
    write_op: Option<Op<WriteDone<T>>>,
    timer: TimeoutGuard,

    read_buf: BytesMut,
    parser: Option<P>,
    fed: bool,
    stream: Option<StreamState>,

    limits: ParserLimits,
    read_chunk_size: usize,
    write_chunk_size: usize,

    state: ConnectionState,
    request_count: u64,
    last_error: Option<PeerError>,
    complete: bool,
    graceful: bool,
}

impl<T: Transport, P: Parser> Peer<T, P> {
    /// Wrap an accepted transport.
    ///
    /// `pre_read` holds bytes already taken off the transport (for example
    /// while sniffing the protocol); they are parsed before anything else is
    /// read.
    pub fn new(
        transport: T,
        remote_addr: SocketAddr,
        pre_read: &[u8],
        config: Arc<ServerConfig>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let connection = &config.connection;
        let timer = TimeoutGuard::new(connection.timeout());
        let limits = connection.parser_limits();
        let read_chunk_size = connection.read_chunk_size.max(1);
        let write_chunk_size = connection.write_chunk_size.max(1);

        let mut read_buf = BytesMut::with_capacity(read_chunk_size.max(pre_read.len()));
        read_buf.extend_from_slice(pre_read);

        let (tx, commands) = mpsc::unbounded_channel();
        let session = Session::new(ConnectionId::new(), remote_addr, config, tx);
        let (reader, writer) = tokio::io::split(transport);
        metrics::record_connection_opened();

        Self {
            session,
            handler,
            commands,
            reader: Some(reader),
            writer: Some(writer),
            read_op: None,
            write_op: None,
            timer,
            read_buf,
            parser: None,
            fed: false,
            stream: None,
            limits,
            read_chunk_size,
            write_chunk_size,
            state: ConnectionState::Reading,
            request_count: 0,
            last_error: None,
            complete: false,
            graceful: false,
        }
    }

    /// Handle to this connection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Identifier used in logs.
    pub fn id(&self) -> ConnectionId {
        self.session.id()
    }

    /// Serve the connection until it closes.
    pub async fn run(self) {
        let span = self.session.span().clone();
        self.drive().instrument(span).await
    }

    async fn drive(mut self) {
        tracing::trace!("accept");
        self.start_read();
        while self.state != ConnectionState::Closed {
            self.step().await;
        }
        self.commands.close();

        tracing::trace!(
            requests = self.request_count,
            error = self.last_error.as_ref().map(tracing::field::display),
            "destroyed"
        );
        let handler = Arc::clone(&self.handler);
        handler.on_close(&self.session, self.last_error.as_ref());
    }

    async fn step(&mut self) {
        tokio::select! {
            biased;

            Some(command) = self.commands.recv() => self.on_command(command),

            done = wait_for(&mut self.write_op) => {
                self.write_op = None;
                self.on_write(done);
            }

            done = wait_for(&mut self.read_op) => {
                self.read_op = None;
                self.on_read(done);
            }

            () = self.timer.expired() => self.on_timer(),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Flush => self.pump_writes(),
            Command::Complete => self.on_complete(),
            Command::Stream { writer, keep_alive } => self.on_stream(writer, keep_alive),
            Command::Resume => self.on_resume(),
            Command::Close { graceful: true } => self.close_graceful(),
            Command::Close { graceful: false } => {
                tracing::trace!("abort");
                self.teardown();
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.session.set_state(state);
    }

    fn start_timer(&mut self) {
        self.timer.arm();
    }

    fn cancel_timer(&mut self) {
        if self.read_op.is_none() && self.write_op.is_none() {
            self.timer.disarm();
        }
    }

    fn on_timer(&mut self) {
        if let Some(error) = self.timer.fire() {
            self.fail(error, "timer");
        }
    }

    // ----- reading -----

    fn start_read(&mut self) {
        self.complete = false;
        self.session.set_request(None);
        self.parser = Some(P::new(&self.limits));
        self.fed = false;
        self.set_state(ConnectionState::Reading);
        self.advance_read(false);
    }

    fn advance_read(&mut self, eof: bool) {
        if !eof && self.read_buf.is_empty() {
            return self.start_network_read();
        }

        let step = {
            let Some(parser) = self.parser.as_mut() else {
                return;
            };
            let fed = if eof {
                parser.write_eof()
            } else {
                self.fed = true;
                let read_buf = &mut self.read_buf;
                parser.write(&read_buf[..]).map(|used| read_buf.advance(used))
            };
            match fed {
                Err(error) => ReadStep::Invalid(error),
                Ok(()) => match parser.is_complete().then(|| parser.take_request()).flatten() {
                    Some(request) => ReadStep::Request(request),
                    None if eof => ReadStep::Eof,
                    None => ReadStep::NeedMore,
                },
            }
        };

        match step {
            ReadStep::Request(request) => self.dispatch(request),
            ReadStep::Invalid(error) => self.reject(error),
            ReadStep::Eof if self.fed => self.fail(PeerError::IncompleteRequest, "read"),
            ReadStep::Eof => {
                tracing::trace!("eof");
                self.close_graceful();
            }
            ReadStep::NeedMore => self.start_network_read(),
        }
    }

    fn start_network_read(&mut self) {
        let Some(mut half) = self.reader.take() else {
            return;
        };
        let mut buf = mem::take(&mut self.read_buf);
        let limit = self.read_chunk_size;
        buf.reserve(limit);

        self.read_op = Some(Box::pin(async move {
            let result = (&mut half).take(limit as u64).read_buf(&mut buf).await;
            ReadDone { half, buf, result }
        }));
        self.start_timer();
    }

    fn on_read(&mut self, done: ReadDone<T>) {
        self.reader = Some(done.half);
        self.read_buf = done.buf;
        self.cancel_timer();

        match done.result {
            Ok(0) => self.advance_read(true),
            Ok(n) => {
                self.session.record_bytes_in(n);
                metrics::record_bytes_in(n);
                self.advance_read(false);
            }
            Err(error) => self.fail(PeerError::Io(error), "read"),
        }
    }

    fn dispatch(&mut self, request: Request) {
        self.parser = None;
        self.request_count += 1;
        self.session.record_request();
        metrics::record_request();
        tracing::trace!(
            request = self.request_count,
            method = %request.method(),
            uri = %request.uri(),
            "request"
        );

        self.session.set_request(Some(Arc::new(request)));
        self.set_state(ConnectionState::Dispatched);
        let handler = Arc::clone(&self.handler);
        handler.on_request(&self.session);
    }

    fn reject(&mut self, error: ParseError) {
        self.parser = None;
        tracing::debug!(%error, "Malformed request");
        self.set_state(ConnectionState::Dispatched);
        let handler = Arc::clone(&self.handler);
        handler.on_parse_error(&self.session, &error);

        if self.last_error.is_none() {
            metrics::record_failure("parse");
            self.last_error = Some(PeerError::Parse(error));
        }
        self.close_graceful();
    }

    // ----- application commands -----

    fn on_complete(&mut self) {
        if self.state != ConnectionState::Dispatched {
            tracing::debug!(state = ?self.state, "Ignoring complete outside of a request");
            return;
        }
        self.complete = true;
        self.session.set_request(None);
        self.pump_writes();
    }

    fn on_stream(&mut self, writer: Box<dyn Writer>, keep_alive: bool) {
        if self.state != ConnectionState::Dispatched {
            tracing::debug!(state = ?self.state, "Ignoring stream outside of a request");
            return;
        }
        self.stream = Some(StreamState {
            writer,
            keep_alive,
            parked: false,
        });
        self.set_state(ConnectionState::Streaming);
        self.pump_writes();
    }

    fn on_resume(&mut self) {
        let resumed = match self.stream.as_mut() {
            Some(stream) if stream.parked => {
                stream.parked = false;
                true
            }
            _ => false,
        };
        if resumed {
            self.pump_writes();
        }
    }

    // ----- writing -----

    /// Start the next write, if any is due and none is outstanding.
    ///
    /// Queued bytes go before streamed bytes. Once both are drained and the
    /// response is complete, the connection either closes or reads again.
    fn pump_writes(&mut self) {
        if self.write_op.is_some() || self.writer.is_none() {
            return;
        }

        if let Some(batch) = self.session.queue().begin_flush() {
            return self.start_flush(batch);
        }

        match self.stream.as_ref().map(|stream| stream.parked) {
            Some(false) => return self.drive_stream(),
            Some(true) => return,
            None => {}
        }

        if !self.complete {
            return;
        }
        if self.graceful {
            self.start_shutdown();
        } else if matches!(
            self.state,
            ConnectionState::Dispatched | ConnectionState::Streaming
        ) {
            self.start_read();
        }
    }

    fn start_flush(&mut self, batch: Batch) {
        let Some(mut half) = self.writer.take() else {
            return;
        };
        tracing::trace!(writes = batch.len(), bytes = batch.remaining(), "flush");

        self.write_op = Some(Box::pin(async move {
            let result = write_batch(&mut half, batch).await;
            WriteDone {
                half,
                transmit: Transmit::Queue,
                result,
            }
        }));
        self.start_timer();
    }

    fn drive_stream(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        if !stream
            .writer
            .prepare(self.write_chunk_size, self.session.resume_token())
        {
            stream.parked = true;
            self.stream = Some(stream);
            return;
        }

        let data = stream.writer.data();
        if data.iter().all(Bytes::is_empty) {
            if stream.writer.complete() {
                return self.finish_stream(stream.keep_alive);
            }
            return self.fail(PeerError::StalledWriter, "writer");
        }

        let Some(mut half) = self.writer.take() else {
            self.stream = Some(stream);
            return;
        };
        self.write_op = Some(Box::pin(async move {
            let result = write_prepared(&mut half, &data).await;
            WriteDone {
                half,
                transmit: Transmit::Stream(stream),
                result,
            }
        }));
        self.start_timer();
    }

    fn finish_stream(&mut self, keep_alive: bool) {
        self.stream = None;
        self.complete = true;
        self.session.set_request(None);
        if !keep_alive {
            self.graceful = true;
            self.set_state(ConnectionState::Draining);
        }
        self.pump_writes();
    }

    fn on_write(&mut self, done: WriteDone<T>) {
        self.writer = Some(done.half);
        self.cancel_timer();

        match (done.transmit, done.result) {
            (Transmit::Shutdown, result) => match result {
                Err(error) if error.kind() != io::ErrorKind::NotConnected => {
                    self.fail(PeerError::Io(error), "shutdown")
                }
                _ => {
                    tracing::trace!("shutdown");
                    self.teardown();
                }
            },
            (Transmit::Queue, Err(error)) => self.fail(PeerError::Io(error), "write"),
            (Transmit::Stream(_), Err(error)) => self.fail(PeerError::Io(error), "writer"),
            (Transmit::Queue, Ok(n)) => {
                self.record_bytes_out(n);
                match self.session.queue().finish_flush() {
                    Some(batch) => self.start_flush(batch),
                    None => self.pump_writes(),
                }
            }
            (Transmit::Stream(mut stream), Ok(n)) => {
                self.record_bytes_out(n);
                stream.writer.consume(n);
                if self.graceful || stream.writer.complete() {
                    self.finish_stream(stream.keep_alive);
                } else {
                    self.stream = Some(stream);
                    self.pump_writes();
                }
            }
        }
    }

    fn record_bytes_out(&self, n: usize) {
        self.session.record_bytes_out(n);
        metrics::record_bytes_out(n);
    }

    // ----- closing -----

    /// Stop reading, transmit everything already queued, then shut down.
    fn close_graceful(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.graceful = true;
        self.complete = true;
        self.parser = None;
        self.stream = None;
        self.read_op = None;
        self.cancel_timer();
        self.set_state(ConnectionState::Draining);
        self.pump_writes();
    }

    fn start_shutdown(&mut self) {
        let Some(mut half) = self.writer.take() else {
            return self.teardown();
        };
        self.set_state(ConnectionState::Draining);
        self.write_op = Some(Box::pin(async move {
            let result = half.shutdown().await.map(|()| 0);
            WriteDone {
                half,
                transmit: Transmit::Shutdown,
                result,
            }
        }));
        self.start_timer();
    }

    /// Release the transport and everything tied to it.
    fn teardown(&mut self) {
        self.read_op = None;
        self.write_op = None;
        self.reader = None;
        self.writer = None;
        self.parser = None;
        self.stream = None;
        self.timer.disarm();
        self.session.queue().clear();
        self.session.set_request(None);
        self.set_state(ConnectionState::Closed);
    }

    fn fail(&mut self, error: PeerError, what: &'static str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.last_error.is_none() {
            tracing::trace!(what, %error, "failure");
            metrics::record_failure(what);
            self.last_error = Some(error);
        }
        self.teardown();
    }
}

impl<T, P> fmt::Debug for Peer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.session.id())
            .field("state", &self.state)
            .field("requests", &self.request_count)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

async fn wait_for<O>(op: &mut Option<Op<O>>) -> O {
    match op.as_mut() {
        Some(op) => op.await,
        None => future::pending().await,
    }
}

async fn write_batch<W>(dst: &mut W, mut batch: Batch) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while !batch.is_done() {
        let n = dst.write_vectored(&batch.io_slices()).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        batch.advance(n);
        written += n;
    }
    dst.flush().await?;
    Ok(written)
}

async fn write_prepared<W>(dst: &mut W, data: &[Bytes]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let slices: Vec<IoSlice<'_>> = data
        .iter()
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| IoSlice::new(chunk))
        .collect();
    let n = dst.write_vectored(&slices).await?;
    if n == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    dst.flush().await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;

    struct Recorder {
        closed: UnboundedSender<Option<String>>,
        reply: &'static [u8],
    }

    impl Handler for Recorder {
        fn on_request(&self, session: &Session) {
            session.write(self.reply);
            session.complete();
        }

        fn on_close(&self, _session: &Session, error: Option<&PeerError>) {
            let _ = self.closed.send(error.map(ToString::to_string));
        }
    }

    fn peer(
        transport: tokio::io::DuplexStream,
        reply: &'static [u8],
    ) -> (Peer<tokio::io::DuplexStream>, mpsc::UnboundedReceiver<Option<String>>) {
        let (closed, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recorder { closed, reply });
        let addr = "127.0.0.1:5000".parse().unwrap();
        let peer = Peer::new(transport, addr, b"", Arc::new(ServerConfig::default()), handler);
        (peer, rx)
    }

    #[tokio::test]
    async fn serves_keep_alive_requests_over_duplex() {
        let (client, server) = duplex(1024);
        let (peer, mut closed) = peer(server, b"ok");
        let session = peer.session().clone();
        let task = tokio::spawn(peer.run());

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 2];
        rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        wr.write_all(b"GET /again HTTP/1.1\r\n\r\n").await.unwrap();
        rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        drop(wr);
        drop(rd);
        task.await.unwrap();
        assert_eq!(closed.recv().await, Some(None));
        assert_eq!(session.stats().requests, 2);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn first_failure_wins() {
        let (client, server) = duplex(1024);
        let (mut peer, _closed) = peer(server, b"");
        drop(client);

        peer.fail(PeerError::IncompleteRequest, "read");
        peer.fail(PeerError::Timeout(Duration::from_secs(1)), "timer");
        assert!(matches!(peer.last_error, Some(PeerError::IncompleteRequest)));
        assert_eq!(peer.state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn abort_skips_pending_writes() {
        let (client, server) = duplex(1024);
        let (peer, mut closed) = peer(server, b"");
        let session = peer.session().clone();
        let task = tokio::spawn(peer.run());

        session.write(b"never sent");
        session.close(false);
        task.await.unwrap();
        assert_eq!(closed.recv().await, Some(None));

        let mut client = client;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
