//! A promoted WebSocket connection.
//!
//! The connection owns its socket exclusively. Its read loop decodes client
//! frames, reassembles fragmented messages, answers pings, and drives the
//! close sequence. Observers hear about the connection through
//! [`ConnectionObserver`]: `on_message` once per complete text message, in
//! read order, and `on_disconnect` exactly once, strictly after the close
//! frame write has finished (or failed) and both socket halves have been
//! released.

use std::io;
use std::sync::Arc;

use agentscope_protocol::ConnectionId;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::frame::{
    self, parse_close_code, CloseCode, DataMessage, Decoder, FragmentAssembly, Frame, FrameError,
    Opcode,
};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives the events of one or more connections
pub trait ConnectionObserver: Send + Sync {
    fn on_message(&self, id: ConnectionId, text: String) -> BoxFuture<'_, ()>;
    fn on_disconnect(&self, id: ConnectionId) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Open,
    Closing,
    Closed,
}

struct CloseGuarded {
    state: LifecycleState,
    writer: Option<BoxedWriter>,
}

struct Shared {
    id: ConnectionId,
    /// Guards every write and every lifecycle transition.
    inner: Mutex<CloseGuarded>,
    observer: Arc<dyn ConnectionObserver>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    async fn write_frame(&self, frame: &Frame) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.state != LifecycleState::Open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closing",
            ));
        }
        match guard.writer.as_mut() {
            Some(writer) => write_frame(writer, frame).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket released",
            )),
        }
    }

    /// Run the close sequence once. `reply` is the close code to send, or
    /// `None` when the socket is already unusable. Releases the write half
    /// and wakes the read loop, which drops the read half and then reports
    /// the disconnect.
    async fn close_sequence(&self, reply: Option<CloseCode>) {
        let mut guard = self.inner.lock().await;
        if guard.state != LifecycleState::Open {
            return;
        }
        guard.state = LifecycleState::Closing;

        if let (Some(code), Some(writer)) = (reply, guard.writer.as_mut()) {
            if let Err(e) = write_frame(writer, &Frame::close(code)).await {
                debug!(
                    component = "websocket",
                    event = "ws.close.send_failed",
                    connection_id = %self.id,
                    error = %e,
                    "Close frame could not be sent"
                );
            }
        }
        if let Some(mut writer) = guard.writer.take() {
            let _ = writer.shutdown().await;
        }
        guard.state = LifecycleState::Closed;
        drop(guard);

        self.closed_tx.send_replace(true);
        info!(
            component = "websocket",
            event = "ws.connection.closed",
            connection_id = %self.id,
            close_code = reply.map(|c| c.0),
            "WebSocket connection closed"
        );
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &Frame) -> io::Result<()> {
    let mut buf = BytesMut::new();
    frame::encode(frame, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Cloneable handle used to close a connection from outside its read loop
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub async fn state(&self) -> LifecycleState {
        self.shared.inner.lock().await.state
    }

    /// Close with 1000. Returns once the close frame is written and the write
    /// half released; the read loop then reports the disconnect.
    pub async fn close(&self) {
        self.shared.close_sequence(Some(CloseCode::NORMAL)).await;
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Read side of a promoted connection
pub struct WebSocketConnection {
    handle: ConnectionHandle,
    reader: BoxedReader,
    read_buf: BytesMut,
    decoder: Decoder,
    assembly: FragmentAssembly,
    closed_rx: watch::Receiver<bool>,
}

impl WebSocketConnection {
    /// Take ownership of `stream`. `leftover` holds bytes already read past
    /// the handshake and is decoded before anything else.
    pub fn new<S>(
        id: ConnectionId,
        stream: S,
        leftover: Bytes,
        max_message: usize,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(
            id,
            Box::new(reader),
            Box::new(writer),
            leftover,
            max_message,
            observer,
        )
    }

    pub fn from_parts(
        id: ConnectionId,
        reader: BoxedReader,
        writer: BoxedWriter,
        leftover: Bytes,
        max_message: usize,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id,
            inner: Mutex::new(CloseGuarded {
                state: LifecycleState::Open,
                writer: Some(writer),
            }),
            observer,
            closed_tx,
        });
        Self {
            handle: ConnectionHandle { shared },
            reader,
            read_buf: BytesMut::from(&leftover[..]),
            decoder: Decoder::server(max_message),
            assembly: FragmentAssembly::new(max_message),
            closed_rx,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    fn id(&self) -> ConnectionId {
        self.handle.shared.id
    }

    /// Run the read loop until the connection is closed, release the socket,
    /// then notify the observer.
    pub async fn run(mut self) {
        info!(
            component = "websocket",
            event = "ws.connection.opened",
            connection_id = %self.id(),
            "WebSocket connection opened"
        );

        self.read_loop().await;
        // No-op unless the loop stopped while still open.
        self.handle.shared.close_sequence(None).await;

        let WebSocketConnection { handle, reader, .. } = self;
        drop(reader);
        handle.shared.observer.on_disconnect(handle.shared.id).await;
    }

    async fn read_loop(&mut self) {
        loop {
            if *self.closed_rx.borrow() {
                return;
            }
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    if let Flow::Stop = self.handle_frame(frame).await {
                        return;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    self.fail(err).await;
                    return;
                }
            }

            let read = tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => read,
                _ = self.closed_rx.changed() => return,
            };
            match read {
                Ok(0) => {
                    debug!(
                        component = "websocket",
                        event = "ws.connection.eof",
                        connection_id = %self.id(),
                        "Peer closed the socket without a close frame"
                    );
                    self.handle.shared.close_sequence(None).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        component = "websocket",
                        event = "ws.connection.error",
                        connection_id = %self.id(),
                        error = %e,
                        "WebSocket read failed"
                    );
                    self.handle.shared.close_sequence(None).await;
                    return;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame.opcode {
            Opcode::Ping => {
                if let Err(e) = self.handle.shared.write_frame(&Frame::pong(frame.payload)).await {
                    debug!(
                        component = "websocket",
                        event = "ws.pong.send_failed",
                        connection_id = %self.id(),
                        error = %e,
                        "Pong could not be sent"
                    );
                    self.handle.shared.close_sequence(None).await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
            Opcode::Pong => Flow::Continue,
            Opcode::Close => {
                let reply = match parse_close_code(&frame.payload) {
                    Ok(code) => code.unwrap_or(CloseCode::NORMAL),
                    Err(err) => {
                        warn!(
                            component = "websocket",
                            event = "ws.protocol.violation",
                            connection_id = %self.id(),
                            error = %err,
                            "Malformed close frame"
                        );
                        err.close_code()
                    }
                };
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = %self.id(),
                    close_code = reply.0,
                    "Client sent close frame"
                );
                self.handle.shared.close_sequence(Some(reply)).await;
                Flow::Stop
            }
            Opcode::Continuation | Opcode::Text | Opcode::Binary => {
                match self.assembly.push(frame) {
                    Ok(Some(message)) => self.deliver(message).await,
                    Ok(None) => Flow::Continue,
                    Err(err) => {
                        self.fail(err).await;
                        Flow::Stop
                    }
                }
            }
        }
    }

    async fn deliver(&mut self, message: DataMessage) -> Flow {
        if message.opcode != Opcode::Text {
            debug!(
                component = "websocket",
                event = "ws.message.binary_ignored",
                connection_id = %self.id(),
                payload_bytes = message.payload.len(),
                "Ignoring binary message"
            );
            return Flow::Continue;
        }
        match std::str::from_utf8(&message.payload) {
            Ok(text) => {
                self.handle
                    .shared
                    .observer
                    .on_message(self.id(), text.to_owned())
                    .await;
                Flow::Continue
            }
            Err(_) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.invalid_utf8",
                    connection_id = %self.id(),
                    payload_bytes = message.payload.len(),
                    "Text message is not valid UTF-8"
                );
                self.handle
                    .shared
                    .close_sequence(Some(CloseCode::INVALID_PAYLOAD))
                    .await;
                Flow::Stop
            }
        }
    }

    async fn fail(&mut self, err: FrameError) {
        warn!(
            component = "websocket",
            event = "ws.protocol.violation",
            connection_id = %self.id(),
            error = %err,
            close_code = err.close_code().0,
            "Closing connection after invalid frame"
        );
        self.handle
            .shared
            .close_sequence(Some(err.close_code()))
            .await;
    }
}
