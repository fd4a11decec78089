use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    envelope::Envelope,
    error::{Error, RelayErrorKind},
    outbound_queue::OutboundQueue,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Open,
    Closed,
    Error,
}

/// Lifecycle and data events reported by a relay connection. Errors are events,
/// never panics; whoever owns the transport decides what to do with them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Open,
    Frame(String),
    Closed,
    Error(String),
}

/// Both directions of one relay connection.
#[derive(Debug)]
pub struct RelayChannel {
    /// Text frames to write. Dropping every sender closes the connection.
    pub frames: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// Opens duplex channels to the relay.
pub trait RelayConnector: Send + Sync {
    /// Starts connecting in the background. The first event is either
    /// [`RelayEvent::Open`] or [`RelayEvent::Error`].
    fn connect(&self) -> RelayChannel;
}

/// [`RelayConnector`] over a WebSocket.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    pub url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn relay_loop(
        url: String,
        mut frames: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) {
        tracing::info!("connecting to relay {}", url);
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                let err = Error::new_relay(
                    format!("failed to connect to {}: {}", url, err),
                    RelayErrorKind::ConnectionError,
                );
                tracing::error!("{}", err);
                let _ = events.send(RelayEvent::Error(err.to_string()));
                let _ = events.send(RelayEvent::Closed);
                return;
            }
        };
        tracing::info!("relay connection {} is opened", url);
        let _ = events.send(RelayEvent::Open);

        let (mut write, mut read) = stream.split();

        let writer = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                tracing::trace!("relay send: {}", frame);
                if let Err(err) = write.send(Message::Text(frame)).await {
                    tracing::error!("failed to write relay frame: {}", err);
                    break;
                }
            }
            let _ = write.close().await;
            tracing::debug!("relay writer loop finished");
        });

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let _ = events.send(RelayEvent::Frame(text));
                }
                Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                    Ok(text) => {
                        let _ = events.send(RelayEvent::Frame(text));
                    }
                    Err(err) => tracing::warn!("dropping non UTF-8 relay frame: {}", err),
                },
                Ok(Message::Close(reason)) => {
                    tracing::info!("relay closed the connection: {:?}", reason);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    let err = Error::new_relay(err.to_string(), RelayErrorKind::ConnectionError);
                    tracing::error!("{}", err);
                    let _ = events.send(RelayEvent::Error(err.to_string()));
                    break;
                }
            }
        }

        writer.abort();
        tracing::debug!("relay reader loop finished");
        let _ = events.send(RelayEvent::Closed);
    }
}

impl RelayConnector for WebSocketConnector {
    fn connect(&self) -> RelayChannel {
        let (frame_sender, frame_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::relay_loop(
            self.url.clone(),
            frame_receiver,
            event_sender,
        ));

        RelayChannel {
            frames: frame_sender,
            events: event_receiver,
        }
    }
}

/// Relay connection plus the [`OutboundQueue`] that holds frames until it opens.
///
/// There is no reconnect. Once the relay is lost the queue keeps every frame
/// sent afterwards until [`RelayTransport::close`], and [`RelayTransport::stranded`]
/// counts them.
#[derive(Debug)]
pub struct RelayTransport {
    state: RelayState,
    queue: OutboundQueue,
    frames: Option<mpsc::UnboundedSender<String>>,
    stranded: usize,
}

impl RelayTransport {
    pub fn new(frames: mpsc::UnboundedSender<String>) -> Self {
        Self {
            state: RelayState::Connecting,
            queue: OutboundQueue::new(),
            frames: Some(frames),
            stranded: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Frames queued after the relay was lost.
    pub fn stranded(&self) -> usize {
        self.stranded
    }

    /// Writes the envelope, or queues it while the relay is not open.
    /// Only fails when the envelope cannot be serialized.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), Error> {
        let frame = envelope.to_frame()?;
        match self.state {
            RelayState::Open => {}
            RelayState::Connecting => {
                tracing::debug!("relay is connecting, queueing {} envelope", envelope.action);
                self.queue.push(frame);
                return Ok(());
            }
            RelayState::Closed | RelayState::Error => {
                self.stranded += 1;
                if self.stranded == 1 {
                    tracing::warn!(
                        "relay is {:?}, {} envelope and later ones are held until the room is left",
                        self.state,
                        envelope.action
                    );
                } else {
                    tracing::trace!("relay is {:?}, {} frames stranded", self.state, self.stranded);
                }
                self.queue.push(frame);
                return Ok(());
            }
        }

        match self.frames.as_ref() {
            Some(frames) => {
                if let Err(err) = frames.send(frame) {
                    tracing::warn!("relay writer is gone, queueing {} envelope", envelope.action);
                    self.queue.push(err.0);
                    self.state = RelayState::Closed;
                }
            }
            None => self.queue.push(frame),
        }
        Ok(())
    }

    /// Marks the relay open and flushes queued frames in order.
    pub fn on_open(&mut self) {
        self.state = RelayState::Open;
        let Some(frames) = self.frames.as_ref() else {
            return;
        };

        let mut flushed = 0;
        while let Some(frame) = self.queue.pop() {
            if let Err(err) = frames.send(frame) {
                self.queue.requeue(err.0);
                self.state = RelayState::Closed;
                tracing::warn!("relay writer is gone while flushing, {} frames left", self.queue.len());
                break;
            }
            flushed += 1;
        }
        tracing::debug!("flushed {} queued frames to relay", flushed);
    }

    pub fn on_closed(&mut self) {
        self.state = RelayState::Closed;
    }

    pub fn on_error(&mut self) {
        self.state = RelayState::Error;
    }

    /// Parses one inbound frame. Malformed frames are logged and dropped.
    pub fn receive(&self, frame: &str) -> Option<Envelope> {
        match Envelope::parse(frame) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                tracing::warn!("dropping relay frame: {}: {}", err, frame);
                None
            }
        }
    }

    /// Ends the connection and discards anything still queued.
    pub fn close(&mut self) -> usize {
        self.frames.take();
        self.state = RelayState::Closed;
        let dropped = self.queue.clear();
        self.stranded = 0;
        if dropped > 0 {
            tracing::debug!("dropped {} queued frames on close", dropped);
        }
        dropped
    }
}
