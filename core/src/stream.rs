//! Event-stream decoding for the long-running analysis endpoints.
//!
//! A response body is a sequence of frames separated by a blank line, each
//! carrying `data: {json}` with a [`StreamEvent`]. [`FrameDecoder`] does the
//! reassembly; [`StreamHandle`] drives a body to completion on a background
//! task and hands the events out in order, either pulled with
//! [`StreamHandle::recv`] or pushed into a [`StreamListener`].

use crate::error::ApiError;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const DATA_PREFIX: &str = "data:";
const FRAME_DELIMITER: &[u8] = b"\n\n";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StreamEvent {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    /// The server-signalled error, if any. Empty strings do not count.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|message| !message.is_empty())
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.error_message().is_some()
    }
}

/// Reassembles frames that arrive split across reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Bytes before this offset are known not to start a delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every frame it completed, in order.
    /// Malformed frames come back as `ApiError::StreamParse`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, ApiError>> {
        self.buffer.extend_from_slice(chunk);
        let mut decoded = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = find(&self.buffer[from..], FRAME_DELIMITER) {
            let end = from + offset;
            parse_frame(&self.buffer[start..end], &mut decoded);
            start = end + FRAME_DELIMITER.len();
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len().saturating_sub(FRAME_DELIMITER.len() - 1);
        decoded
    }

    /// Bytes of an incomplete frame still waiting for the rest.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_frame(frame: &[u8], out: &mut Vec<Result<StreamEvent, ApiError>>) {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(err) => {
            out.push(Err(ApiError::StreamParse(format!("frame is not UTF-8: {err}"))));
            return;
        }
    };
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        out.push(
            serde_json::from_str(payload)
                .map_err(|err| ApiError::StreamParse(format!("{err}: {payload}"))),
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    Event(StreamEvent),
    Completed,
    Failed(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Cancels a stream. Cheap to clone; cancelling more than once does nothing.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    gate: Arc<ReentrantMutex<()>>,
    state: Arc<Mutex<StreamState>>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            gate: Arc::new(ReentrantMutex::new(())),
            state: Arc::new(Mutex::new(StreamState::Connecting)),
        }
    }

    /// Stops the transport read. Once this returns no further update is
    /// delivered, even one already read off the wire. Safe to call from
    /// inside a listener callback.
    pub fn cancel(&self) {
        // Waits out a callback running on another thread.
        let _gate = self.gate.lock();
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        let mut state = self.state.lock();
        if !state.is_finished() {
            *state = StreamState::Cancelled;
        }
        debug!("stream cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    fn transition(&self, next: StreamState) {
        let mut state = self.state.lock();
        if !state.is_finished() {
            *state = next;
        }
    }
}

/// Receives stream updates on the stream's delivery task.
pub trait StreamListener: Send + 'static {
    fn on_event(&mut self, event: &StreamEvent);
    fn on_complete(&mut self) {}
    fn on_error(&mut self, _error: &ApiError) {}
}

/// A running stream. Dropping the handle cancels it.
pub struct StreamHandle {
    updates: mpsc::UnboundedReceiver<StreamUpdate>,
    control: CancelHandle,
}

impl StreamHandle {
    /// Connects to `url` on a background task and starts decoding.
    pub fn connect(http: reqwest::Client, url: Url, bearer: Option<String>) -> Self {
        let (tx, updates) = mpsc::unbounded_channel();
        let control = CancelHandle::new();
        let task_control = control.clone();
        tokio::spawn(async move {
            let mut request = http
                .get(url.clone())
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let response = tokio::select! {
                _ = task_control.token.cancelled() => return,
                response = request.send() => response,
            };
            let response = match response {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    let status = response.status().as_u16();
                    warn!(%url, status, "stream request rejected");
                    finish(
                        &tx,
                        &task_control,
                        StreamUpdate::Failed(ApiError::status(
                            status,
                            format!("HTTP error! status: {status}"),
                        )),
                    );
                    return;
                }
                Err(err) => {
                    warn!(%url, error = %err, "stream request failed");
                    finish(
                        &tx,
                        &task_control,
                        StreamUpdate::Failed(ApiError::network(err.to_string())),
                    );
                    return;
                }
            };
            pump(response.bytes_stream(), tx, task_control).await;
        });
        Self { updates, control }
    }

    /// Decodes an already open byte stream.
    pub fn from_byte_stream<S, B, E>(body: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, updates) = mpsc::unbounded_channel();
        let control = CancelHandle::new();
        tokio::spawn(pump(body, tx, control.clone()));
        Self { updates, control }
    }

    /// A stream that failed before it could start.
    pub fn failed(error: ApiError) -> Self {
        let (tx, updates) = mpsc::unbounded_channel();
        let control = CancelHandle::new();
        finish(&tx, &control, StreamUpdate::Failed(error));
        Self { updates, control }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.control.clone()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn state(&self) -> StreamState {
        self.control.state()
    }

    /// Next update, or `None` once the stream is over or cancelled.
    pub async fn recv(&mut self) -> Option<StreamUpdate> {
        if self.control.is_cancelled() {
            return None;
        }
        let update = tokio::select! {
            biased;
            _ = self.control.token.cancelled() => None,
            update = self.updates.recv() => update,
        };
        if self.control.is_cancelled() {
            return None;
        }
        update
    }

    /// Pushes every update into `listener` from a spawned task.
    pub fn subscribe<L: StreamListener>(mut self, mut listener: L) -> CancelHandle {
        let control = self.control.clone();
        tokio::spawn(async move {
            loop {
                let Some(update) = self.updates.recv().await else {
                    break;
                };
                if !deliver(&self.control, &mut listener, update) {
                    break;
                }
            }
        });
        control
    }

    /// Drains the stream into its concatenated content.
    pub async fn collect_content(mut self) -> Result<String, ApiError> {
        let mut content = String::new();
        while let Some(update) = self.recv().await {
            match update {
                StreamUpdate::Event(event) => content.push_str(&event.content),
                StreamUpdate::Completed => return Ok(content),
                StreamUpdate::Failed(err) => return Err(err),
            }
        }
        Ok(content)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // A handle moved into `subscribe` is dropped when delivery ends.
        if !self.control.state().is_finished() {
            self.control.cancel();
        }
    }
}

/// Runs one callback under the gate. Returns whether delivery continues.
fn deliver<L: StreamListener>(control: &CancelHandle, listener: &mut L, update: StreamUpdate) -> bool {
    let _gate = control.gate.lock();
    if control.is_cancelled() {
        return false;
    }
    match update {
        StreamUpdate::Event(event) => {
            listener.on_event(&event);
            true
        }
        StreamUpdate::Completed => {
            listener.on_complete();
            false
        }
        StreamUpdate::Failed(err) => {
            listener.on_error(&err);
            false
        }
    }
}

fn finish(tx: &mpsc::UnboundedSender<StreamUpdate>, control: &CancelHandle, update: StreamUpdate) {
    let state = match &update {
        StreamUpdate::Failed(_) => StreamState::Failed,
        _ => StreamState::Completed,
    };
    control.transition(state);
    let _ = tx.send(update);
}

async fn pump<S, B, E>(body: S, tx: mpsc::UnboundedSender<StreamUpdate>, control: CancelHandle)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    control.transition(StreamState::Streaming);
    let mut body = Box::pin(body);
    let mut decoder = FrameDecoder::new();

    loop {
        let next = tokio::select! {
            _ = control.token.cancelled() => return,
            next = body.next() => next,
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                warn!(error = %err, "stream read failed");
                finish(&tx, &control, StreamUpdate::Failed(ApiError::network(err.to_string())));
                return;
            }
            None => {
                if decoder.pending() > 0 {
                    debug!(bytes = decoder.pending(), "dropping incomplete trailing frame");
                }
                finish(&tx, &control, StreamUpdate::Completed);
                return;
            }
        };

        for decoded in decoder.push(chunk.as_ref()) {
            let event = match decoded {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "skipping malformed stream frame");
                    continue;
                }
            };
            let terminal = match event.error_message() {
                Some(message) => Some(StreamUpdate::Failed(ApiError::StreamTerminal(
                    message.to_string(),
                ))),
                None if event.done => Some(StreamUpdate::Completed),
                None => None,
            };
            if tx.send(StreamUpdate::Event(event)).is_err() {
                return;
            }
            if let Some(update) = terminal {
                finish(&tx, &control, update);
                return;
            }
        }
    }
}
