use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RillError;
use crate::render::SignalSender;

/// Flow-control events a sink reports back to the Request that writes to it.
#[derive(Debug, Clone)]
pub enum DestinationEvent {
    Drain,
    Error(RillError),
    Close,
}

/// The only place bytes leave a Request.
///
/// `write` returns whether more may be written right away. After it returns
/// false the Request writes nothing until the sink reports
/// [`DestinationEvent::Drain`] through the sender it was bound to.
pub trait Destination: Send {
    fn bind(&mut self, _events: SignalSender) {}

    fn write(&mut self, chunk: Bytes) -> bool;

    fn close(&mut self);

    fn close_with_error(&mut self, error: &RillError);
}

#[derive(Debug, Default)]
struct MemoryState {
    chunks: Vec<Bytes>,
    budget: Option<usize>,
    blocked: bool,
    writes_while_blocked: usize,
    closed: bool,
    error: Option<RillError>,
    events: Option<SignalSender>,
}

/// In-memory sink with scriptable backpressure.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<MemoryState>>,
}

/// Observer half of a [`MemoryDestination`]; stays usable after the sink was
/// handed to a Request.
#[derive(Debug, Clone)]
pub struct MemoryProbe {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDestination {
    pub fn new() -> (Self, MemoryProbe) {
        Self::build(None)
    }

    /// Accepts `budget` writes with `true`; the next write is still recorded
    /// but reports backpressure.
    pub fn with_budget(budget: usize) -> (Self, MemoryProbe) {
        Self::build(Some(budget))
    }

    fn build(budget: Option<usize>) -> (Self, MemoryProbe) {
        let state = Arc::new(Mutex::new(MemoryState { budget, ..MemoryState::default() }));
        (Self { state: Arc::clone(&state) }, MemoryProbe { state })
    }
}

impl Destination for MemoryDestination {
    fn bind(&mut self, events: SignalSender) {
        self.state.lock().events = Some(events);
    }

    fn write(&mut self, chunk: Bytes) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            warn!("Write of {} bytes after the memory destination closed", chunk.len());
            return false;
        }
        if state.blocked {
            state.writes_while_blocked += 1;
        }
        state.chunks.push(chunk);

        match state.budget {
            None => true,
            Some(0) => {
                state.blocked = true;
                false
            }
            Some(remaining) => {
                state.budget = Some(remaining - 1);
                true
            }
        }
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }

    fn close_with_error(&mut self, error: &RillError) {
        let mut state = self.state.lock();
        state.closed = true;
        state.error = Some(error.clone());
    }
}

impl MemoryProbe {
    pub fn chunks(&self) -> Vec<Bytes> {
        self.state.lock().chunks.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn text(&self) -> String {
        let state = self.state.lock();
        let bytes: Vec<u8> = state.chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    pub fn writes_while_blocked(&self) -> usize {
        self.state.lock().writes_while_blocked
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn error(&self) -> Option<RillError> {
        self.state.lock().error.clone()
    }

    /// Lifts backpressure and reports a drain. `None` removes the budget.
    pub fn release(&self, budget: Option<usize>) -> bool {
        let events = {
            let mut state = self.state.lock();
            state.budget = budget;
            state.blocked = false;
            state.events.clone()
        };
        events.is_some_and(|events| events.drain())
    }

    pub fn emit_error(&self, error: RillError) -> bool {
        let events = self.state.lock().events.clone();
        events.is_some_and(|events| events.error(error))
    }

    pub fn emit_close(&self) -> bool {
        let events = self.state.lock().events.clone();
        events.is_some_and(|events| events.close())
    }
}

/// Blocking writer sink. Never reports backpressure.
pub struct IoDestination<W: Write + Send> {
    writer: W,
    failed: bool,
    events: Option<SignalSender>,
}

impl<W: Write + Send> IoDestination<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, failed: false, events: None }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Destination for IoDestination<W> {
    fn bind(&mut self, events: SignalSender) {
        self.events = Some(events);
    }

    fn write(&mut self, chunk: Bytes) -> bool {
        if self.failed {
            return false;
        }

        if let Err(e) = self.writer.write_all(&chunk) {
            warn!("Failed to write {} bytes: {}", chunk.len(), e);
            self.failed = true;
            if let Some(events) = &self.events {
                events.error(RillError::from(e));
            }
            return false;
        }

        true
    }

    fn close(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush output: {}", e);
        }
        debug!("Output closed");
    }

    fn close_with_error(&mut self, error: &RillError) {
        warn!("Output closed with error: {}", error);
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{Signal, signal_channel};

    #[test]
    fn test_memory_destination_budget() {
        let (mut destination, probe) = MemoryDestination::with_budget(1);

        assert!(destination.write(Bytes::from_static(b"a")));
        assert!(!destination.write(Bytes::from_static(b"b")));
        assert!(probe.is_blocked());

        assert!(!destination.write(Bytes::from_static(b"c")));
        assert_eq!(probe.writes_while_blocked(), 1);
        assert_eq!(probe.text(), "abc");
    }

    #[test]
    fn test_release_sends_drain() {
        let (mut destination, probe) = MemoryDestination::with_budget(0);
        let (sender, mut receiver) = signal_channel();
        destination.bind(sender);

        assert!(!destination.write(Bytes::from_static(b"x")));
        assert!(probe.release(None));
        assert!(!probe.is_blocked());
        assert!(destination.write(Bytes::from_static(b"y")));

        assert!(matches!(
            receiver.try_recv(),
            Ok(Signal::Destination { event: DestinationEvent::Drain, .. })
        ));
    }

    #[test]
    fn test_unbound_probe_cannot_signal() {
        let (_destination, probe) = MemoryDestination::new();
        assert!(!probe.emit_close());
        assert!(!probe.release(None));
    }

    #[test]
    fn test_close_with_error_is_recorded() {
        let (mut destination, probe) = MemoryDestination::new();
        destination.close_with_error(&RillError::aborted("timeout"));

        assert!(probe.is_closed());
        assert_eq!(probe.error().map(|e| e.message()), Some("timeout".to_string()));
        assert!(!destination.write(Bytes::from_static(b"late")));
    }

    #[test]
    fn test_io_destination_writes_through() {
        let mut destination = IoDestination::new(Vec::new());
        assert!(destination.write(Bytes::from_static(b"hello ")));
        assert!(destination.write(Bytes::from_static(b"world")));
        destination.close();

        assert_eq!(destination.into_inner(), b"hello world");
    }
}
