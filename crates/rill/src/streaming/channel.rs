use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};

use super::destination::Destination;
use crate::error::RillError;
use crate::render::SignalSender;

pub type StreamItem = Result<Bytes, RillError>;

#[derive(Debug, Default)]
struct Backlog {
    items: VecDeque<StreamItem>,
    draining: bool,
}

/// Sink over a bounded tokio channel. A full channel is reported as
/// backpressure; the refused chunk is kept and sent by a background task,
/// which reports a drain once the backlog is empty.
#[derive(Debug)]
pub struct ChannelDestination {
    sender: Option<mpsc::Sender<StreamItem>>,
    backlog: Arc<Mutex<Backlog>>,
    events: Option<SignalSender>,
}

impl ChannelDestination {
    pub fn new(sender: mpsc::Sender<StreamItem>) -> Self {
        Self { sender: Some(sender), backlog: Arc::new(Mutex::new(Backlog::default())), events: None }
    }

    fn send(&mut self, item: StreamItem) -> bool {
        let Some(sender) = self.sender.clone() else {
            return false;
        };

        let mut backlog = self.backlog.lock();
        if backlog.draining {
            backlog.items.push_back(item);
            return false;
        }

        match sender.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(item)) => {
                backlog.items.push_back(item);
                backlog.draining = true;
                drop(backlog);
                self.spawn_drain(sender);
                false
            }
            Err(TrySendError::Closed(_)) => {
                drop(backlog);
                debug!("Stream receiver went away");
                self.sender = None;
                if let Some(events) = &self.events {
                    events.close();
                }
                false
            }
        }
    }

    fn spawn_drain(&self, sender: mpsc::Sender<StreamItem>) {
        let backlog = Arc::clone(&self.backlog);
        let events = self.events.clone();

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drain_backlog(sender, backlog, events));
            }
            Err(e) => error!("Cannot drain the channel destination outside a tokio runtime: {}", e),
        }
    }
}

async fn drain_backlog(
    sender: mpsc::Sender<StreamItem>,
    backlog: Arc<Mutex<Backlog>>,
    events: Option<SignalSender>,
) {
    loop {
        let next = {
            let mut backlog = backlog.lock();
            match backlog.items.pop_front() {
                Some(item) => item,
                None => {
                    backlog.draining = false;
                    break;
                }
            }
        };

        if sender.send(next).await.is_err() {
            debug!("Stream receiver went away while draining");
            if let Some(events) = &events {
                events.close();
            }
            return;
        }
    }

    if let Some(events) = events {
        events.drain();
    }
}

impl Destination for ChannelDestination {
    fn bind(&mut self, events: SignalSender) {
        self.events = Some(events);
    }

    fn write(&mut self, chunk: Bytes) -> bool {
        self.send(Ok(chunk))
    }

    fn close(&mut self) {
        if self.sender.take().is_some() {
            debug!("Channel destination closed");
        }
    }

    fn close_with_error(&mut self, error: &RillError) {
        self.send(Err(error.clone()));
        self.sender = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{Signal, signal_channel};
    use crate::streaming::DestinationEvent;

    #[tokio::test]
    async fn test_full_channel_reports_backpressure_then_drain() {
        let (sender, mut receiver) = mpsc::channel(1);
        let (events, mut signals) = signal_channel();
        let mut destination = ChannelDestination::new(sender);
        destination.bind(events);

        assert!(destination.write(Bytes::from_static(b"a")));
        assert!(!destination.write(Bytes::from_static(b"b")));

        assert_eq!(receiver.recv().await.expect("a").expect("ok"), Bytes::from_static(b"a"));
        assert_eq!(receiver.recv().await.expect("b").expect("ok"), Bytes::from_static(b"b"));

        assert!(matches!(
            signals.recv().await,
            Some(Signal::Destination { event: DestinationEvent::Drain, .. })
        ));
        assert!(destination.write(Bytes::from_static(b"c")));
    }

    #[tokio::test]
    async fn test_dropped_receiver_reports_close() {
        let (sender, receiver) = mpsc::channel(4);
        let (events, mut signals) = signal_channel();
        let mut destination = ChannelDestination::new(sender);
        destination.bind(events);
        drop(receiver);

        assert!(!destination.write(Bytes::from_static(b"lost")));
        assert!(matches!(
            signals.recv().await,
            Some(Signal::Destination { event: DestinationEvent::Close, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_with_error_is_delivered() {
        let (sender, mut receiver) = mpsc::channel(4);
        let mut destination = ChannelDestination::new(sender);

        destination.close_with_error(&RillError::render("failed"));

        let item = receiver.recv().await.expect("item");
        assert_eq!(item.expect_err("error").message(), "failed");
        assert!(receiver.recv().await.is_none());
    }
}
