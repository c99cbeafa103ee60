use tokio::sync::mpsc;

use super::dependency::DependencyId;
use crate::error::RillError;
use crate::streaming::DestinationEvent;

/// Everything that can wake a Request from the outside. Dependency
/// settlement and sink events share one ordered queue so the Request never
/// sees them concurrently.
#[derive(Debug, Clone)]
pub enum Signal {
    Ping(DependencyId),
    /// `attachment` identifies the `start_flowing` call the sink was bound
    /// by; events from earlier attachments are dropped.
    Destination { attachment: u64, event: DestinationEvent },
}

#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Signal>,
    attachment: u64,
}

pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx, attachment: 0 }, rx)
}

impl SignalSender {
    /// A sender whose sink events are tagged with `attachment`.
    pub(crate) fn for_attachment(&self, attachment: u64) -> Self {
        Self { tx: self.tx.clone(), attachment }
    }

    pub fn attachment(&self) -> u64 {
        self.attachment
    }

    pub fn ping(&self, dependency: DependencyId) -> bool {
        self.tx.send(Signal::Ping(dependency)).is_ok()
    }

    pub fn drain(&self) -> bool {
        self.send_event(DestinationEvent::Drain)
    }

    pub fn error(&self, error: RillError) -> bool {
        self.send_event(DestinationEvent::Error(error))
    }

    pub fn close(&self) -> bool {
        self.send_event(DestinationEvent::Close)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send_event(&self, event: DestinationEvent) -> bool {
        self.tx.send(Signal::Destination { attachment: self.attachment, event }).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_events_carry_attachment() {
        let (sender, mut receiver) = signal_channel();
        let bound = sender.for_attachment(3);

        assert!(bound.drain());
        assert!(sender.close());
        assert!(bound.ping(9));

        assert!(matches!(
            receiver.try_recv(),
            Ok(Signal::Destination { attachment: 3, event: DestinationEvent::Drain })
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(Signal::Destination { attachment: 0, event: DestinationEvent::Close })
        ));
        assert!(matches!(receiver.try_recv(), Ok(Signal::Ping(9))));
    }
}
