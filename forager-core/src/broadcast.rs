use tokio::sync::broadcast;

use crate::events::PipelineEvent;

/// Lightweight in-process fan-out of pipeline output and status events to
/// however many live observers are attached. Publishing never blocks and
/// never fails: with no subscribers the event is dropped, and a subscriber
/// that falls behind lags on its own receiver instead of back-pressuring the
/// pipeline. There is no replay; the run record's cumulative output is the
/// resync mechanism for late joiners.
#[derive(Clone, Debug)]
pub struct OutputBroadcaster {
    sender: broadcast::Sender<PipelineEvent>,
}

impl OutputBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Attach a new observer. It only sees events published after this call;
    /// dropping the receiver detaches it.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
