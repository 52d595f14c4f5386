//! A frame source fed by the embedding application.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use crate::error::CaptureError;
use crate::frame::{RawBodySample, SampleBatch};
use crate::{CaptureResult, FrameSource, SAMPLE_CHANNEL_CAPACITY};

/// Frame source whose samples are pushed through a [`SampleFeed`].
///
/// This is the seam for a platform tracker: its per-update callback calls
/// [`SampleFeed::push`] with every body anchor it saw.
pub struct ChannelSource {
    receiver: Receiver<SampleBatch>,
    is_active: Arc<AtomicBool>,
    supported: bool,
}

/// Producer half of a [`ChannelSource`].
#[derive(Clone)]
pub struct SampleFeed {
    sender: Sender<SampleBatch>,
    sequence: Arc<AtomicU64>,
    is_active: Arc<AtomicBool>,
}

impl ChannelSource {
    /// Create a source and the feed that drives it.
    pub fn new() -> (Self, SampleFeed) {
        let (sender, receiver) = crossbeam_channel::bounded(SAMPLE_CHANNEL_CAPACITY);
        let is_active = Arc::new(AtomicBool::new(false));

        let source = Self {
            receiver,
            is_active: Arc::clone(&is_active),
            supported: true,
        };
        let feed = SampleFeed {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
            is_active,
        };

        (source, feed)
    }

    /// Override whether the hardware reports body-tracking support.
    pub fn with_supported(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }
}

impl FrameSource for ChannelSource {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn start(&mut self) -> CaptureResult<Receiver<SampleBatch>> {
        if !self.supported {
            return Err(CaptureError::UnsupportedDevice);
        }
        if self.is_active.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyStarted);
        }
        debug!("Channel source started");
        Ok(self.receiver.clone())
    }

    fn stop(&mut self) -> CaptureResult<()> {
        if !self.is_active.swap(false, Ordering::SeqCst) {
            return Err(CaptureError::NotStarted);
        }
        debug!("Channel source stopped");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

impl SampleFeed {
    /// Push every body reported by one tracker update.
    ///
    /// Never blocks the tracker: a full queue drops the batch.
    pub fn push(&self, samples: Vec<RawBodySample>) -> CaptureResult<u64> {
        if !self.is_active.load(Ordering::SeqCst) {
            return Err(CaptureError::NotStarted);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(SampleBatch::new(samples, sequence)) {
            Ok(()) => {
                trace!(sequence, "Sample batch queued");
                Ok(sequence)
            }
            Err(TrySendError::Full(_)) => Err(CaptureError::BatchDropped),
            Err(TrySendError::Disconnected(_)) => Err(CaptureError::ChannelDisconnected),
        }
    }
}
