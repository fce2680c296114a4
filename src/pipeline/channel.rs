//! Bounded output channels between the worker and the display consumer.
//!
//! Each output kind has its own channel of [`CHANNEL_CAPACITY`] slots. A push
//! waits at most [`PUSH_TIMEOUT`]; if the consumer still has not made room,
//! the oldest queued item is evicted so the queue always ends with the most
//! recently produced frames. The worker never waits longer than the timeout.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use image::RgbImage;

pub const CHANNEL_CAPACITY: usize = 3;
pub const PUSH_TIMEOUT: Duration = Duration::from_millis(1);

/// The six image streams produced per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    ArComposite,
    Tooth,
    AxisFront,
    AxisTop,
    AxisSide,
    Debug,
}

impl OutputKind {
    pub const ALL: [OutputKind; 6] = [
        OutputKind::ArComposite,
        OutputKind::Tooth,
        OutputKind::AxisFront,
        OutputKind::AxisTop,
        OutputKind::AxisSide,
        OutputKind::Debug,
    ];

    pub fn index(self) -> usize {
        match self {
            OutputKind::ArComposite => 0,
            OutputKind::Tooth => 1,
            OutputKind::AxisFront => 2,
            OutputKind::AxisTop => 3,
            OutputKind::AxisSide => 4,
            OutputKind::Debug => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputKind::ArComposite => "ar_composite",
            OutputKind::Tooth => "tooth",
            OutputKind::AxisFront => "axis_front",
            OutputKind::AxisTop => "axis_top",
            OutputKind::AxisSide => "axis_side",
            OutputKind::Debug => "debug",
        }
    }
}

/// What happened to a pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after dropping the oldest item.
    EvictedOldest,
    /// The queue refilled between eviction and retry; the new item was dropped.
    Dropped,
}

/// Single-producer bounded channel that keeps the newest items.
pub struct FrameChannel<T> {
    tx: Sender<T>,
    /// Producer-side handle used only for eviction.
    rx: Receiver<T>,
}

impl<T> Default for FrameChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameChannel<T> {
    pub fn new() -> Self {
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        Self { tx, rx }
    }

    /// A consumer handle. Consumers only ever receive.
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let item = match self.tx.send_timeout(item, PUSH_TIMEOUT) {
            Ok(()) => return PushOutcome::Queued,
            Err(SendTimeoutError::Timeout(item)) | Err(SendTimeoutError::Disconnected(item)) => item,
        };
        let _ = self.rx.try_recv();
        match self.tx.try_send(item) {
            Ok(()) => PushOutcome::EvictedOldest,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => PushOutcome::Dropped,
        }
    }

    /// Drain everything queued and return the newest item.
    pub fn latest(&self) -> Option<T> {
        self.rx.try_iter().last()
    }
}

/// One channel per [`OutputKind`].
pub struct OutputChannels {
    channels: [FrameChannel<RgbImage>; 6],
}

impl Default for OutputChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputChannels {
    pub fn new() -> Self {
        Self {
            channels: std::array::from_fn(|_| FrameChannel::new()),
        }
    }

    pub fn channel(&self, kind: OutputKind) -> &FrameChannel<RgbImage> {
        &self.channels[kind.index()]
    }

    pub fn push(&self, kind: OutputKind, image: RgbImage) -> PushOutcome {
        self.channel(kind).push(image)
    }

    pub fn receiver(&self, kind: OutputKind) -> Receiver<RgbImage> {
        self.channel(kind).receiver()
    }

    /// Newest image of `kind`, or `None` if nothing arrived since the last poll.
    pub fn latest(&self, kind: OutputKind) -> Option<RgbImage> {
        self.channel(kind).latest()
    }
}
