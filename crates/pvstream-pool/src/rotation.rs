//! Fixed pool of frame buffers cycling between a capture device and a consumer.
//!
//! # Buffer flow
//!
//! ```text
//!            submit_all / recycle / drain_remaining
//!   idle ────────────────────────────────────────────▶ device (Queued)
//!    ▲  ▲                                                   │
//!    │  │ rejected ─▶ retry FIFO ─┐                         │ CompletionHandle::complete
//!    │  │                         └─▶ (next completion) ────┤
//!    │  └── cancelled / stale / faulted ◀────────────────────┤
//!    │                                                       ▼
//!    └──── recycle ◀── consumer ◀── consume_latest ◀── completed stack (LIFO)
//! ```
//!
//! Buffers are moved, never shared: a buffer queued on the device is owned by
//! the device, so it cannot be submitted twice. The slot table mirrors where
//! each buffer is so [`RotationBuffer::counts`] always adds up to the pool size.
//!
//! # Threading
//!
//! Completions arrive on the device's notification thread. They, together with
//! `consume_latest` and `recycle`, only touch state behind one `parking_lot`
//! mutex which is never held while calling into the device. `initialize`,
//! `submit_all` and `shutdown` are control operations and must be serialized by
//! the caller.

use crate::device::CaptureDevice;
use crate::device::Rejection;
use crate::error::{RotationError, RotationResult};
use crate::frame::{FrameBuffer, FrameId, FrameState, FrameStatus};
use crate::queue::RotationQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::TryReserveError;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Default number of buffers in rotation.
pub const DEFAULT_BUFFER_COUNT: usize = 4;

/// Default bound on how long `shutdown` waits for the device to return buffers.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval at which `shutdown` re-issues the cancel request while waiting.
const CANCEL_RETRY_INTERVAL: Duration = Duration::from_millis(50);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Tuning for a [`RotationBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    /// Buffers a streaming session allocates.
    pub buffer_count: usize,
    /// On every successful completion, re-submit the oldest buffer waiting in
    /// the retry queue.
    pub resubmit_on_completion: bool,
    /// Upper bound on the wait for outstanding buffers in `shutdown`.
    pub shutdown_timeout: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            resubmit_on_completion: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Where a slot's buffer currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Retry,
    Queued,
    Completed,
    Consumer,
}

impl Slot {
    fn state(self) -> FrameState {
        match self {
            Slot::Idle | Slot::Retry => FrameState::Free,
            Slot::Queued => FrameState::Queued,
            Slot::Completed | Slot::Consumer => FrameState::Completed,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Slot::Idle => "idle",
            Slot::Retry => "waiting for retry",
            Slot::Queued => "queued",
            Slot::Completed => "completed",
            Slot::Consumer => "held by consumer",
        }
    }
}

/// Number of buffers in each lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Idle or waiting in the retry queue.
    pub free: usize,
    /// Owned by the device.
    pub queued: usize,
    /// Waiting for the consumer or held by it.
    pub completed: usize,
}

impl StateCounts {
    /// Sum over all states; always the pool size.
    #[must_use]
    pub fn total(&self) -> usize {
        self.free + self.queued + self.completed
    }
}

/// Cumulative counters since the rotation buffer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationStats {
    /// Buffers accepted by the device.
    pub submitted: u64,
    /// Completions forwarded to the consumer.
    pub completed: u64,
    /// Buffers taken by the consumer.
    pub consumed: u64,
    /// Completed frames re-submitted without being consumed.
    pub dropped: u64,
    /// Submissions the device refused.
    pub rejected: u64,
    /// Completions absorbed as cancelled or stale.
    pub cancelled: u64,
    /// Completions reporting a device fault.
    pub faults: u64,
    /// Consumer wake-ups issued.
    pub wakeups: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    faults: AtomicU64,
    wakeups: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RotationStats {
        RotationStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    /// Per slot: the device refused this buffer since it last completed.
    refused: Vec<bool>,
    idle: Vec<FrameBuffer>,
    queue: RotationQueue,
    queued: usize,
    capacity: usize,
    /// Bumped by every shutdown; completions stamped with an older value are stale.
    generation: u64,
    shutting_down: bool,
    /// Set by shutdown, cleared by the next `submit_all`.
    stopped: bool,
    fault: Option<FrameStatus>,
    /// Only the first fault of a session is surfaced.
    fault_latched: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            refused: Vec::new(),
            idle: Vec::new(),
            queue: RotationQueue::default(),
            queued: 0,
            capacity: 0,
            generation: 0,
            shutting_down: false,
            stopped: false,
            fault: None,
            fault_latched: false,
        }
    }

    fn accepting(&self) -> bool {
        !self.shutting_down && !self.stopped
    }

    fn mark_queued(&mut self, id: FrameId) {
        self.slots[id.index()] = Slot::Queued;
        self.queued += 1;
    }

    /// The device gave a queued buffer back.
    fn unqueue(&mut self) {
        self.queued = self.queued.saturating_sub(1);
    }

    fn park_idle(&mut self, mut frame: FrameBuffer) {
        frame.reset();
        if let Some(slot) = self.slots.get_mut(frame.id().index()) {
            *slot = Slot::Idle;
        }
        self.clear_refused(frame.id());
        self.idle.push(frame);
    }

    /// Flag a refusal of `id`. Returns whether it was already flagged.
    fn note_refused(&mut self, id: FrameId) -> bool {
        self.refused
            .get_mut(id.index())
            .map(|flag| std::mem::replace(flag, true))
            .unwrap_or(false)
    }

    fn clear_refused(&mut self, id: FrameId) {
        if let Some(flag) = self.refused.get_mut(id.index()) {
            *flag = false;
        }
    }

    fn park_retry(&mut self, frame: FrameBuffer) {
        self.slots[frame.id().index()] = Slot::Retry;
        self.queue.bury(frame);
    }

    fn record_fault(&mut self, status: FrameStatus) -> bool {
        if self.fault_latched {
            return false;
        }
        self.fault = Some(status);
        self.fault_latched = true;
        true
    }

    fn counts(&self) -> StateCounts {
        self.slots
            .iter()
            .fold(StateCounts::default(), |mut counts, slot| {
                match slot.state() {
                    FrameState::Free => counts.free += 1,
                    FrameState::Queued => counts.queued += 1,
                    FrameState::Completed => counts.completed += 1,
                }
                counts
            })
    }
}

struct Shared {
    pool_id: u64,
    inner: Mutex<Inner>,
    /// Signalled whenever the queued count drops to zero.
    settled: Condvar,
    /// Consumer wake-up, one permit per forwarded completion.
    ready: Notify,
    counters: Counters,
    config: RotationConfig,
    device: Weak<dyn CaptureDevice>,
}

impl Shared {
    fn wake(&self) {
        Counters::bump(&self.counters.wakeups, 1);
        self.ready.notify_one();
    }

    fn notify_if_settled(&self, inner: &Inner) {
        if inner.queued == 0 {
            self.settled.notify_all();
        }
    }

    /// Hand buffers already marked `Queued` to the device. Returns how many it accepted.
    fn dispatch(self: &Arc<Self>, frames: Vec<FrameBuffer>, generation: u64) -> usize {
        frames
            .into_iter()
            .map(|frame| self.submit(frame, generation))
            .filter(Result::is_ok)
            .count()
    }

    /// Queue one buffer already marked `Queued` in the slot table.
    fn submit(self: &Arc<Self>, frame: FrameBuffer, generation: u64) -> Result<(), FrameStatus> {
        let Some(device) = self.device.upgrade() else {
            let mut inner = self.inner.lock();
            inner.unqueue();
            inner.park_idle(frame);
            self.notify_if_settled(&inner);
            return Err(FrameStatus::BadHandle);
        };

        let id = frame.id();
        let completion = CompletionHandle {
            shared: Arc::clone(self),
            generation,
        };
        match device.queue(frame, completion) {
            Ok(()) => {
                Counters::bump(&self.counters.submitted, 1);
                debug!(frame = %id, "buffer queued on capture device");
                Ok(())
            }
            Err(Rejection { buffer, status }) => {
                self.absorb_rejection(buffer, status);
                Err(status)
            }
        }
    }

    fn absorb_rejection(&self, frame: FrameBuffer, status: FrameStatus) {
        Counters::bump(&self.counters.rejected, 1);
        let id = frame.id();

        let mut inner = self.inner.lock();
        inner.unqueue();
        let repeated = inner.note_refused(id);
        let newly_faulted = status.is_device_fault() && inner.record_fault(status);
        if inner.accepting() {
            inner.park_retry(frame);
        } else {
            inner.park_idle(frame);
        }
        self.notify_if_settled(&inner);
        drop(inner);

        if repeated {
            debug!(frame = %id, %status, "capture device rejected buffer again");
        } else {
            warn!(frame = %id, %status, "capture device rejected buffer, deferred to retry queue");
        }
        if newly_faulted {
            error!(%status, "capture device fault while queuing buffer");
            self.wake();
        }
    }

    fn recycle_buffer(self: &Arc<Self>, mut frame: FrameBuffer) -> RotationResult<()> {
        let id = frame.id();
        let mut inner = self.inner.lock();

        match inner.slots.get(id.index()).copied() {
            Some(Slot::Consumer) => {}
            Some(slot) => {
                inner.park_idle(frame);
                return Err(RotationError::InvalidState {
                    id,
                    state: slot.name(),
                });
            }
            None => return Err(RotationError::UnknownBuffer(id)),
        }

        frame.reset();
        if frame.capacity() < inner.capacity {
            let capacity = inner.capacity;
            if let Err(err) = frame.reallocate(capacity) {
                inner.park_idle(frame);
                return Err(RotationError::Allocation {
                    count: 1,
                    capacity,
                    reason: err.to_string(),
                });
            }
        }

        if !inner.accepting() {
            debug!(frame = %id, "rotation stopped, parking recycled buffer");
            inner.park_idle(frame);
            return Ok(());
        }

        inner.mark_queued(id);
        let generation = inner.generation;
        drop(inner);

        self.submit(frame, generation)
            .map_err(RotationError::SubmissionRejected)
    }
}

/// Ticket a capture device uses to hand a buffer back.
///
/// One handle travels with every queued buffer. Cloning is cheap; the handle
/// remembers which session queued the buffer so late completions after a
/// shutdown are absorbed.
#[derive(Clone)]
pub struct CompletionHandle {
    shared: Arc<Shared>,
    generation: u64,
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("pool_id", &self.shared.pool_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl CompletionHandle {
    /// Return a buffer whose capture finished, with status and metadata set.
    ///
    /// Callable from any thread. Successful or incomplete frames go on the
    /// fresh end of the completed stack and wake the consumer once. Cancelled
    /// or stale buffers go straight back to the free pool. A device fault is
    /// latched for the consumer to observe.
    pub fn complete(self, frame: FrameBuffer) {
        let shared = &self.shared;
        let id = frame.id();
        let status = frame.status();

        if frame.owner != shared.pool_id {
            warn!(frame = %id, "completion for a buffer of another rotation buffer ignored");
            return;
        }

        let mut inner = shared.inner.lock();
        if inner.slots.get(id.index()) != Some(&Slot::Queued) {
            warn!(frame = %id, "completion for a buffer that was not queued");
            inner.park_idle(frame);
            return;
        }
        inner.unqueue();

        let current = inner.accepting() && inner.generation == self.generation;
        let mut wake = false;
        let mut fault = None;
        let mut retry = None;

        if !current || status.is_cancelled() {
            Counters::bump(&shared.counters.cancelled, 1);
            inner.park_idle(frame);
        } else if status.is_device_fault() {
            Counters::bump(&shared.counters.faults, 1);
            inner.park_idle(frame);
            if inner.record_fault(status) {
                wake = true;
                fault = Some(status);
            }
        } else {
            Counters::bump(&shared.counters.completed, 1);
            inner.slots[id.index()] = Slot::Completed;
            inner.clear_refused(id);
            inner.queue.push_completed(frame);
            wake = true;

            if shared.config.resubmit_on_completion {
                if let Some(next) = inner.queue.pull_oldest() {
                    inner.mark_queued(next.id());
                    retry = Some(next);
                }
            }
        }
        shared.notify_if_settled(&inner);
        drop(inner);

        debug!(frame = %id, %status, forwarded = wake, "buffer completed");
        if let Some(status) = fault {
            error!(frame = %id, %status, "capture device fault reported on completion");
        }
        if wake {
            shared.wake();
        }
        if let Some(next) = retry {
            let _ = shared.submit(next, self.generation);
        }
    }
}

/// A completed buffer lent to the consumer.
///
/// Hand it back with [`RotationBuffer::recycle`]. Dropping it recycles it as well.
pub struct ConsumedFrame {
    frame: Option<FrameBuffer>,
    shared: Arc<Shared>,
}

impl ConsumedFrame {
    fn take(mut self) -> FrameBuffer {
        // Only a recycled loan is ever emptied, and that consumes it.
        match self.frame.take() {
            Some(frame) => frame,
            None => unreachable!("consumed frame emptied before recycle"),
        }
    }
}

impl Deref for ConsumedFrame {
    type Target = FrameBuffer;

    fn deref(&self) -> &Self::Target {
        match self.frame.as_ref() {
            Some(frame) => frame,
            None => unreachable!("consumed frame emptied before recycle"),
        }
    }
}

impl std::fmt::Debug for ConsumedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumedFrame")
            .field("frame", &self.frame)
            .finish()
    }
}

impl Drop for ConsumedFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            if let Err(err) = self.shared.recycle_buffer(frame) {
                debug!(error = %err, "implicit recycle of dropped frame did not requeue it");
            }
        }
    }
}

/// Fixed-size pool of frame buffers kept cycling through a capture device.
pub struct RotationBuffer {
    shared: Arc<Shared>,
    device: Arc<dyn CaptureDevice>,
}

impl RotationBuffer {
    /// Create an empty rotation buffer bound to `device`. Call
    /// [`initialize`](Self::initialize) before submitting.
    pub fn new<D: CaptureDevice + 'static>(device: Arc<D>, config: RotationConfig) -> Self {
        let device: Arc<dyn CaptureDevice> = device;
        let shared = Arc::new(Shared {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(Inner::new()),
            settled: Condvar::new(),
            ready: Notify::new(),
            counters: Counters::default(),
            config,
            device: Arc::downgrade(&device),
        });
        Self { shared, device }
    }

    /// The configuration this buffer was created with.
    #[must_use]
    pub fn config(&self) -> &RotationConfig {
        &self.shared.config
    }

    /// The capture device buffers are submitted to.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn CaptureDevice> {
        &self.device
    }

    /// Allocate `count` buffers of `capacity` bytes, or grow existing ones.
    ///
    /// Buffers smaller than `capacity` are reallocated, larger ones are left
    /// alone and missing slots are appended. The pool never shrinks. Buffers
    /// waiting for the consumer are reclaimed first; a buffer the consumer still
    /// holds is grown when it is recycled.
    pub fn initialize(&self, count: usize, capacity: usize) -> RotationResult<()> {
        let alloc_error = |err: TryReserveError| RotationError::Allocation {
            count,
            capacity,
            reason: err.to_string(),
        };
        if count == 0 || capacity == 0 {
            return Err(RotationError::Allocation {
                count,
                capacity,
                reason: "buffer count and capacity must be non-zero".into(),
            });
        }

        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.queued > 0 {
            return Err(RotationError::BuffersInFlight {
                queued: inner.queued,
            });
        }

        let completed: Vec<FrameBuffer> = inner.queue.drain_completed().collect();
        for frame in completed {
            inner.park_idle(frame);
        }

        let mut reallocated = 0usize;
        for frame in inner.idle.iter_mut().chain(inner.queue.retry_iter_mut()) {
            if frame.capacity() < capacity {
                frame.reallocate(capacity).map_err(alloc_error)?;
                reallocated += 1;
            }
        }

        let existing = inner.slots.len();
        if count < existing {
            warn!(
                requested = count,
                existing, "rotation buffer does not shrink, keeping existing buffers"
            );
        }
        for index in existing..count {
            let frame = FrameBuffer::allocate(self.shared.pool_id, FrameId(index), capacity)
                .map_err(alloc_error)?;
            inner.slots.push(Slot::Idle);
            inner.refused.push(false);
            inner.idle.push(frame);
        }
        inner.capacity = capacity;

        let total = inner.slots.len();
        info!(
            count = total,
            capacity,
            reallocated,
            total_mb = (total * capacity) as f64 / (1024.0 * 1024.0),
            "Rotation buffer initialized"
        );
        Ok(())
    }

    /// Allocate `count` buffers sized to the device's current bytes per
    /// frame. Returns that size.
    pub fn initialize_from_device(&self, count: usize) -> RotationResult<usize> {
        let capacity = self
            .device
            .bytes_per_frame()
            .map_err(RotationError::DeviceFault)?;
        self.initialize(count, capacity)?;
        Ok(capacity)
    }

    /// Hand every idle buffer to the device. Returns how many were accepted.
    ///
    /// Rejected buffers wait in the retry queue for
    /// [`drain_remaining`](Self::drain_remaining). After a shutdown this starts
    /// a new session.
    pub fn submit_all(&self) -> RotationResult<usize> {
        let mut inner = self.shared.inner.lock();
        if inner.slots.is_empty() {
            return Err(RotationError::NotInitialized);
        }
        if inner.stopped {
            inner.stopped = false;
            inner.fault = None;
            inner.fault_latched = false;
            debug!(generation = inner.generation, "starting new rotation session");
        }

        let frames = std::mem::take(&mut inner.idle);
        for frame in &frames {
            inner.mark_queued(frame.id());
        }
        let generation = inner.generation;
        let total = inner.slots.len();
        drop(inner);

        let offered = frames.len();
        let accepted = self.shared.dispatch(frames, generation);
        info!(accepted, offered, total, "Submitted buffers to capture device");
        Ok(accepted)
    }

    /// Take the most recently completed buffer, if any.
    ///
    /// A latched device fault is returned once, before any pending frame.
    pub fn consume_latest(&self) -> RotationResult<Option<ConsumedFrame>> {
        let mut inner = self.shared.inner.lock();
        if let Some(status) = inner.fault.take() {
            return Err(RotationError::DeviceFault(status));
        }
        let Some(frame) = inner.queue.pop_latest() else {
            return Ok(None);
        };
        inner.slots[frame.id().index()] = Slot::Consumer;
        drop(inner);

        Counters::bump(&self.shared.counters.consumed, 1);
        Ok(Some(ConsumedFrame {
            frame: Some(frame),
            shared: Arc::clone(&self.shared),
        }))
    }

    /// Like [`consume_latest`](Self::consume_latest), but waits up to
    /// `timeout` for a completion.
    pub async fn consume_latest_timeout(
        &self,
        timeout: Duration,
    ) -> RotationResult<Option<ConsumedFrame>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.ready.notified();
            if let Some(frame) = self.consume_latest()? {
                return Ok(Some(frame));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Future resolving at the next consumer wake-up.
    pub fn notified(&self) -> Notified<'_> {
        self.shared.ready.notified()
    }

    /// Give a consumed buffer back and re-submit it immediately.
    ///
    /// If the device refuses it the buffer waits in the retry queue and
    /// `SubmissionRejected` is returned. After a shutdown the buffer is only
    /// parked.
    pub fn recycle(&self, frame: ConsumedFrame) -> RotationResult<()> {
        if !Arc::ptr_eq(&frame.shared, &self.shared) {
            // Dropping the loan returns it to its own pool.
            return Err(RotationError::UnknownBuffer(frame.id()));
        }
        let buffer = frame.take();
        self.shared.recycle_buffer(buffer)
    }

    /// Re-submit every other completed buffer still waiting for the consumer.
    ///
    /// These frames are older than the one just consumed and are dropped.
    /// Returns how many the device accepted.
    pub fn recycle_stale(&self) -> usize {
        let mut inner = self.shared.inner.lock();
        if !inner.accepting() || inner.queue.pending() == 0 {
            return 0;
        }
        let mut stale: Vec<FrameBuffer> = inner.queue.drain_completed().collect();
        for frame in &mut stale {
            frame.reset();
            inner.mark_queued(frame.id());
        }
        let generation = inner.generation;
        drop(inner);

        Counters::bump(&self.shared.counters.dropped, stale.len() as u64);
        debug!(count = stale.len(), "re-submitting stale frames");
        self.shared.dispatch(stale, generation)
    }

    /// Re-submit every buffer in the retry queue once, oldest failure first.
    ///
    /// Buffers refused again go back to the tail, keeping their relative order.
    /// Returns how many the device accepted.
    pub fn drain_remaining(&self) -> usize {
        let mut inner = self.shared.inner.lock();
        if !inner.accepting() || inner.queue.retry_len() == 0 {
            return 0;
        }
        let count = inner.queue.retry_len();
        let frames = inner.queue.pull_retries(count);
        for frame in &frames {
            inner.mark_queued(frame.id());
        }
        let generation = inner.generation;
        drop(inner);

        let accepted = self.shared.dispatch(frames, generation);
        debug!(attempted = count, accepted, "drained retry queue");
        accepted
    }

    /// Cancel everything on the device and return all buffers to the free pool.
    ///
    /// Waits up to the configured timeout for the device to hand queued buffers
    /// back. Completions from before the shutdown are absorbed from here on.
    /// Safe to call repeatedly and before any session started. A buffer
    /// currently held by the consumer is parked when it is recycled.
    pub fn shutdown(&self) -> RotationResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            inner.shutting_down = true;
            inner.generation += 1;
        }

        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        let outstanding = loop {
            if self.shared.inner.lock().queued == 0 {
                break 0;
            }
            if let Err(status) = self.device.cancel_all() {
                warn!(%status, "capture device failed to cancel queued buffers");
            }

            let mut inner = self.shared.inner.lock();
            if inner.queued == 0 {
                break 0;
            }
            let now = Instant::now();
            if now >= deadline {
                break inner.queued;
            }
            let wait = (deadline - now).min(CANCEL_RETRY_INTERVAL);
            self.shared.settled.wait_for(&mut inner, wait);
        };

        let mut inner = self.shared.inner.lock();
        for frame in inner.queue.clear() {
            inner.park_idle(frame);
        }
        inner.fault = None;
        inner.fault_latched = false;
        inner.shutting_down = false;
        inner.stopped = true;
        let counts = inner.counts();
        drop(inner);

        let stats = self.stats();
        info!(
            free = counts.free,
            completed = counts.completed,
            outstanding,
            submitted = stats.submitted,
            consumed = stats.consumed,
            dropped = stats.dropped,
            rejected = stats.rejected,
            "Rotation buffer shut down"
        );

        if outstanding > 0 {
            return Err(RotationError::ShutdownTimeout { outstanding });
        }
        Ok(())
    }

    /// Buffers per lifecycle state. The sum is always [`len`](Self::len).
    #[must_use]
    pub fn counts(&self) -> StateCounts {
        self.shared.inner.lock().counts()
    }

    /// Lifecycle state of one buffer, `None` for an unknown slot.
    #[must_use]
    pub fn state_of(&self, id: FrameId) -> Option<FrameState> {
        self.shared
            .inner
            .lock()
            .slots
            .get(id.index())
            .map(|slot| slot.state())
    }

    /// Cumulative counters.
    #[must_use]
    pub fn stats(&self) -> RotationStats {
        self.shared.counters.snapshot()
    }

    /// Number of buffers in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.inner.lock().slots.len()
    }

    /// `true` before the first `initialize`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per buffer requested by the last `initialize`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.inner.lock().capacity
    }

    /// Completed buffers waiting for the consumer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().queue.pending()
    }

    /// Buffers waiting in the retry queue, in failure order.
    #[must_use]
    pub fn retry_ids(&self) -> Vec<FrameId> {
        self.shared
            .inner
            .lock()
            .queue
            .retry_iter()
            .map(FrameBuffer::id)
            .collect()
    }

    /// Buffers waiting in the retry queue.
    #[must_use]
    pub fn retry_len(&self) -> usize {
        self.shared.inner.lock().queue.retry_len()
    }

    /// `true` between a shutdown and the next `submit_all`.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.inner.lock().stopped
    }
}

impl std::fmt::Debug for RotationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationBuffer")
            .field("pool_id", &self.shared.pool_id)
            .field("counts", &self.counts())
            .finish()
    }
}

impl Drop for RotationBuffer {
    fn drop(&mut self) {
        let queued = {
            let mut inner = self.shared.inner.lock();
            inner.shutting_down = true;
            inner.generation += 1;
            inner.queued
        };
        if queued > 0 {
            debug!(queued, "rotation buffer dropped with buffers on the device, cancelling");
            let _ = self.device.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedDevice;
    use tracing_test::traced_test;

    const WIDTH: u32 = 16;
    const HEIGHT: u32 = 8;
    const FRAME_BYTES: usize = (WIDTH * HEIGHT) as usize;

    fn setup(config: RotationConfig) -> (Arc<ScriptedDevice>, RotationBuffer) {
        let camera = Arc::new(ScriptedDevice::new(WIDTH, HEIGHT));
        let rotation = RotationBuffer::new(camera.clone(), config);
        rotation.initialize_from_device(DEFAULT_BUFFER_COUNT).unwrap();
        (camera, rotation)
    }

    fn streaming() -> (Arc<ScriptedDevice>, RotationBuffer) {
        let (camera, rotation) = setup(RotationConfig::default());
        assert_eq!(rotation.submit_all().unwrap(), 4);
        (camera, rotation)
    }

    fn counts(free: usize, queued: usize, completed: usize) -> StateCounts {
        StateCounts {
            free,
            queued,
            completed,
        }
    }

    #[test]
    fn test_initialize_allocates_free_buffers() {
        let (_camera, rotation) = setup(RotationConfig::default());

        assert_eq!(rotation.len(), DEFAULT_BUFFER_COUNT);
        assert_eq!(rotation.capacity(), FRAME_BYTES);
        assert_eq!(rotation.counts(), counts(4, 0, 0));
        assert_eq!(rotation.state_of(FrameId(3)), Some(FrameState::Free));
        assert_eq!(rotation.state_of(FrameId(4)), None);
    }

    #[test]
    fn test_initialize_rejects_zero_sizes() {
        let camera = Arc::new(ScriptedDevice::new(WIDTH, HEIGHT));
        let rotation = RotationBuffer::new(camera, RotationConfig::default());

        assert!(matches!(
            rotation.initialize(0, 64),
            Err(RotationError::Allocation { count: 0, .. })
        ));
        assert!(matches!(
            rotation.initialize(4, 0),
            Err(RotationError::Allocation { capacity: 0, .. })
        ));
        assert!(rotation.is_empty());
    }

    #[test]
    fn test_submit_before_initialize() {
        let camera = Arc::new(ScriptedDevice::new(WIDTH, HEIGHT));
        let rotation = RotationBuffer::new(camera, RotationConfig::default());

        assert_eq!(rotation.submit_all(), Err(RotationError::NotInitialized));
    }

    #[test]
    fn test_consumer_gets_latest_frame() {
        let (camera, rotation) = streaming();
        assert_eq!(camera.queued_ids(), vec![FrameId(0), FrameId(1), FrameId(2), FrameId(3)]);

        for _ in 0..3 {
            camera.complete_next(FrameStatus::Success);
        }
        assert_eq!(rotation.pending(), 3);

        let frame = rotation.consume_latest().unwrap().unwrap();
        assert_eq!(frame.id(), FrameId(2));
        assert_eq!(frame.metadata().unwrap().sequence, 3);
        assert_eq!(frame.image().len(), FRAME_BYTES);

        assert_eq!(rotation.recycle_stale(), 2);
        assert_eq!(camera.queued_ids(), vec![FrameId(3), FrameId(0), FrameId(1)]);
        assert_eq!(rotation.counts(), counts(0, 3, 1));

        rotation.recycle(frame).unwrap();
        assert_eq!(rotation.counts(), counts(0, 4, 0));

        let stats = rotation.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.consumed, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.wakeups, 3);
    }

    #[test]
    fn test_consume_with_nothing_pending() {
        let (_camera, rotation) = streaming();
        assert!(rotation.consume_latest().unwrap().is_none());
        assert_eq!(rotation.recycle_stale(), 0);
    }

    #[test]
    #[traced_test]
    fn test_rejected_buffer_retried_on_next_completion() {
        let (camera, rotation) = setup(RotationConfig::default());
        camera.reject_next(1, FrameStatus::QueueFull);

        assert_eq!(rotation.submit_all().unwrap(), 3);
        assert_eq!(rotation.retry_ids(), vec![FrameId(0)]);
        assert_eq!(rotation.counts(), counts(1, 3, 0));
        assert!(logs_contain("rejected buffer"));

        camera.complete_next(FrameStatus::Success);
        assert_eq!(rotation.retry_len(), 0);
        assert_eq!(camera.queued_ids(), vec![FrameId(2), FrameId(3), FrameId(0)]);
        assert_eq!(rotation.counts(), counts(0, 3, 1));
        assert_eq!(rotation.stats().rejected, 1);
    }

    #[test]
    fn test_drain_remaining_keeps_failure_order() {
        let config = RotationConfig {
            resubmit_on_completion: false,
            ..RotationConfig::default()
        };
        let (camera, rotation) = setup(config);
        camera.reject_next(3, FrameStatus::QueueFull);
        assert_eq!(rotation.submit_all().unwrap(), 1);
        assert_eq!(rotation.retry_ids(), vec![FrameId(0), FrameId(1), FrameId(2)]);

        camera.complete_next(FrameStatus::Success);
        assert_eq!(rotation.retry_len(), 3);

        camera.reject_next(1, FrameStatus::Resources);
        assert_eq!(rotation.drain_remaining(), 2);
        assert_eq!(rotation.retry_ids(), vec![FrameId(0)]);
        assert_eq!(camera.queued_ids(), vec![FrameId(1), FrameId(2)]);
        assert_eq!(rotation.counts(), counts(1, 2, 1));
    }

    #[test]
    fn test_recycle_rejected_is_recoverable() {
        let (camera, rotation) = streaming();
        camera.complete_next(FrameStatus::Success);
        let frame = rotation.consume_latest().unwrap().unwrap();
        let id = frame.id();

        camera.reject_next(1, FrameStatus::QueueFull);
        let err = rotation.recycle(frame).unwrap_err();
        assert_eq!(err, RotationError::SubmissionRejected(FrameStatus::QueueFull));
        assert!(err.is_recoverable());
        assert_eq!(rotation.retry_ids(), vec![id]);
        assert_eq!(rotation.state_of(id), Some(FrameState::Free));
    }

    #[test]
    fn test_cancelled_completion_does_not_wake() {
        let (camera, rotation) = streaming();
        camera.complete_next(FrameStatus::Cancelled);

        assert_eq!(rotation.pending(), 0);
        assert_eq!(rotation.counts(), counts(1, 3, 0));
        let stats = rotation.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.wakeups, 0);
    }

    #[test]
    fn test_incomplete_frame_is_forwarded() {
        let (camera, rotation) = streaming();
        camera.complete_next(FrameStatus::DataMissing);

        let frame = rotation.consume_latest().unwrap().unwrap();
        assert!(frame.status().is_incomplete());
    }

    #[test]
    fn test_device_fault_surfaced_once() {
        let (camera, rotation) = streaming();
        camera.complete_next(FrameStatus::Unplugged);
        camera.complete_next(FrameStatus::Unplugged);

        assert_eq!(
            rotation.consume_latest().unwrap_err(),
            RotationError::DeviceFault(FrameStatus::Unplugged)
        );
        assert!(rotation.consume_latest().unwrap().is_none());

        let stats = rotation.stats();
        assert_eq!(stats.faults, 2);
        assert_eq!(stats.wakeups, 1);
        assert_eq!(rotation.counts(), counts(2, 2, 0));
    }

    #[test]
    fn test_fault_on_submission_is_latched() {
        let (camera, rotation) = setup(RotationConfig::default());
        camera.reject_all(Some(FrameStatus::Unplugged));

        assert_eq!(rotation.submit_all().unwrap(), 0);
        assert_eq!(rotation.retry_len(), 4);
        assert_eq!(
            rotation.consume_latest().unwrap_err(),
            RotationError::DeviceFault(FrameStatus::Unplugged)
        );
    }

    #[test]
    fn test_shutdown_returns_everything() {
        let (camera, rotation) = streaming();
        camera.complete_next(FrameStatus::Success);
        camera.complete_next(FrameStatus::Success);
        let held = rotation.consume_latest().unwrap().unwrap();

        rotation.shutdown().unwrap();
        assert!(rotation.is_shut_down());
        assert!(camera.queued_ids().is_empty());
        assert_eq!(rotation.counts(), counts(3, 0, 1));
        assert_eq!(rotation.pending(), 0);

        rotation.recycle(held).unwrap();
        assert_eq!(rotation.counts(), counts(4, 0, 0));
        assert!(camera.queued_ids().is_empty());

        let cancels = camera.cancel_calls();
        rotation.shutdown().unwrap();
        assert_eq!(camera.cancel_calls(), cancels);
    }

    #[test]
    fn test_shutdown_before_start() {
        let (camera, rotation) = setup(RotationConfig::default());
        rotation.shutdown().unwrap();
        assert_eq!(camera.cancel_calls(), 0);
        assert_eq!(rotation.counts(), counts(4, 0, 0));
    }

    #[test]
    fn test_shutdown_timeout_and_late_completions() {
        let config = RotationConfig {
            shutdown_timeout: Duration::from_millis(120),
            ..RotationConfig::default()
        };
        let (camera, rotation) = setup(config);
        rotation.submit_all().unwrap();
        camera.ignore_cancel(true);

        assert_eq!(
            rotation.shutdown(),
            Err(RotationError::ShutdownTimeout { outstanding: 4 })
        );
        assert!(camera.cancel_calls() >= 2);

        assert_eq!(camera.complete_all(FrameStatus::Success), 4);
        assert_eq!(rotation.counts(), counts(4, 0, 0));
        assert_eq!(rotation.pending(), 0);
        assert_eq!(rotation.stats().completed, 0);
        assert_eq!(rotation.stats().cancelled, 4);
    }

    #[test]
    fn test_restart_after_shutdown() {
        let (camera, rotation) = streaming();
        camera.complete_next(FrameStatus::Unplugged);
        rotation.shutdown().unwrap();

        assert_eq!(rotation.submit_all().unwrap(), 4);
        assert!(!rotation.is_shut_down());
        assert!(rotation.consume_latest().unwrap().is_none());
        camera.complete_next(FrameStatus::Success);
        assert!(rotation.consume_latest().unwrap().is_some());
    }

    #[test]
    fn test_reinitialize() {
        let (camera, rotation) = streaming();
        assert_eq!(
            rotation.initialize(4, FRAME_BYTES * 2),
            Err(RotationError::BuffersInFlight { queued: 4 })
        );

        camera.complete_next(FrameStatus::Success);
        let held = rotation.consume_latest().unwrap().unwrap();
        rotation.shutdown().unwrap();

        rotation.initialize(6, FRAME_BYTES * 2).unwrap();
        assert_eq!(rotation.len(), 6);
        assert_eq!(rotation.capacity(), FRAME_BYTES * 2);

        rotation.initialize(2, FRAME_BYTES).unwrap();
        assert_eq!(rotation.len(), 6);

        rotation.initialize(6, FRAME_BYTES * 2).unwrap();
        rotation.recycle(held).unwrap();
        assert_eq!(rotation.submit_all().unwrap(), 6);
        assert_eq!(camera.complete_all(FrameStatus::Success), 6);
        while let Some(frame) = rotation.consume_latest().unwrap() {
            assert_eq!(frame.capacity(), FRAME_BYTES * 2);
        }
    }

    #[test]
    fn test_reinitialize_keeps_larger_buffers() {
        let camera = Arc::new(ScriptedDevice::new(WIDTH, HEIGHT));
        let rotation = RotationBuffer::new(camera, RotationConfig::default());
        rotation.initialize(4, 256).unwrap();
        rotation.initialize(4, 128).unwrap();

        assert_eq!(rotation.capacity(), 128);
        let inner = rotation.shared.inner.lock();
        assert_eq!(inner.idle.len(), 4);
        assert!(inner.idle.iter().all(|frame| frame.capacity() == 256));
    }

    #[test]
    #[traced_test]
    fn test_persistent_refusal_warns_once_per_buffer() {
        let (camera, rotation) = setup(RotationConfig::default());
        camera.reject_all(Some(FrameStatus::QueueFull));

        assert_eq!(rotation.submit_all().unwrap(), 0);
        assert_eq!(rotation.drain_remaining(), 0);
        assert_eq!(rotation.drain_remaining(), 0);
        assert_eq!(rotation.stats().rejected, 12);

        logs_assert(|lines: &[&str]| {
            let warned = lines
                .iter()
                .filter(|line| line.contains("WARN") && line.contains("deferred to retry queue"))
                .count();
            let repeated = lines
                .iter()
                .filter(|line| line.contains("DEBUG") && line.contains("rejected buffer again"))
                .count();
            match (warned, repeated) {
                (4, 8) => Ok(()),
                other => Err(format!("expected 4 warnings and 8 repeats, got {other:?}")),
            }
        });
    }

    #[test]
    #[traced_test]
    fn test_refusal_warns_again_after_completion() {
        let (camera, rotation) = setup(RotationConfig::default());
        camera.reject_next(1, FrameStatus::QueueFull);
        assert_eq!(rotation.submit_all().unwrap(), 3);
        assert_eq!(rotation.retry_ids(), vec![FrameId(0)]);

        assert_eq!(rotation.drain_remaining(), 1);
        assert_eq!(camera.complete_all(FrameStatus::Success), 4);
        while let Some(frame) = rotation.consume_latest().unwrap() {
            camera.reject_next(1, FrameStatus::QueueFull);
            assert!(rotation.recycle(frame).is_err());
        }

        logs_assert(|lines: &[&str]| {
            let warned = lines
                .iter()
                .filter(|line| line.contains("WARN") && line.contains("deferred to retry queue"))
                .count();
            match warned {
                5 => Ok(()),
                n => Err(format!("expected 5 warnings, got {n}")),
            }
        });
        assert!(!logs_contain("rejected buffer again"));
    }

    #[test]
    fn test_dropped_frame_is_recycled() {
        let (camera, rotation) = streaming();
        camera.complete_next(FrameStatus::Success);
        let frame = rotation.consume_latest().unwrap().unwrap();
        let id = frame.id();

        drop(frame);
        assert_eq!(rotation.state_of(id), Some(FrameState::Queued));
        assert_eq!(camera.queued_ids().last(), Some(&id));
    }

    #[test]
    fn test_recycle_into_foreign_pool() {
        let (camera, rotation) = streaming();
        let (_other_camera, other) = streaming();
        camera.complete_next(FrameStatus::Success);
        let frame = rotation.consume_latest().unwrap().unwrap();
        let id = frame.id();

        assert_eq!(other.recycle(frame), Err(RotationError::UnknownBuffer(id)));
        assert_eq!(rotation.state_of(id), Some(FrameState::Queued));
        assert_eq!(other.counts(), counts(0, 4, 0));
    }

    #[test]
    fn test_drop_cancels_device() {
        let (camera, rotation) = streaming();
        drop(rotation);
        assert_eq!(camera.cancel_calls(), 1);
        assert!(camera.queued_ids().is_empty());
    }

    #[test]
    fn test_completion_wakes_waiting_consumer() {
        let (camera, rotation) = streaming();
        let mut waiter = tokio_test::task::spawn(rotation.notified());
        tokio_test::assert_pending!(waiter.poll());

        camera.complete_next(FrameStatus::Cancelled);
        assert!(!waiter.is_woken());

        camera.complete_next(FrameStatus::Success);
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_consume_latest_timeout() {
        let (camera, rotation) = streaming();
        assert!(rotation
            .consume_latest_timeout(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        let producer = Arc::clone(&camera);
        let completer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.complete_next(FrameStatus::Success)
        });

        let frame = rotation
            .consume_latest_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(frame.id()), completer.await.unwrap());
    }
}
