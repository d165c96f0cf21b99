//! The two orderings buffers wait in between device cycles.
//!
//! Completed frames are kept as a stack: the consumer always takes the freshest
//! one and older frames become candidates for dropping. Buffers whose
//! submission was rejected wait in a FIFO so the oldest failure is retried first.

use crate::frame::FrameBuffer;
use std::collections::VecDeque;

/// Completed stack plus retry queue. Not synchronized; the rotation buffer
/// keeps it behind its mutex.
#[derive(Debug, Default)]
pub struct RotationQueue {
    /// Fresh end is the back.
    completed: VecDeque<FrameBuffer>,
    /// Oldest failure at the front.
    retry: VecDeque<FrameBuffer>,
}

impl RotationQueue {
    /// Push a completed buffer on the fresh end.
    pub fn push_completed(&mut self, frame: FrameBuffer) {
        self.completed.push_back(frame);
    }

    /// Take the most recently completed buffer.
    pub fn pop_latest(&mut self) -> Option<FrameBuffer> {
        self.completed.pop_back()
    }

    /// Take every completed buffer, oldest first.
    pub fn drain_completed(&mut self) -> impl Iterator<Item = FrameBuffer> + '_ {
        self.completed.drain(..)
    }

    /// Number of completed buffers waiting for the consumer.
    pub fn pending(&self) -> usize {
        self.completed.len()
    }

    /// Append a rejected buffer at the tail of the retry queue.
    pub fn bury(&mut self, frame: FrameBuffer) {
        self.retry.push_back(frame);
    }

    /// Take the buffer that has been waiting longest for re-submission.
    pub fn pull_oldest(&mut self) -> Option<FrameBuffer> {
        self.retry.pop_front()
    }

    /// Take up to `count` retry buffers in failure order.
    pub fn pull_retries(&mut self, count: usize) -> Vec<FrameBuffer> {
        let count = count.min(self.retry.len());
        self.retry.drain(..count).collect()
    }

    /// Number of buffers waiting for re-submission.
    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    /// Retry buffers in failure order.
    pub fn retry_iter(&self) -> impl Iterator<Item = &FrameBuffer> {
        self.retry.iter()
    }

    /// Mutable access to retry buffers, used when capacity grows.
    pub fn retry_iter_mut(&mut self) -> impl Iterator<Item = &mut FrameBuffer> {
        self.retry.iter_mut()
    }

    /// Empty both queues, returning every buffer they held.
    pub fn clear(&mut self) -> Vec<FrameBuffer> {
        self.completed.drain(..).chain(self.retry.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameId;

    fn frame(id: usize) -> FrameBuffer {
        FrameBuffer::allocate(1, FrameId(id), 4).unwrap()
    }

    #[test]
    fn test_completed_is_lifo() {
        let mut queue = RotationQueue::default();
        queue.push_completed(frame(0));
        queue.push_completed(frame(1));
        queue.push_completed(frame(2));

        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.pop_latest().unwrap().id(), FrameId(2));
        assert_eq!(queue.pop_latest().unwrap().id(), FrameId(1));
        assert_eq!(queue.pop_latest().unwrap().id(), FrameId(0));
        assert!(queue.pop_latest().is_none());
    }

    #[test]
    fn test_retry_is_fifo() {
        let mut queue = RotationQueue::default();
        queue.bury(frame(3));
        queue.bury(frame(1));
        queue.bury(frame(2));

        assert_eq!(queue.pull_oldest().unwrap().id(), FrameId(3));
        let rest: Vec<_> = queue.pull_retries(10).iter().map(FrameBuffer::id).collect();
        assert_eq!(rest, vec![FrameId(1), FrameId(2)]);
        assert_eq!(queue.retry_len(), 0);
    }

    #[test]
    fn test_drain_completed_oldest_first() {
        let mut queue = RotationQueue::default();
        queue.push_completed(frame(0));
        queue.push_completed(frame(1));

        let ids: Vec<_> = queue.drain_completed().map(|f| f.id()).collect();
        assert_eq!(ids, vec![FrameId(0), FrameId(1)]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_clear_returns_everything() {
        let mut queue = RotationQueue::default();
        queue.push_completed(frame(0));
        queue.bury(frame(1));

        assert_eq!(queue.clear().len(), 2);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.retry_len(), 0);
    }
}
