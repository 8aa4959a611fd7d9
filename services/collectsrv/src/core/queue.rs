//! Write-priority coordination for a shared transport
//!
//! When reads and writes share one physical link, every pending write is
//! drained before the next read batch starts, so a steady stream of reads can
//! never starve a write. Both queues are FIFO; enqueueing never blocks.
//!
//! This is a plain data structure owned by the protocol driver and invoked
//! from its poll step; it has no task of its own.

use std::collections::VecDeque;

/// Next unit of work handed to the poll step
#[derive(Debug, Clone, PartialEq)]
pub enum Work<R, W> {
    Read(R),
    Write(W),
}

#[derive(Debug)]
pub struct WritePriorityQueue<R, W> {
    reads: VecDeque<R>,
    writes: VecDeque<W>,
}

impl<R, W> Default for WritePriorityQueue<R, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> WritePriorityQueue<R, W> {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            writes: VecDeque::new(),
        }
    }

    pub fn enqueue_read(&mut self, read: R) {
        self.reads.push_back(read);
    }

    pub fn enqueue_write(&mut self, write: W) {
        self.writes.push_back(write);
    }

    pub fn try_dequeue_write(&mut self) -> Option<W> {
        self.writes.pop_front()
    }

    /// Next read batch, only once no write is pending
    pub fn try_dequeue_read(&mut self) -> Option<R> {
        if self.writes.is_empty() {
            self.reads.pop_front()
        } else {
            None
        }
    }

    /// Writes first, then reads
    pub fn next_work(&mut self) -> Option<Work<R, W>> {
        self.try_dequeue_write()
            .map(Work::Write)
            .or_else(|| self.try_dequeue_read().map(Work::Read))
    }

    pub fn drain_writes(&mut self) -> Vec<W> {
        self.writes.drain(..).collect()
    }

    /// Drop scheduled reads, e.g. after the transport faulted mid-cycle
    pub fn clear_reads(&mut self) -> usize {
        let n = self.reads.len();
        self.reads.clear();
        n
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_drain_before_reads() {
        let mut q: WritePriorityQueue<u32, &str> = WritePriorityQueue::new();
        q.enqueue_read(1);
        q.enqueue_read(2);
        q.enqueue_write("w1");
        q.enqueue_read(3);
        q.enqueue_write("w2");

        let order: Vec<_> = std::iter::from_fn(|| q.next_work()).collect();
        assert_eq!(
            order,
            vec![
                Work::Write("w1"),
                Work::Write("w2"),
                Work::Read(1),
                Work::Read(2),
                Work::Read(3),
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn test_write_arriving_between_reads_jumps_ahead() {
        let mut q: WritePriorityQueue<u32, &str> = WritePriorityQueue::new();
        for i in 0..3 {
            q.enqueue_read(i);
        }
        assert_eq!(q.next_work(), Some(Work::Read(0)));

        q.enqueue_write("late");
        assert_eq!(q.try_dequeue_read(), None);
        assert_eq!(q.next_work(), Some(Work::Write("late")));
        assert_eq!(q.next_work(), Some(Work::Read(1)));
    }

    #[test]
    fn test_n_writes_before_m_reads() {
        let mut q: WritePriorityQueue<usize, usize> = WritePriorityQueue::new();
        let (n, m) = (7, 11);
        for i in 0..n {
            q.enqueue_write(i);
        }
        for i in 0..m {
            q.enqueue_read(i);
        }

        let order: Vec<_> = std::iter::from_fn(|| q.next_work()).collect();
        let first_read = order
            .iter()
            .position(|w| matches!(w, Work::Read(_)))
            .unwrap_or(order.len());
        assert_eq!(first_read, n);
        assert_eq!(order.len(), n + m);
    }

    #[test]
    fn test_clear_reads_keeps_writes() {
        let mut q: WritePriorityQueue<u32, u32> = WritePriorityQueue::new();
        q.enqueue_read(1);
        q.enqueue_read(2);
        q.enqueue_write(9);
        assert_eq!(q.pending_reads(), 2);
        assert_eq!(q.clear_reads(), 2);
        assert_eq!(q.pending_reads(), 0);
        assert_eq!(q.pending_writes(), 1);
        assert_eq!(q.drain_writes(), vec![9]);
        assert!(q.is_empty());
    }
}
