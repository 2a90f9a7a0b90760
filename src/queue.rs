//! The bounded hand-off buffer of idle connections.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

use crate::conn::Conn;

/// A bounded lock-free FIFO of idle connections with non-blocking push and
/// pop.
///
/// The queue has no random access: any traversal that needs to filter
/// connections drains up to `capacity` entries into a scratch list and pushes
/// the survivors back. That refill is not atomic with respect to concurrent
/// `try_pop`/`try_push`, which is acceptable because filtering is
/// best-effort.
pub(crate) struct ReadyQueue<C: Conn> {
    slots: ArrayQueue<Arc<C>>,
}

impl<C: Conn> ReadyQueue<C> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity),
        }
    }

    pub(crate) fn try_pop(&self) -> Option<Arc<C>> {
        self.slots.pop()
    }

    /// Enqueues `conn`, handing it back if the queue is full.
    pub(crate) fn try_push(&self, conn: Arc<C>) -> Result<(), Arc<C>> {
        self.slots.push(conn)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Pops up to `capacity` entries for a filtering traversal.
    pub(crate) fn drain(&self) -> Vec<Arc<C>> {
        let mut drained = Vec::with_capacity(self.slots.len());
        for _ in 0..self.slots.capacity() {
            match self.slots.pop() {
                Some(conn) => drained.push(conn),
                None => break,
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer;
    use crate::endpoint::Endpoint;

    struct StubConn(u32);

    impl Conn for StubConn {
        fn remote_addr(&self) -> Option<Endpoint> {
            Some(Endpoint::from("stub:1"))
        }

        fn close(&self) -> Result<(), dialer::Error> {
            Ok(())
        }
    }

    #[test]
    fn pops_in_fifo_order() {
        let queue = ReadyQueue::new(4);
        assert!(queue.try_push(Arc::new(StubConn(1))).is_ok());
        assert!(queue.try_push(Arc::new(StubConn(2))).is_ok());

        assert_eq!(queue.try_pop().unwrap().0, 1);
        assert_eq!(queue.try_pop().unwrap().0, 2);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn rejects_pushes_past_capacity() {
        let queue = ReadyQueue::new(2);
        assert!(queue.try_push(Arc::new(StubConn(1))).is_ok());
        assert!(queue.try_push(Arc::new(StubConn(2))).is_ok());

        let overflow = queue.try_push(Arc::new(StubConn(3)));
        assert_eq!(overflow.unwrap_err().0, 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = ReadyQueue::new(4);
        for i in 0..3 {
            assert!(queue.try_push(Arc::new(StubConn(i))).is_ok());
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(queue.len(), 0);
    }
}
