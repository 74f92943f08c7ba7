use crate::packet::Packet;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Inbound packet queue. Pushed from the socket context, drained from the
/// simulation tick, requeued packets go to the logical tail.
pub struct PacketQueue {
    queue: Mutex<VecDeque<Box<Packet>>>,
}

impl PacketQueue {
    pub fn new() -> PacketQueue {
        PacketQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn push(&self, packet: Box<Packet>) {
        self.lock().push_back(packet);
    }

    /// Pops the head packet if it passes the filter. A non-passing head
    /// stops the drain, order across the two filter phases is preserved.
    pub fn next<F: FnMut(&Packet) -> bool>(&self, mut filter: F) -> Option<Box<Packet>> {
        let mut queue = self.lock();

        match queue.front() {
            Some(front) if filter(front) => queue.pop_front(),
            _ => None,
        }
    }

    /// Identity of the head packet, used by the drain cycle breaker.
    #[inline]
    pub fn peek_ptr(&self) -> Option<*const Packet> {
        self.lock().front().map(|front| &**front as *const Packet)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[inline]
    fn lock(&self) -> std::sync::MutexGuard<VecDeque<Box<Packet>>> {
        self.queue.lock().expect("Packet queue lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new();
        queue.push(Box::new(Packet::new(1)));
        queue.push(Box::new(Packet::new(2)));

        assert_eq!(queue.next(|_| true).unwrap().opcode(), 1);
        assert_eq!(queue.next(|_| true).unwrap().opcode(), 2);
        assert!(queue.next(|_| true).is_none());
    }

    #[test]
    fn test_filtered_head_stops_drain() {
        let queue = PacketQueue::new();
        queue.push(Box::new(Packet::new(1)));
        queue.push(Box::new(Packet::new(2)));

        // Head fails the filter, the passing packet behind it stays put
        assert!(queue.next(|packet| packet.opcode() != 1).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_preserves_identity() {
        let queue = PacketQueue::new();
        queue.push(Box::new(Packet::new(1)));

        let head = queue.peek_ptr().unwrap();
        let packet = queue.next(|_| true).unwrap();
        queue.push(packet);

        assert_eq!(queue.peek_ptr().unwrap(), head);
    }
}
