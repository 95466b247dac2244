/// Fixed-capacity FIFO ring. Slots are allocated once; a full queue refuses
/// new items and hands them back to the caller.
pub struct Queue<T> {
    q_first: usize,
    len: usize,
    queue_array: Box<[Option<T>]>,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        return Queue {
            q_first: 0,
            len: 0,
            queue_array: (0..capacity.max(1)).map(|_| None).collect(),
        };
    }

    pub fn add(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let q_last = (self.q_first + self.len) % self.capacity();
        self.queue_array[q_last] = Some(item);
        self.len += 1;
        return Ok(());
    }

    pub fn remove(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.queue_array[self.q_first].take();
        self.q_first = (self.q_first + 1) % self.capacity();
        self.len -= 1;
        return item;
    }

    /// Takes back the most recently added item.
    pub fn remove_last(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let q_last = (self.q_first + self.len - 1) % self.capacity();
        self.len -= 1;
        return self.queue_array[q_last].take();
    }

    pub fn is_empty(&self) -> bool {
        return self.len == 0;
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.queue_array.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_wrap() {
        let mut queue = Queue::new(3);
        queue.add(1).unwrap();
        queue.add(2).unwrap();
        assert_eq!(queue.remove(), Some(1));
        queue.add(3).unwrap();
        queue.add(4).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.remove(), Some(2));
        assert_eq!(queue.remove(), Some(3));
        assert_eq!(queue.remove(), Some(4));
        assert_eq!(queue.remove(), None);
    }

    #[test]
    fn test_full_queue_refuses_newest() {
        let mut queue = Queue::new(2);
        queue.add('a').unwrap();
        queue.add('b').unwrap();
        assert_eq!(queue.add('c'), Err('c'));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove(), Some('a'));
        assert_eq!(queue.remove(), Some('b'));
    }

    #[test]
    fn test_remove_last() {
        let mut queue = Queue::new(4);
        queue.add(1).unwrap();
        queue.add(2).unwrap();
        assert_eq!(queue.remove_last(), Some(2));
        assert_eq!(queue.remove(), Some(1));
        assert_eq!(queue.remove_last(), None);
    }
}
