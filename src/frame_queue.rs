use std::sync::{Mutex, MutexGuard};

use crate::can_controller::CanMessage;
use crate::error::{AppError, Result};
use crate::queue::Queue;

/// Received frames waiting for the main loop.
///
/// The receive interrupt is the only producer; the handler task is the only
/// consumer. Every access happens inside a short critical section.
pub struct FrameQueue {
    frames: Mutex<Queue<CanMessage>>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        return Self {
            frames: Mutex::new(Queue::new(capacity)),
        };
    }

    fn critical_section(&self) -> MutexGuard<'_, Queue<CanMessage>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copies a frame into the ring. A full ring drops the new frame.
    pub fn enqueue(&self, message: CanMessage) -> Result<()> {
        self.critical_section()
            .add(message)
            .map_err(|_| AppError::overflow("frame queue"))
    }

    pub fn dequeue(&self) -> Option<CanMessage> {
        self.critical_section().remove()
    }

    /// Drops the newest frame when its handler could not be scheduled.
    pub fn withdraw_newest(&self) -> Option<CanMessage> {
        self.critical_section().remove_last()
    }

    pub fn len(&self) -> usize {
        self.critical_section().len()
    }

    pub fn is_empty(&self) -> bool {
        self.critical_section().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;

    #[test]
    fn test_overflow_drops_newest() {
        let queue = FrameQueue::new(8);
        for id in 0..10u32 {
            let result = queue.enqueue(CanMessage::standard(0x680 + id, &[id as u8]));
            if id < 8 {
                assert!(result.is_ok());
            } else {
                let Err(e) = result else {
                    panic!("overflow must be reported");
                };
                assert_eq!(e.error_type, ErrorType::QueueOverflow);
            }
        }
        assert_eq!(queue.len(), 8);
        for id in 0..8u32 {
            let Some(message) = queue.dequeue() else {
                panic!("frame {} missing", id);
            };
            assert_eq!(message.id(), 0x680 + id);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_from_another_thread() {
        let queue = std::sync::Arc::new(FrameQueue::new(4));
        let producer = queue.clone();
        std::thread::spawn(move || {
            producer.enqueue(CanMessage::standard(0x700, &[0x01])).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(queue.dequeue().unwrap().payload(), &[0x01]);
    }
}
