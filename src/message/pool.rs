use parking_lot::Mutex;

use super::Message;

/// Locked free-list pool for [`Message`] objects.
///
/// The pool is pre-populated at construction; when it runs dry, `allocate`
/// falls back to a fresh heap allocation rather than failing the caller, and
/// the extra object joins the pool on free. The pool therefore never shrinks.
#[derive(Debug)]
pub struct MessagePool {
    free: Mutex<Vec<Message>>,
}

impl MessagePool {
    pub fn new(capacity: usize) -> MessagePool {
        let free = (0..capacity).map(|_| Message::new()).collect();
        MessagePool {
            free: Mutex::new(free),
        }
    }

    /// Hand out a message with zero payload length. Never fails.
    pub fn allocate(&self) -> Message {
        match self.free.lock().pop() {
            Some(message) => message,
            None => Message::new(),
        }
    }

    pub fn free(&self, mut message: Message) {
        message.reset();
        self.free.lock().push(message);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}
