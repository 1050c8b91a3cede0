//! Blocking request queue shared by a device's workers

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::request::PendingRequest;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PendingRequest>,
    stopping: bool,
}

/// FIFO of pending requests.
///
/// The lock is held only to push or pop; requests are served outside it.
#[derive(Debug, Default)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request and wake one worker.
    ///
    /// Once the queue is stopping the request is handed back.
    pub fn push(&self, request: PendingRequest) -> Result<(), PendingRequest> {
        let mut state = self.state.lock();
        if state.stopping {
            return Err(request);
        }
        state.pending.push_back(request);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Wait for the next request.
    ///
    /// Returns `None` once the queue is stopping and drained.
    pub fn pop_wait(&self) -> Option<PendingRequest> {
        let mut state = self.state.lock();
        loop {
            if let Some(request) = state.pending.pop_front() {
                return Some(request);
            }
            if state.stopping {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Refuse new requests and wake every waiting worker
    pub fn stop(&self) {
        self.state.lock().stopping = true;
        self.ready.notify_all();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = RequestQueue::new();
        for offset in [0, 512, 1024] {
            queue.push(PendingRequest::read(offset, 512, |_| {})).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_wait().unwrap().offset(), 0);
        assert_eq!(queue.pop_wait().unwrap().offset(), 512);
        assert_eq!(queue.pop_wait().unwrap().offset(), 1024);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stop_drains_then_returns_none() {
        let queue = RequestQueue::new();
        queue.push(PendingRequest::read(0, 512, |_| {})).unwrap();
        queue.stop();

        assert!(queue.push(PendingRequest::read(512, 512, |_| {})).is_err());
        assert!(queue.pop_wait().is_some());
        assert!(queue.pop_wait().is_none());
    }

    #[test]
    fn test_stop_wakes_waiters() {
        let queue = Arc::new(RequestQueue::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop_wait().is_none())
            })
            .collect();

        queue.stop();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }
}
