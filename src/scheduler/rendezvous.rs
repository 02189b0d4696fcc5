//! Single-use, two-party rendezvous for one scheduler round.
//!
//! The worker waits once per group; the engine arrives once per group. Both sides
//! block on a zero-capacity channel, so whichever comes second releases both. Closing
//! the cancellation channel interrupts a waiting worker and turns any later arrival
//! into a no-op. An arrival made on the worker thread itself is recorded as a defect and
//! fails the worker's next wait. A token is retired at the end of its round and never reset.

use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::{self, ThreadId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RendezvousError {
    #[error("wait interrupted by cancellation")]
    Interrupted,

    #[error("worker waiting on group {expected} but group {arrived} arrived")]
    GroupMismatch { expected: usize, arrived: usize },

    #[error("arrival from the worker thread itself would never be met")]
    SameThread,

    #[error("rendezvous channel disconnected")]
    Disconnected,
}

/// What happened to an engine-side arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The worker was released
    Met,
    /// The round was cancelled or already over; nobody is waiting
    RoundOver,
}

#[derive(Debug)]
pub struct RoundToken {
    round: u64,
    arrive_tx: Sender<usize>,
    arrive_rx: Receiver<usize>,
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    misdelivered_tx: Sender<usize>,
    misdelivered_rx: Receiver<usize>,
    worker: Mutex<Option<ThreadId>>,
}

impl RoundToken {
    pub fn new(round: u64) -> Self {
        let (arrive_tx, arrive_rx) = bounded(0);
        // Never carries a message; dropping the sender is the signal
        let (cancel_tx, cancel_rx) = bounded(0);
        // Arrivals made on the worker thread are parked here for its next wait
        let (misdelivered_tx, misdelivered_rx) = bounded(1);
        Self {
            round,
            arrive_tx,
            arrive_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            misdelivered_tx,
            misdelivered_rx,
            worker: Mutex::new(None),
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Record the thread that will wait on this token
    pub fn bind_worker(&self, id: ThreadId) {
        *self.worker.lock() = Some(id);
    }

    /// Cancel the round; returns true for the call that actually cancelled it
    pub fn cancel(&self) -> bool {
        self.cancel_tx.lock().take().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.lock().is_none()
    }

    /// Worker side: block until the engine arrives for `group` or the round is cancelled
    pub fn await_group(&self, group: usize) -> Result<(), RendezvousError> {
        select! {
            recv(self.arrive_rx) -> arrived => match arrived {
                Ok(arrived) if arrived == group => Ok(()),
                Ok(arrived) => Err(RendezvousError::GroupMismatch { expected: group, arrived }),
                Err(_) => Err(RendezvousError::Disconnected),
            },
            recv(self.misdelivered_rx) -> _arrived => Err(RendezvousError::SameThread),
            recv(self.cancel_rx) -> _closed => Err(RendezvousError::Interrupted),
        }
    }

    /// Engine side: meet the worker for `group`, unless the round is over
    pub fn arrive(&self, group: usize) -> Result<Arrival, RendezvousError> {
        // Engines may complete while unwinding inside an abort that runs on the worker
        if self.is_cancelled() {
            return Ok(Arrival::RoundOver);
        }
        if *self.worker.lock() == Some(thread::current().id()) {
            // Full only if a defect is already pending
            let _ = self.misdelivered_tx.try_send(group);
            return Err(RendezvousError::SameThread);
        }
        select! {
            send(self.arrive_tx, group) -> sent => sent
                .map(|()| Arrival::Met)
                .map_err(|_| RendezvousError::Disconnected),
            recv(self.cancel_rx) -> _closed => Ok(Arrival::RoundOver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_engine_arriving_first_waits_for_worker() {
        let token = Arc::new(RoundToken::new(1));
        let engine_token = Arc::clone(&token);
        let engine = thread::spawn(move || engine_token.arrive(0));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(token.await_group(0), Ok(()));
        assert_eq!(engine.join().unwrap(), Ok(Arrival::Met));
    }

    #[test]
    fn test_worker_arriving_first_waits_for_engine() {
        let token = Arc::new(RoundToken::new(1));
        let engine_token = Arc::clone(&token);
        let engine = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            engine_token.arrive(3)
        });

        assert_eq!(token.await_group(3), Ok(()));
        assert_eq!(engine.join().unwrap(), Ok(Arrival::Met));
    }

    #[test]
    fn test_cancel_interrupts_waiting_worker() {
        let token = Arc::new(RoundToken::new(1));
        let waiter_token = Arc::clone(&token);
        let waiter = thread::spawn(move || waiter_token.await_group(0));

        thread::sleep(Duration::from_millis(20));
        assert!(token.cancel());
        assert!(!token.cancel());
        assert_eq!(waiter.join().unwrap(), Err(RendezvousError::Interrupted));
    }

    #[test]
    fn test_arrival_after_cancel_is_noop() {
        let token = RoundToken::new(1);
        token.cancel();
        assert_eq!(token.arrive(0), Ok(Arrival::RoundOver));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_mismatched_group_is_reported() {
        let token = Arc::new(RoundToken::new(1));
        let engine_token = Arc::clone(&token);
        let engine = thread::spawn(move || engine_token.arrive(0));

        assert_eq!(
            token.await_group(1),
            Err(RendezvousError::GroupMismatch {
                expected: 1,
                arrived: 0
            })
        );
        engine.join().unwrap().unwrap();
    }

    #[test]
    fn test_arrival_from_worker_thread_is_rejected() {
        let token = RoundToken::new(1);
        token.bind_worker(thread::current().id());
        assert_eq!(token.arrive(0), Err(RendezvousError::SameThread));
    }

    #[test]
    fn test_arrival_from_worker_thread_fails_next_wait() {
        let token = RoundToken::new(1);
        token.bind_worker(thread::current().id());
        assert_eq!(token.arrive(2), Err(RendezvousError::SameThread));
        assert_eq!(token.arrive(2), Err(RendezvousError::SameThread));

        assert_eq!(token.await_group(2), Err(RendezvousError::SameThread));
    }

    #[test]
    fn test_worker_thread_arrival_after_cancel_is_noop() {
        let token = RoundToken::new(1);
        token.bind_worker(thread::current().id());
        token.cancel();
        assert_eq!(token.arrive(0), Ok(Arrival::RoundOver));
    }
}
