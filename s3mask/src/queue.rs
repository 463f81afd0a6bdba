//! Bounded work queue connecting the object lister to the masking workers.
//!
//! On top of what an `mpsc` channel does, the queue tracks how many items have been put but not
//! yet marked done, so that the job can wait until every enqueued object has been fully processed
//! (not merely dequeued).
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct QueueState {
    /// Items put on the queue and not yet marked done
    outstanding: usize,

    /// No more items will be put on the queue
    closed: bool,
}

/// Make a new queue with room for `capacity` items.
pub(crate) fn work_queue<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let (state_sender, state_receiver) = watch::channel(QueueState::default());
    let state_sender = Arc::new(state_sender);

    (
        Producer {
            sender,
            state: state_sender.clone(),
        },
        Consumer {
            receiver: Arc::new(Mutex::new(receiver)),
            state: state_sender,
            state_receiver,
        },
    )
}

/// The sending end of the queue.  There is only ever one producer.
pub(crate) struct Producer<T> {
    sender: mpsc::Sender<T>,
    state: Arc<watch::Sender<QueueState>>,
}

impl<T> Producer<T> {
    /// Put an item on the queue, waiting for room if the queue is full.
    ///
    /// Fails, returning the item, if all consumers are gone.
    pub(crate) async fn put(&self, item: T) -> Result<(), T> {
        let Ok(permit) = self.sender.reserve().await else {
            return Err(item);
        };

        // Count the item before it's visible to any consumer, so `task_done` can never run ahead
        // of the count.  Nothing is counted if this future is dropped while waiting for room.
        self.state.send_modify(|state| state.outstanding += 1);
        permit.send(item);

        Ok(())
    }

    /// Signal that no more items will be put on the queue.
    ///
    /// Only after this is called can the queue be considered drained.  Dropping the producer
    /// without closing does not count, so an enumeration that dies halfway through is never
    /// mistaken for a finished one.
    pub(crate) fn close(self) {
        self.state.send_modify(|state| state.closed = true);
    }
}

/// The receiving end of the queue, shared by all workers.
pub(crate) struct Consumer<T> {
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
    state: Arc<watch::Sender<QueueState>>,
    state_receiver: watch::Receiver<QueueState>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            state: self.state.clone(),
            state_receiver: self.state_receiver.clone(),
        }
    }
}

impl<T> Consumer<T> {
    /// Take the next item off the queue, waiting until one is available.
    ///
    /// Returns `None` once the producer is gone and the queue is empty.
    pub(crate) async fn get(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }

    /// Mark one item previously returned by [`Self::get`] as completely processed.
    pub(crate) fn task_done(&self) {
        self.state.send_modify(|state| {
            debug_assert!(state.outstanding > 0, "task_done called too many times");
            state.outstanding = state.outstanding.saturating_sub(1);
        });
    }

    /// Wait until the queue is closed and every item put on it has been marked done.
    pub(crate) async fn drained(&self) {
        let mut state_receiver = self.state_receiver.clone();

        loop {
            {
                let state = state_receiver.borrow_and_update();
                if state.closed && state.outstanding == 0 {
                    return;
                }
            }

            if state_receiver.changed().await.is_err() {
                // Can't happen while `self` holds a sender
                return;
            }
        }
    }
}
