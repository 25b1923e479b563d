//! Per-object ordering of database requests.
//!
//! Requests that touch the same object run one after another in arrival
//! order; requests on different objects run concurrently.

use shared::DoId;
use std::collections::HashMap;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Hands out turns per object id.
#[derive(Debug, Default)]
pub struct Sequencer {
    tails: HashMap<DoId, oneshot::Receiver<()>>,
}

/// A place in an object's queue. Dropping the turn lets the next one run.
#[derive(Debug)]
pub struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    _done: Option<oneshot::Sender<()>>,
}

impl Turn {
    /// A turn that waits for nothing.
    pub fn free() -> Self {
        Self {
            previous: None,
            _done: None,
        }
    }

    /// Waits until every earlier turn on the same object has been dropped.
    pub async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Err means the earlier turn was dropped, which is the signal.
            let _ = previous.await;
        }
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a turn behind the last turn issued for `do_id`.
    pub fn enter(&mut self, do_id: DoId) -> Turn {
        self.prune();

        let (done, tail) = oneshot::channel();
        let previous = self.tails.insert(do_id, tail);
        Turn {
            previous,
            _done: Some(done),
        }
    }

    /// Objects with a turn still outstanding.
    pub fn pending(&mut self) -> usize {
        self.prune();
        self.tails.len()
    }

    fn prune(&mut self) {
        self.tails
            .retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));
    }
}
