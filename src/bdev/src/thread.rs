//! Thread identity and cross-thread task posting. Device descriptors must
//! be closed on the thread that opened them; teardown running elsewhere
//! posts the close as a task to the owning thread's mailbox.

use std::cell::RefCell;
use std::thread::ThreadId;

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use thiserror::Error;

type Task = Box<dyn FnOnce() + Send>;

static MAILBOXES: Lazy<DashMap<ThreadId, Sender<Task>>> = Lazy::new(DashMap::new);

thread_local! {
    static INBOX: RefCell<Option<Receiver<Task>>> = const { RefCell::new(None) };
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("target thread's mailbox is gone")]
    Disconnected,
}

/// A handle onto a specific thread, usable from any other thread to post
/// work there.
#[derive(Clone, Debug)]
pub struct ThreadHandle {
    id: ThreadId,
    tx: Sender<Task>,
}

impl ThreadHandle {
    pub fn is_current(&self) -> bool {
        self.id == std::thread::current().id()
    }

    pub fn send(&self, task: impl FnOnce() + Send + 'static) -> Result<(), SendError> {
        match self.tx.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(SendError::Disconnected),
            Err(TrySendError::Full(_)) => unreachable!("unbounded channel"),
        }
    }
}

/// Handle for the calling thread, creating its mailbox on first use.
pub fn current() -> ThreadHandle {
    let id = std::thread::current().id();
    let tx = MAILBOXES
        .entry(id)
        .or_insert_with(|| {
            let (tx, rx) = unbounded();
            INBOX.with(|inbox| *inbox.borrow_mut() = Some(rx));
            tx
        })
        .clone();
    ThreadHandle { id, tx }
}

/// Runs every task posted to the calling thread. Returns the number run.
pub fn poll() -> usize {
    // Make sure the mailbox exists so handles taken later still reach us.
    let _ = current();
    let rx = INBOX.with(|inbox| inbox.borrow().clone());
    let Some(rx) = rx else { return 0 };
    let mut ran = 0;
    while let Ok(task) = rx.try_recv() {
        task();
        ran += 1;
    }
    ran
}
