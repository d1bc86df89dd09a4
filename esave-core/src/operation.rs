/*!
One-shot save/load operations.

An [`Operation`] wraps a single action and tracks it through
`None -> Ongoing -> {Completed | Failed | Canceled}`. The action either runs
inline on the calling thread or on its own worker thread.

Listeners registered with [`Operation::on_ended`] fire exactly once, when the
operation reaches a terminal state. For background operations that
notification is not delivered on the worker: it is posted to the
[`Dispatcher`] the operation was created with, and runs when the owning
thread calls [`Dispatcher::pump`] (typically once per frame of the host's
main loop).

Cancellation is cooperative. [`Operation::cancel`] raises a flag on the
operation's [`CancellationToken`], and the action checks it between its
discrete steps; a write that is already in progress is allowed to finish.
*/

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
#[cfg(feature = "metrics")]
use std::time::Instant;

use tracing::{debug, warn};

use crate::{Result, SaveError};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What an operation does to its save file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Save,
    Load,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Save => f.write_str("save"),
            OperationKind::Load => f.write_str("load"),
        }
    }
}

/// Operation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    None,
    Ongoing,
    Completed,
    Canceled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Canceled | OperationState::Failed
        )
    }
}

/// Shared cancellation flag checked by running actions
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(SaveError::Canceled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(SaveError::Canceled)
        } else {
            Ok(())
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Queue of completion callbacks owned by the thread that starts operations
///
/// Clones share the same queue. Only the owning thread should call
/// [`pump`](Dispatcher::pump).
#[derive(Clone)]
pub struct Dispatcher {
    sender: Sender<Callback>,
    receiver: Arc<Mutex<Receiver<Callback>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Queue a callback to run on the next [`pump`](Dispatcher::pump)
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The receiver lives as long as any clone of this dispatcher, so this cannot fail.
        let _ = self.sender.send(Box::new(callback));
    }

    /// Run every queued callback on the current thread; returns how many ran
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = lock(&self.receiver).try_recv();
            match next {
                Ok(callback) => {
                    callback();
                    ran += 1;
                }
                Err(_) => return ran,
            }
        }
    }
}

/// Work performed by an operation
pub type Action = Box<dyn FnOnce(&CancellationToken) -> Result<()> + Send + 'static>;

type Listener = Box<dyn FnOnce(OperationState) + Send + 'static>;

#[derive(Default)]
struct Status {
    state: OperationState,
    error: Option<String>,
    listeners: Vec<Listener>,
    notified: bool,
}

struct Shared {
    kind: OperationKind,
    background: bool,
    token: CancellationToken,
    status: Mutex<Status>,
    action: Mutex<Option<Action>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn run(&self, action: Action) {
        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| action(&self.token)))
            .unwrap_or_else(|_| Err(SaveError::storage("operation panicked")));

        let state = {
            let mut status = lock(&self.status);
            let state = match outcome {
                Ok(()) => OperationState::Completed,
                Err(SaveError::Canceled) => {
                    debug!(kind = %self.kind, "Save file operation canceled");
                    OperationState::Canceled
                }
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, "Save file operation failed");
                    status.error = Some(e.to_string());
                    OperationState::Failed
                }
            };
            status.state = state;
            state
        };

        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::SaveMetrics::global() {
            metrics.record_operation(self.kind, state, started.elapsed());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = state;
    }

    /// Fire and clear listeners; later listeners run immediately on registration
    fn notify(&self) {
        let (state, listeners) = {
            let mut status = lock(&self.status);
            status.notified = true;
            (status.state, std::mem::take(&mut status.listeners))
        };

        for listener in listeners {
            listener(state);
        }
    }
}

/// A one-shot save or load task with an observable terminal state
///
/// Cloning yields another handle to the same operation.
///
/// # Example
/// ```rust
/// use esave_core::operation::{Dispatcher, Operation, OperationKind, OperationState};
///
/// let dispatcher = Dispatcher::new();
/// let op = Operation::new(OperationKind::Save, false, dispatcher, Box::new(|_token| Ok(())));
/// op.start();
/// assert_eq!(op.state(), OperationState::Completed);
/// ```
#[derive(Clone)]
pub struct Operation {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.shared.kind)
            .field("background", &self.shared.background)
            .field("state", &self.state())
            .finish()
    }
}

impl Operation {
    /// Create an operation; nothing runs until [`start`](Operation::start)
    pub fn new(
        kind: OperationKind,
        background: bool,
        dispatcher: Dispatcher,
        action: Action,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                background,
                token: CancellationToken::new(),
                status: Mutex::new(Status::default()),
                action: Mutex::new(Some(action)),
                worker: Mutex::new(None),
            }),
            dispatcher,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.shared.kind
    }

    pub fn is_background(&self) -> bool {
        self.shared.background
    }

    /// The current state of the operation
    pub fn state(&self) -> OperationState {
        lock(&self.shared.status).state
    }

    /// Failure message if the operation ended in [`OperationState::Failed`]
    pub fn error(&self) -> Option<String> {
        lock(&self.shared.status).error.clone()
    }

    pub fn is_ongoing(&self) -> bool {
        self.state() == OperationState::Ongoing
    }

    /// Run the action
    ///
    /// Synchronous operations finish and notify listeners before this
    /// returns. Background operations return immediately; their listeners run
    /// on a later [`Dispatcher::pump`]. Calling `start` twice has no effect.
    pub fn start(&self) {
        let action = lock(&self.shared.action).take();
        let Some(action) = action else {
            debug!(kind = %self.shared.kind, "Operation already started");
            return;
        };

        {
            let mut status = lock(&self.shared.status);
            if status.state != OperationState::None {
                return;
            }
            status.state = OperationState::Ongoing;
        }

        if !self.shared.background {
            self.shared.run(action);
            self.shared.notify();
            return;
        }

        let shared = Arc::clone(&self.shared);
        let dispatcher = self.dispatcher.clone();
        let spawned = thread::Builder::new()
            .name(format!("esave-{}", self.shared.kind))
            .spawn(move || {
                shared.run(action);
                let notifier = Arc::clone(&shared);
                dispatcher.post(move || notifier.notify());
            });

        match spawned {
            Ok(handle) => *lock(&self.shared.worker) = Some(handle),
            Err(e) => {
                warn!(kind = %self.shared.kind, error = %e, "Failed to spawn save file worker");
                {
                    let mut status = lock(&self.shared.status);
                    status.state = OperationState::Failed;
                    status.error = Some(format!("failed to spawn worker: {e}"));
                }
                self.shared.notify();
            }
        }
    }

    /// Request cancellation
    ///
    /// An operation that has not started is canceled on the spot. A running
    /// one stops at its next checkpoint and ends as `Canceled`; if it is past
    /// its last checkpoint it still completes normally. Returns `false` if the
    /// operation had already ended.
    pub fn cancel(&self) -> bool {
        let mut status = lock(&self.shared.status);
        let state = status.state;
        match state {
            OperationState::None => {
                status.state = OperationState::Canceled;
                drop(status);
                lock(&self.shared.action).take();
                self.shared.token.cancel();
                self.shared.notify();
                true
            }
            OperationState::Ongoing => {
                self.shared.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Register a one-shot listener for the terminal state
    pub fn on_ended<F>(&self, listener: F)
    where
        F: FnOnce(OperationState) + Send + 'static,
    {
        let mut status = lock(&self.shared.status);
        if status.notified {
            let state = status.state;
            drop(status);
            listener(state);
        } else {
            status.listeners.push(Box::new(listener));
        }
    }

    /// Block until a background worker has finished
    ///
    /// Listeners are still delivered through the dispatcher afterwards.
    /// Returns the state reached.
    pub fn wait(&self) -> OperationState {
        let handle = lock(&self.shared.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(kind = %self.shared.kind, "Save file worker panicked");
            }
        }
        self.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let reader = Arc::clone(&count);
        (count, move || reader.load(Ordering::SeqCst))
    }

    #[test]
    fn test_synchronous_operation_completes_inline() {
        let dispatcher = Dispatcher::new();
        let op = Operation::new(
            OperationKind::Save,
            false,
            dispatcher.clone(),
            Box::new(|_| Ok(())),
        );
        assert_eq!(op.state(), OperationState::None);

        op.start();
        assert_eq!(op.state(), OperationState::Completed);
        assert!(op.error().is_none());
        assert_eq!(dispatcher.pump(), 0);
    }

    #[test]
    fn test_failure_is_captured() {
        let op = Operation::new(
            OperationKind::Load,
            false,
            Dispatcher::new(),
            Box::new(|_| Err(SaveError::storage("disk on fire"))),
        );
        op.start();

        assert_eq!(op.state(), OperationState::Failed);
        assert!(op.error().unwrap().contains("disk on fire"));
    }

    #[test]
    fn test_panic_is_captured_as_failure() {
        let op = Operation::new(
            OperationKind::Save,
            false,
            Dispatcher::new(),
            Box::new(|_| panic!("boom")),
        );
        op.start();
        assert_eq!(op.state(), OperationState::Failed);
    }

    #[test]
    fn test_listeners_fire_once_then_clear() {
        let (count, fired) = counter();
        let op = Operation::new(
            OperationKind::Save,
            false,
            Dispatcher::new(),
            Box::new(|_| Ok(())),
        );

        let c = Arc::clone(&count);
        op.on_ended(move |state| {
            assert_eq!(state, OperationState::Completed);
            c.fetch_add(1, Ordering::SeqCst);
        });
        op.start();
        op.start();

        assert_eq!(fired(), 1);
    }

    #[test]
    fn test_late_listener_runs_immediately() {
        let (count, fired) = counter();
        let op = Operation::new(
            OperationKind::Save,
            false,
            Dispatcher::new(),
            Box::new(|_| Ok(())),
        );
        op.start();

        let c = Arc::clone(&count);
        op.on_ended(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired(), 1);
    }

    #[test]
    fn test_background_completion_is_marshaled_to_dispatcher() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = channel();
        let op = Operation::new(
            OperationKind::Save,
            true,
            dispatcher.clone(),
            Box::new(|_| Ok(())),
        );

        let main_thread = thread::current().id();
        op.on_ended(move |state| {
            tx.send((state, thread::current().id())).unwrap();
        });
        op.start();

        assert_eq!(op.wait(), OperationState::Completed);
        assert!(rx.try_recv().is_err());

        assert_eq!(dispatcher.pump(), 1);
        let (state, thread_id) = rx.try_recv().unwrap();
        assert_eq!(state, OperationState::Completed);
        assert_eq!(thread_id, main_thread);
    }

    #[test]
    fn test_cooperative_cancel_of_background_operation() {
        let dispatcher = Dispatcher::new();
        let (started_tx, started_rx) = channel();
        let op = Operation::new(
            OperationKind::Save,
            true,
            dispatcher.clone(),
            Box::new(move |token| {
                started_tx.send(()).unwrap();
                while !token.is_canceled() {
                    thread::sleep(Duration::from_millis(1));
                }
                token.check()
            }),
        );

        op.start();
        started_rx.recv().unwrap();
        assert!(op.is_ongoing());
        assert!(op.cancel());

        assert_eq!(op.wait(), OperationState::Canceled);
        assert!(op.error().is_none());
        assert!(!op.cancel());
    }

    #[test]
    fn test_cancel_before_start() {
        let (count, fired) = counter();
        let op = Operation::new(
            OperationKind::Load,
            false,
            Dispatcher::new(),
            Box::new(|_| Ok(())),
        );
        let c = Arc::clone(&count);
        op.on_ended(move |state| {
            assert_eq!(state, OperationState::Canceled);
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(op.cancel());
        op.start();

        assert_eq!(op.state(), OperationState::Canceled);
        assert_eq!(fired(), 1);
    }

    #[test]
    fn test_dispatcher_runs_callbacks_in_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            dispatcher.post(move || log.lock().unwrap().push(i));
        }

        assert_eq!(dispatcher.pump(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(dispatcher.pump(), 0);
    }
}
