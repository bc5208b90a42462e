//! Reactor pool: one OS thread per reactor hosting cooperative fibers.
//!
//! Each reactor thread runs a current-thread tokio runtime with a `LocalSet`.
//! Fibers are local tasks; they preempt only at explicit suspension points.
//! Closures submitted through [`ProactorPool::run_on`] execute synchronously
//! on the reactor's dispatcher and therefore can never suspend, which is the
//! invariant `await_brief` callers rely on for tight stats aggregation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use darter_common::error::{DarterError, DarterResult};
use tokio::runtime::Builder as TokioBuilder;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

/// Boxed non-`Send` future spawned as one fiber on a reactor.
pub type LocalFiberFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

enum ReactorTask {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Pending result of one closure dispatched to a reactor.
#[derive(Debug)]
pub struct ReactorCall<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> ReactorCall<R> {
    /// Blocks the calling thread until the closure ran.
    ///
    /// Must only be called from threads outside the pool; a reactor thread
    /// waiting on its own queue would deadlock (and tokio refuses a blocking
    /// receive inside a runtime for exactly that reason).
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the target reactor stopped
    /// before running the closure.
    pub fn get(self) -> DarterResult<R> {
        self.receiver
            .blocking_recv()
            .map_err(|_| DarterError::InvalidState("reactor stopped before running closure"))
    }

    /// Awaits the closure result from a fiber.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the target reactor stopped
    /// before running the closure.
    pub async fn value(self) -> DarterResult<R> {
        self.receiver
            .await
            .map_err(|_| DarterError::InvalidState("reactor stopped before running closure"))
    }
}

/// Join handle for one launched fiber.
#[derive(Debug)]
pub struct FiberHandle {
    done: oneshot::Receiver<()>,
}

impl FiberHandle {
    /// Awaits fiber completion from another fiber.
    pub async fn join(self) {
        let _ = self.done.await;
    }

    /// Blocks the calling (non-reactor) thread until the fiber finished.
    pub fn join_blocking(self) {
        let _ = self.done.blocking_recv();
    }
}

struct ReactorHandle {
    sender: mpsc::UnboundedSender<ReactorTask>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Fixed pool of reactor threads.
pub struct ProactorPool {
    reactors: Vec<ReactorHandle>,
    next_periodic_id: AtomicU64,
    periodics: Mutex<Vec<(u64, Arc<AtomicBool>)>>,
}

impl std::fmt::Debug for ProactorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProactorPool")
            .field("reactors", &self.reactors.len())
            .finish_non_exhaustive()
    }
}

impl ProactorPool {
    /// Spawns `reactor_count` reactor threads.
    ///
    /// A count of zero is normalized to one.
    #[must_use]
    pub fn new(reactor_count: u16) -> Self {
        let reactor_count = reactor_count.max(1);
        let mut reactors = Vec::with_capacity(usize::from(reactor_count));
        for index in 0..reactor_count {
            let (sender, receiver) = mpsc::unbounded_channel::<ReactorTask>();
            let thread = thread::Builder::new()
                .name(format!("darter-reactor-{index}"))
                .spawn(move || reactor_thread_main(receiver))
                .ok();
            reactors.push(ReactorHandle { sender, thread });
        }
        Self {
            reactors,
            next_periodic_id: AtomicU64::new(1),
            periodics: Mutex::new(Vec::new()),
        }
    }

    /// Number of reactors in the pool.
    #[must_use]
    pub fn size(&self) -> u16 {
        u16::try_from(self.reactors.len()).unwrap_or(u16::MAX)
    }

    fn sender(&self, index: u16) -> DarterResult<&mpsc::UnboundedSender<ReactorTask>> {
        self.reactors
            .get(usize::from(index))
            .map(|reactor| &reactor.sender)
            .ok_or(DarterError::InvalidState("reactor index is out of range"))
    }

    /// Dispatches one synchronous closure to a reactor.
    ///
    /// The closure runs on the reactor's dispatcher between fiber polls, so it
    /// must not suspend and should stay short unless the caller deliberately
    /// accepts blocking that reactor (snapshot body serialization does).
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the reactor index is out of
    /// range or its queue is closed.
    pub fn run_on<R, F>(&self, index: u16, f: F) -> DarterResult<ReactorCall<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel::<R>();
        self.sender(index)?
            .send(ReactorTask::Run(Box::new(move || {
                let _ = result_tx.send(f());
            })))
            .map_err(|_| DarterError::InvalidState("reactor queue is closed"))?;
        Ok(ReactorCall {
            receiver: result_rx,
        })
    }

    /// Runs one non-suspending closure on a reactor and blocks for its result.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the reactor is unavailable.
    pub fn await_brief<R, F>(&self, index: u16, f: F) -> DarterResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.run_on(index, f)?.get()
    }

    /// Launches one fire-and-forget fiber on a reactor.
    ///
    /// The factory runs on the reactor thread and returns the fiber future,
    /// so the future itself does not need to be `Send`.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the reactor is unavailable.
    pub fn launch_fiber_on<F>(&self, index: u16, factory: F) -> DarterResult<FiberHandle>
    where
        F: FnOnce() -> LocalFiberFuture + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        self.sender(index)?
            .send(ReactorTask::Run(Box::new(move || {
                let fiber = factory();
                let _ = tokio::task::spawn_local(async move {
                    fiber.await;
                    let _ = done_tx.send(());
                });
            })))
            .map_err(|_| DarterError::InvalidState("reactor queue is closed"))?;
        Ok(FiberHandle { done: done_rx })
    }

    /// Registers one periodic callback on a reactor.
    ///
    /// Returns an id usable with [`ProactorPool::cancel_periodic`].
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the reactor is unavailable.
    pub fn add_periodic<F>(&self, index: u16, period: Duration, f: F) -> DarterResult<u64>
    where
        F: Fn() + Send + 'static,
    {
        let id = self.next_periodic_id.fetch_add(1, Ordering::AcqRel);
        let alive = Arc::new(AtomicBool::new(true));
        self.periodics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::clone(&alive)));

        let _ = self.launch_fiber_on(index, move || {
            Box::pin(async move {
                let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    let _ = ticker.tick().await;
                    if !alive.load(Ordering::Acquire) {
                        break;
                    }
                    f();
                }
            })
        })?;
        Ok(id)
    }

    /// Cancels one periodic callback; unknown ids are ignored.
    pub fn cancel_periodic(&self, id: u64) {
        let mut periodics = self
            .periodics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(position) = periodics.iter().position(|(entry_id, _)| *entry_id == id) {
            let (_, alive) = periodics.swap_remove(position);
            alive.store(false, Ordering::Release);
        }
    }
}

impl Drop for ProactorPool {
    fn drop(&mut self) {
        {
            let periodics = self
                .periodics
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (_, alive) in periodics.iter() {
                alive.store(false, Ordering::Release);
            }
        }
        for reactor in &self.reactors {
            let _ = reactor.sender.send(ReactorTask::Shutdown);
        }
        for reactor in &mut self.reactors {
            if let Some(thread) = reactor.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn reactor_thread_main(mut receiver: mpsc::UnboundedReceiver<ReactorTask>) {
    let Ok(runtime) = TokioBuilder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
    else {
        return;
    };

    let local_set = LocalSet::new();
    runtime.block_on(local_set.run_until(async move {
        while let Some(task) = receiver.recv().await {
            match task {
                ReactorTask::Run(f) => f(),
                ReactorTask::Shutdown => break,
            }
        }
    }));
}
