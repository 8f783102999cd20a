//! The client manager and transaction fibers.
//!
//! `ClientManager` owns the store handle, the shared [`ClientContext`]
//! and a pool of worker threads. `start_transaction` schedules a closure
//! onto a worker: the worker obtains a snapshot, builds a [`Transaction`]
//! and runs the closure with it plus the typed shared context. The
//! returned [`TransactionFiber`] lets the submitter wait for the result
//! or cooperate with the running closure through a single-slot rendezvous
//! ([`TransactionFiber::unblock`] / [`FiberContext::block`]).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use stratadb_store::{RecordStore, TransactionType};

use crate::context::ClientContext;
use crate::error::TxResult;
use crate::transaction::Transaction;

/// Configuration for a [`ClientManager`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Worker threads running transaction fibers.
    pub num_workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { num_workers: 4 }
    }
}

/// A single-slot rendezvous between a fiber and its submitter.
#[derive(Debug, Default)]
pub struct Rendezvous {
    slot: Mutex<bool>,
    cv: Condvar,
}

impl Rendezvous {
    /// Blocks until the peer signals, consuming the signal.
    pub fn wait(&self) {
        let mut slot = self.slot.lock();
        while !*slot {
            self.cv.wait(&mut slot);
        }
        *slot = false;
    }

    /// Deposits a signal, waking one waiter. A second signal before the
    /// first is consumed is coalesced.
    pub fn signal(&self) {
        let mut slot = self.slot.lock();
        *slot = true;
        self.cv.notify_one();
    }
}

/// What a transaction closure sees besides the transaction itself: the
/// manager's typed shared context and its end of the rendezvous.
pub struct FiberContext<Ctx> {
    shared: Arc<Ctx>,
    rendezvous: Arc<Rendezvous>,
}

impl<Ctx> FiberContext<Ctx> {
    /// The shared context.
    #[must_use]
    pub fn shared(&self) -> &Ctx {
        &self.shared
    }

    /// Suspends the fiber until the submitter calls
    /// [`TransactionFiber::unblock`].
    pub fn block(&self) {
        self.rendezvous.wait();
    }
}

/// Handle to a transaction running on a worker.
pub struct TransactionFiber {
    result: mpsc::Receiver<TxResult<()>>,
    rendezvous: Arc<Rendezvous>,
}

impl TransactionFiber {
    /// Waits for the transaction closure to finish and returns its
    /// result.
    pub fn wait(self) -> TxResult<()> {
        self.result
            .recv()
            .unwrap_or_else(|_| panic!("transaction fiber disappeared"))
    }

    /// Wakes a fiber suspended in [`FiberContext::block`].
    pub fn unblock(&self) {
        self.rendezvous.signal();
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of worker threads consuming transaction jobs.
struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size.max(1))
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("strata-worker-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = receiver.lock();
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    fn submit(&self, job: Job) {
        self.sender
            .as_ref()
            .expect("pool is live until drop")
            .send(job)
            .expect("worker pool hung up");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Entry point: owns the store connection, the shared client context and
/// the worker pool.
///
/// The type parameter is the user's shared per-process context, handed to
/// every transaction closure.
pub struct ClientManager<Ctx: Send + Sync + 'static = ()> {
    store: Arc<dyn RecordStore>,
    context: Arc<ClientContext>,
    shared: Arc<Ctx>,
    pool: WorkerPool,
}

impl<Ctx: Send + Sync + 'static> ClientManager<Ctx> {
    /// Connects a manager to a store, bootstrapping the client context.
    pub fn with_shared(
        store: Arc<dyn RecordStore>,
        config: ClientConfig,
        shared: Ctx,
    ) -> TxResult<Self> {
        let context = ClientContext::bootstrap(Arc::clone(&store))?;
        debug!(client = context.client_id(), "client manager ready");
        Ok(Self {
            store,
            context,
            shared: Arc::new(shared),
            pool: WorkerPool::new(config.num_workers),
        })
    }

    /// The bootstrapped client context.
    #[must_use]
    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    /// Schedules a transaction closure onto a worker.
    ///
    /// The closure must call [`Transaction::commit`] itself; returning
    /// without committing rolls the transaction back.
    pub fn start_transaction<F>(&self, ty: TransactionType, f: F) -> TransactionFiber
    where
        F: FnOnce(Transaction, &FiberContext<Ctx>) -> TxResult<()> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let rendezvous = Arc::new(Rendezvous::default());
        let fiber_ctx = FiberContext {
            shared: Arc::clone(&self.shared),
            rendezvous: Arc::clone(&rendezvous),
        };
        let store = Arc::clone(&self.store);
        let context = Arc::clone(&self.context);
        self.pool.submit(Box::new(move || {
            let result = (|| {
                let snapshot = store.start_transaction(ty)?;
                let tx = Transaction::new(Arc::clone(&store), context, snapshot, ty);
                f(tx, &fiber_ctx)
            })();
            // The fiber may have finished unwaited; ignore a closed channel.
            let _ = result_tx.send(result);
        }));
        TransactionFiber {
            result: result_rx,
            rendezvous,
        }
    }
}

impl ClientManager<()> {
    /// A manager without user-shared context.
    pub fn new(store: Arc<dyn RecordStore>, config: ClientConfig) -> TxResult<Self> {
        Self::with_shared(store, config, ())
    }
}
