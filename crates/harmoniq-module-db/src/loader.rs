//! Fixed worker pool that performs dynamic loads for handle batches.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::dynamic::DynamicLoader;
use crate::error::ModuleDbError;
use crate::metrics::Counters;
use crate::node::{HandleInfo, NodeRef};
use crate::queue::BoundedQueue;
use crate::voter::ResourceVoter;

/// Completion callback of a batch. Receives the batch with every entry resolved.
pub type Completion = Box<dyn FnOnce(Vec<HandleInfo>) + Send + 'static>;

/// Sizes of the loader's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoaderLimits {
    pub(crate) worker_threads: usize,
    pub(crate) task_queue_depth: usize,
    pub(crate) session_pool_size: usize,
}

pub(crate) enum LoaderMessage {
    Load(LoaderTask),
    Vote,
    ReleaseVote,
    ThreadExit,
}

pub(crate) struct LoaderTask {
    session: Arc<LoaderSession>,
    index: usize,
    node: NodeRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionSlot(usize);

/// Completion tracking for one batch.
///
/// The count starts at one for the submitting thread and grows by one per
/// task; the callback fires when it drops back to zero.
pub(crate) struct LoaderSession {
    slot: SessionSlot,
    refs: AtomicUsize,
    batch: Mutex<Vec<HandleInfo>>,
    callback: Mutex<Option<Completion>>,
    shared: Arc<LoaderShared>,
}

/// Balances votes and releases that different workers may apply out of order.
#[derive(Debug, Default)]
struct VoteLedger {
    raised: usize,
    early_releases: usize,
}

struct LoaderShared {
    tasks: BoundedQueue<LoaderMessage>,
    slots: BoundedQueue<SessionSlot>,
    dynamic: Arc<DynamicLoader>,
    voter: Arc<dyn ResourceVoter>,
    votes: Mutex<VoteLedger>,
    counters: Arc<Counters>,
    accepting: AtomicBool,
    /// Set once the workers are joined; nothing drains the queue after that.
    stopped: Mutex<bool>,
}

pub(crate) struct ParallelLoader {
    shared: Arc<LoaderShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ParallelLoader {
    /// Starts the worker pool.
    ///
    /// A failed spawn only aborts the launch when no worker could be started;
    /// otherwise the loader runs with the workers it has.
    pub(crate) fn launch(
        limits: LoaderLimits,
        dynamic: Arc<DynamicLoader>,
        voter: Arc<dyn ResourceVoter>,
        counters: Arc<Counters>,
    ) -> Result<Self, ModuleDbError> {
        if limits.worker_threads == 0 || limits.task_queue_depth == 0 || limits.session_pool_size == 0 {
            return Err(ModuleDbError::BadParam(format!(
                "loader limits must be non-zero: {limits:?}"
            )));
        }

        let slots = BoundedQueue::new(limits.session_pool_size);
        for slot in 0..limits.session_pool_size {
            slots.push(SessionSlot(slot));
        }
        let shared = Arc::new(LoaderShared {
            tasks: BoundedQueue::new(limits.task_queue_depth),
            slots,
            dynamic,
            voter,
            votes: Mutex::new(VoteLedger::default()),
            counters,
            accepting: AtomicBool::new(true),
            stopped: Mutex::new(false),
        });

        let mut workers = Vec::with_capacity(limits.worker_threads);
        for index in 0..limits.worker_threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("module-db-loader-{index}"))
                .spawn(move || worker_shared.run_worker());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    tracing::error!(index, error = %err, "failed to spawn loader thread");
                    break;
                }
            }
        }

        if workers.is_empty() {
            shared.accepting.store(false, Ordering::Release);
            return Err(ModuleDbError::NotReady(
                "no loader thread could be started".into(),
            ));
        }
        if workers.len() < limits.worker_threads {
            tracing::warn!(
                requested = limits.worker_threads,
                running = workers.len(),
                "parallel loader running with fewer threads"
            );
        }
        tracing::debug!(workers = workers.len(), "parallel loader launched");

        Ok(Self { shared, workers })
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Takes a free session slot and raises the batch's resource vote.
    ///
    /// Blocks while every slot is in use by other batches.
    pub(crate) fn get_session(
        &self,
        batch: Vec<HandleInfo>,
        callback: Completion,
    ) -> Result<Arc<LoaderSession>, (ModuleDbError, Vec<HandleInfo>, Completion)> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err((
                ModuleDbError::NotReady("parallel loader is shut down".into()),
                batch,
                callback,
            ));
        }

        let slot = self.shared.slots.pop();
        self.shared.counters.session_started();
        self.shared.tasks.push(LoaderMessage::Vote);
        tracing::debug!(slot = slot.0, entries = batch.len(), "loader session started");

        Ok(Arc::new(LoaderSession {
            slot,
            refs: AtomicUsize::new(1),
            batch: Mutex::new(batch),
            callback: Mutex::new(Some(callback)),
            shared: Arc::clone(&self.shared),
        }))
    }

    /// Queues a load of `node` into entry `index` of the session's batch.
    pub(crate) fn push_task(&self, session: &Arc<LoaderSession>, index: usize, node: NodeRef) {
        session.refs.fetch_add(1, Ordering::AcqRel);
        self.shared.tasks.push(LoaderMessage::Load(LoaderTask {
            session: Arc::clone(session),
            index,
            node,
        }));
    }

    /// Drops the submitter's reference on the session.
    ///
    /// The last reference runs the completion callback, so callers must not
    /// hold locks the callback could need.
    pub(crate) fn release_session(session: &LoaderSession) {
        session.release();
    }

    /// Stops accepting batches, sends one exit message per worker and joins them.
    ///
    /// When called from a completion callback running on a loader thread, that
    /// thread is left to exit on its own once the callback returns.
    pub(crate) fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.accepting.store(false, Ordering::Release);
        for _ in 0..self.workers.len() {
            self.shared.tasks.push(LoaderMessage::ThreadExit);
        }
        let current = thread::current().id();
        let mut detached = 0;
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                detached += 1;
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("loader thread panicked");
            }
        }

        *self.shared.stopped.lock() = true;
        while let Ok(message) = self.shared.tasks.try_pop() {
            match message {
                LoaderMessage::Vote => self.shared.apply_vote(),
                LoaderMessage::ReleaseVote => self.shared.apply_release(),
                LoaderMessage::Load(task) => self.shared.execute(task),
                LoaderMessage::ThreadExit => {}
            }
        }
        for _ in 0..detached {
            if self.shared.tasks.try_push(LoaderMessage::ThreadExit).is_err() {
                tracing::error!("no room to stop the calling loader thread");
            }
        }
        tracing::debug!(detached, "parallel loader shut down");
    }
}

impl Drop for ParallelLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ParallelLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelLoader")
            .field("workers", &self.workers.len())
            .field("queued", &self.shared.tasks.len())
            .field("free_sessions", &self.shared.slots.len())
            .finish()
    }
}

impl LoaderShared {
    fn run_worker(&self) {
        loop {
            match self.tasks.pop() {
                LoaderMessage::Load(task) => self.execute(task),
                LoaderMessage::Vote => self.apply_vote(),
                LoaderMessage::ReleaseVote => self.apply_release(),
                LoaderMessage::ThreadExit => break,
            }
        }
    }

    fn execute(&self, task: LoaderTask) {
        self.counters.task_executed();
        let LoaderTask {
            session,
            index,
            node,
        } = task;

        let outcome = self.dynamic.load(&node);
        {
            let mut batch = session.batch.lock();
            match (batch.get_mut(index), outcome) {
                (Some(info), Ok(loaded)) => {
                    info.handle = Some(node.into_handle(
                        Some(loaded.entry_points),
                        true,
                        loaded.from_fallback,
                    ));
                    info.result = Ok(());
                }
                (Some(info), Err(err)) => {
                    drop(node);
                    info.fail(err);
                }
                (None, outcome) => {
                    tracing::error!(index, "load task points outside its batch");
                    if let Ok(loaded) = outcome {
                        drop(node.into_handle(Some(loaded.entry_points), true, loaded.from_fallback));
                    }
                }
            }
        }
        session.release();
    }

    /// Workers never block on the queue they drain, so a full queue gets the
    /// release applied in place. So does a stopped loader.
    fn post_release_vote(&self) {
        let stopped = self.stopped.lock();
        if *stopped || self.tasks.try_push(LoaderMessage::ReleaseVote).is_err() {
            drop(stopped);
            self.apply_release();
        }
    }

    fn apply_vote(&self) {
        let mut ledger = self.votes.lock();
        self.voter.vote();
        if ledger.early_releases > 0 {
            ledger.early_releases -= 1;
            self.voter.release();
        } else {
            ledger.raised += 1;
        }
    }

    /// A release that overtakes its vote is held back until the vote lands.
    fn apply_release(&self) {
        let mut ledger = self.votes.lock();
        if ledger.raised > 0 {
            ledger.raised -= 1;
            self.voter.release();
        } else {
            ledger.early_releases += 1;
        }
    }
}

impl LoaderSession {
    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let batch = std::mem::take(&mut *self.batch.lock());
        let resolved = batch.iter().filter(|info| info.is_resolved()).count();
        tracing::debug!(
            slot = self.slot.0,
            entries = batch.len(),
            resolved,
            "loader session finished"
        );
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(batch);
        }

        if self.shared.slots.try_push(self.slot).is_err() {
            tracing::error!(slot = self.slot.0, "session pool overflow");
        }
        self.shared.post_release_vote();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::ModuleType;
    use crate::error::LinkError;
    use crate::linker::{DynamicLinker, LoadedUnit};
    use crate::node::ModuleNode;
    use crate::registration::{ModuleRegistration, ModuleSource};
    use crate::voter::CountingVoter;

    struct RefusingLinker;

    impl DynamicLinker for RefusingLinker {
        fn open(&self, path: &Path) -> Result<Box<dyn LoadedUnit>, LinkError> {
            Err(LinkError::MissingUnit(path.to_path_buf()))
        }
    }

    const LIMITS: LoaderLimits = LoaderLimits {
        worker_threads: 2,
        task_queue_depth: 4,
        session_pool_size: 2,
    };

    fn launch(limits: LoaderLimits, voter: Arc<CountingVoter>) -> (ParallelLoader, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let dynamic = Arc::new(DynamicLoader::new(
            Arc::new(RefusingLinker),
            HashMap::new(),
            Arc::clone(&counters),
            None,
        ));
        let loader = ParallelLoader::launch(limits, dynamic, voter, Arc::clone(&counters)).unwrap();
        (loader, counters)
    }

    fn dynamic_node(module_id: u32, counters: &Arc<Counters>) -> NodeRef {
        let registration = ModuleRegistration::new(
            ModuleType::GENERIC,
            module_id,
            ModuleSource::dynamic("/lib/absent.so", "absent"),
        );
        NodeRef::adopt(ModuleNode::new(registration, Arc::clone(counters)).unwrap())
    }

    #[test]
    fn zero_sized_limits_are_rejected() {
        let counters = Arc::new(Counters::default());
        let dynamic = Arc::new(DynamicLoader::new(
            Arc::new(RefusingLinker),
            HashMap::new(),
            Arc::clone(&counters),
            None,
        ));
        let limits = LoaderLimits {
            worker_threads: 0,
            ..LIMITS
        };
        assert!(matches!(
            ParallelLoader::launch(limits, dynamic, Arc::new(CountingVoter::new()), counters),
            Err(ModuleDbError::BadParam(_))
        ));
    }

    #[test]
    fn session_completes_once_after_every_task() {
        let voter = Arc::new(CountingVoter::new());
        let (mut loader, counters) = launch(LIMITS, Arc::clone(&voter));
        assert_eq!(loader.worker_count(), 2);

        let (sender, receiver) = mpsc::channel();
        let session = loader
            .get_session(
                HandleInfo::batch(&[1, 2, 3]),
                Box::new(move |batch| sender.send(batch).unwrap()),
            )
            .ok()
            .unwrap();

        let nodes: Vec<_> = (1..=3).map(|id| dynamic_node(id, &counters)).collect();
        for (index, node) in nodes.iter().enumerate() {
            loader.push_task(&session, index, node.clone());
        }
        ParallelLoader::release_session(&session);

        let batch = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch
            .iter()
            .all(|info| matches!(info.result, Err(ModuleDbError::LoadFailure { .. }))));
        assert!(receiver.try_recv().is_err());
        for node in &nodes {
            assert_eq!(node.mem_refs(), 1);
        }

        loader.shutdown();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.tasks_executed, 3);
        assert_eq!((voter.total(), voter.active()), (1, 0));
    }

    #[test]
    fn release_overtaking_its_vote_stays_balanced() {
        let voter = Arc::new(CountingVoter::new());
        let (mut loader, _) = launch(LIMITS, Arc::clone(&voter));

        loader.shared.apply_release();
        assert_eq!((voter.total(), voter.active()), (0, 0));
        loader.shared.apply_vote();
        assert_eq!((voter.total(), voter.active()), (1, 0));

        loader.shared.apply_vote();
        assert_eq!(voter.active(), 1);
        loader.shared.apply_release();
        assert_eq!((voter.total(), voter.active()), (2, 0));

        loader.shutdown();
    }

    #[test]
    fn release_after_shutdown_is_applied_in_place() {
        let voter = Arc::new(CountingVoter::new());
        let (mut loader, _) = launch(LIMITS, Arc::clone(&voter));
        let session = loader
            .get_session(HandleInfo::batch(&[1]), Box::new(|_| {}))
            .ok()
            .unwrap();
        loader.shutdown();
        assert_eq!(voter.active(), 1);

        ParallelLoader::release_session(&session);
        assert_eq!((voter.total(), voter.active()), (1, 0));
        assert!(loader.shared.tasks.is_empty());
    }

    #[test]
    fn shut_down_loader_refuses_sessions() {
        let (mut loader, _) = launch(LIMITS, Arc::new(CountingVoter::new()));
        loader.shutdown();
        let refused = loader.get_session(Vec::new(), Box::new(|_| {}));
        assert!(matches!(refused, Err((ModuleDbError::NotReady(_), _, _))));
    }
}
