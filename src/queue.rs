use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, debug_span, warn};

use crate::{
    access::{AccessFlags, AccessIndex},
    barrier::{OrderingRule, SemaphoreScope},
    context::{AccessContext, ResourceId},
    range::{AccessRange, TagRange},
    scope::{access_scope, ExecScope},
    semaphore::{SemaphoreId, SemaphoreRegistry, SignalInfo},
    stage::{PipelineStages, QueueFlags},
    state::{
        HazardResult, SyncFlags, TagSet, WaitAcquirePredicate, WaitQueueTagPredicate,
        WaitTagPredicate,
    },
    QueueId, Tag, TagEx, ValidatorConfig,
};

/// Submission rejection causes. All are validated before any access state is
/// touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown semaphore handle")]
    UnknownSemaphore,

    #[error("binary operation on a timeline semaphore or vice versa")]
    SemaphoreKindMismatch,

    #[error("binary semaphore already has an outstanding signal")]
    BinarySemaphoreAlreadySignaled,

    #[error("binary semaphore wait submitted without a matching signal")]
    BinarySemaphoreNotSignaled,

    #[error("timeline semaphore value decreased: last {last}, submitted {submitted}")]
    TimelineValueDecreased { last: u64, submitted: u64 },

    #[error("two queues signal the resolving timeline value; wait is ambiguous")]
    AmbiguousTimelineResolve,

    #[error("unknown queue index")]
    UnknownQueue,
}

/// A semaphore operation attached to a submission. `value` is ignored for
/// binary semaphores.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreOp {
    pub semaphore: SemaphoreId,
    pub value: u64,
    /// Stage mask of the wait's second scope or the signal's first scope.
    pub stages: PipelineStages,
}

impl SemaphoreOp {
    pub fn binary(semaphore: SemaphoreId, stages: PipelineStages) -> Self {
        SemaphoreOp {
            semaphore,
            value: 0,
            stages,
        }
    }

    pub fn timeline(semaphore: SemaphoreId, value: u64, stages: PipelineStages) -> Self {
        SemaphoreOp {
            semaphore,
            value,
            stages,
        }
    }
}

/// One queue submission: recorded command-buffer contexts plus the semaphore
/// operations bracketing them.
#[derive(Clone, Debug, Default)]
pub struct Submission {
    pub waits: Vec<SemaphoreOp>,
    /// Recorded contexts, with command-buffer-local tags starting at 0.
    /// Contexts of one submission must use disjoint local tags.
    pub command_buffers: Vec<AccessContext>,
    pub signals: Vec<SemaphoreOp>,
    /// Number of local tags the command buffers use; the coordinator
    /// relocates `[0, tag_count)` into the global tag space.
    pub tag_count: Tag,
}

pub type SubmitId = u64;

/// Everything the coordinator found while processing one submission.
#[derive(Debug)]
pub struct ValidationReport {
    pub submit_id: SubmitId,
    pub queue: QueueId,
    pub hazards: Vec<HazardResult>,
    pub errors: Vec<SubmitError>,
}

struct DeviceState {
    semaphores: SemaphoreRegistry,
    /// Per-queue submitted access history. Each queue's worker is the sole
    /// writer of its entry.
    contexts: Vec<AccessContext>,
    /// Global tag allocator; submission tags are relocated into this space.
    next_tag: Tag,
    /// Outstanding submissions per queue.
    pending: Vec<usize>,
    /// `synced[a][b]`: accesses of queue `b` with a smaller tag are known to
    /// happen before anything queue `a` submits from now on. Grown by
    /// semaphore waits, joined transitively through the signal.
    synced: Vec<Vec<Tag>>,
}

fn join_synced(into: &mut [Tag], other: &[Tag]) {
    for (mine, theirs) in into.iter_mut().zip(other.iter()) {
        *mine = (*mine).max(*theirs);
    }
}

struct Shared {
    config: ValidatorConfig,
    queue_flags: Vec<QueueFlags>,
    state: Mutex<DeviceState>,
    /// Woken on semaphore signals and submission completion; parks
    /// wait-before-signal submissions and idle waits.
    state_cond: Condvar,
    reports: Mutex<Vec<ValidationReport>>,
    shutdown: AtomicBool,
}

struct QueueFifo {
    queue: Mutex<VecDeque<(SubmitId, Submission)>>,
    cond: Condvar,
}

/// Cross-queue coordinator: one worker thread per queue drains a submission
/// FIFO, resolves semaphore dependencies, replays command-buffer first-use
/// logs against the queue's submitted history and records hazards.
pub struct QueueCoordinator {
    shared: Arc<Shared>,
    fifos: Vec<Arc<QueueFifo>>,
    workers: Vec<JoinHandle<()>>,
    next_submit_id: AtomicU64,
}

impl QueueCoordinator {
    pub fn new(config: ValidatorConfig, queue_flags: Vec<QueueFlags>) -> Self {
        let queue_count = queue_flags.len();
        let threshold = config.consolidation_threshold;
        let shared = Arc::new(Shared {
            config,
            queue_flags,
            state: Mutex::new(DeviceState {
                semaphores: SemaphoreRegistry::default(),
                contexts: (0..queue_count)
                    .map(|_| AccessContext::with_consolidation_threshold(threshold))
                    .collect(),
                next_tag: 1,
                pending: vec![0; queue_count],
                synced: vec![vec![0; queue_count]; queue_count],
            }),
            state_cond: Condvar::new(),
            reports: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let fifos: Vec<Arc<QueueFifo>> = (0..queue_count)
            .map(|_| {
                Arc::new(QueueFifo {
                    queue: Mutex::new(VecDeque::new()),
                    cond: Condvar::new(),
                })
            })
            .collect();

        let workers = fifos
            .iter()
            .enumerate()
            .map(|(queue, fifo)| {
                let shared = Arc::clone(&shared);
                let fifo = Arc::clone(fifo);
                thread::Builder::new()
                    .name(format!("vigil-queue-{}", queue))
                    .spawn(move || worker(shared, fifo, queue as QueueId))
                    .expect("failed to spawn queue worker")
            })
            .collect();

        QueueCoordinator {
            shared,
            fifos,
            workers,
            next_submit_id: AtomicU64::new(1),
        }
    }

    pub fn queue_count(&self) -> usize {
        self.fifos.len()
    }

    pub fn create_binary_semaphore(&self) -> SemaphoreId {
        self.shared.state.lock().semaphores.create_binary()
    }

    pub fn create_timeline_semaphore(&self, initial_value: u64) -> SemaphoreId {
        self.shared
            .state
            .lock()
            .semaphores
            .create_timeline(initial_value)
    }

    pub fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        self.shared.state.lock().semaphores.destroy(semaphore);
    }

    /// Signal a timeline semaphore from the host.
    pub fn host_signal_timeline(
        &self,
        semaphore: SemaphoreId,
        value: u64,
    ) -> Result<(), SubmitError> {
        let mut state = self.shared.state.lock();
        state
            .semaphores
            .validate_signal(semaphore, crate::INVALID_QUEUE, value)?;
        let tag = state.next_tag;
        let info = SignalInfo {
            scope: SemaphoreScope::new(crate::INVALID_QUEUE, ExecScope::default()),
            tag,
            accesses: Arc::new(AccessContext::new()),
            // A host signal orders nothing on the device timelines.
            synced: vec![0; self.fifos.len()],
        };
        state
            .semaphores
            .signal(semaphore, crate::INVALID_QUEUE, value, info)?;
        drop(state);
        self.shared.state_cond.notify_all();
        Ok(())
    }

    /// Validate and enqueue a submission. Semaphore misuse is rejected here,
    /// before any access state changes; processing happens on the queue's
    /// worker thread.
    pub fn submit(&self, queue: QueueId, submission: Submission) -> Result<SubmitId, SubmitError> {
        let fifo = self
            .fifos
            .get(queue as usize)
            .ok_or(SubmitError::UnknownQueue)?;

        {
            let mut state = self.shared.state.lock();
            let waits: Vec<(SemaphoreId, u64)> = submission
                .waits
                .iter()
                .map(|op| (op.semaphore, op.value))
                .collect();
            let signals: Vec<(SemaphoreId, u64)> = submission
                .signals
                .iter()
                .map(|op| (op.semaphore, op.value))
                .collect();
            state
                .semaphores
                .validate_submission(queue, &waits, &signals)?;

            if !self.shared.config.enable_queue_submit_validation {
                // Record-time only: pairing rules were checked, the
                // submitted-state machinery stays off.
                return Ok(self.next_submit_id.fetch_add(1, Ordering::Relaxed));
            }
            state.pending[queue as usize] += 1;
        }

        let submit_id = self.next_submit_id.fetch_add(1, Ordering::Relaxed);
        debug!(queue, submit_id, "submission enqueued");
        fifo.queue.lock().push_back((submit_id, submission));
        fifo.cond.notify_one();
        Ok(submit_id)
    }

    /// Block until every enqueued submission has been processed, without
    /// the access clearing an idle wait implies.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while state.pending.iter().any(|&count| count > 0) {
            self.shared.state_cond.wait(&mut state);
        }
    }

    /// Submissions enqueued or in flight on a queue.
    pub fn pending_submissions(&self, queue: QueueId) -> usize {
        self.shared
            .state
            .lock()
            .pending
            .get(queue as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Block until the queue drained its FIFO, then clear accesses the wait
    /// proves complete.
    pub fn wait_queue_idle(&self, queue: QueueId) {
        let mut state = self.shared.state.lock();
        while state.pending.get(queue as usize).copied().unwrap_or(0) > 0 {
            self.shared.state_cond.wait(&mut state);
        }
        let tag = state.next_tag;
        let predicate = WaitQueueTagPredicate { queue, tag };
        for context in &mut state.contexts {
            context.clear_predicated(&predicate);
        }
    }

    /// Block until every queue is idle, then clear everything the device
    /// wait proves complete.
    pub fn wait_device_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.pending.iter().any(|&count| count > 0) {
            self.shared.state_cond.wait(&mut state);
        }
        let tag = state.next_tag;
        let predicate = WaitTagPredicate { tag };
        for context in &mut state.contexts {
            context.clear_predicated(&predicate);
        }
    }

    /// Take all reports produced so far.
    pub fn drain_reports(&self) -> Vec<ValidationReport> {
        std::mem::take(&mut *self.shared.reports.lock())
    }

    /// Hazard check of a prospective access against a queue's submitted
    /// history.
    pub fn detect_hazard(
        &self,
        queue: QueueId,
        resource: ResourceId,
        range: AccessRange,
        access_index: AccessIndex,
        ordering_rule: OrderingRule,
    ) -> HazardResult {
        let state = self.shared.state.lock();
        let context = match state.contexts.get(queue as usize) {
            Some(context) => context,
            None => return HazardResult::none(),
        };
        let mut hazard =
            context.detect_hazard(resource, range, access_index, ordering_rule, queue);
        if !self.shared.config.report_present_as_hazard {
            hazard.demote_present();
        }
        hazard
    }

    /// Hazard check for the first scope of a layout-transition barrier
    /// against a queue's submitted history.
    pub fn detect_barrier_hazard(
        &self,
        queue: QueueId,
        resource: ResourceId,
        range: AccessRange,
        src_stages: PipelineStages,
        src_access_mask: AccessFlags,
    ) -> HazardResult {
        let state = self.shared.state.lock();
        let context = match state.contexts.get(queue as usize) {
            Some(context) => context,
            None => return HazardResult::none(),
        };
        let queue_flags = self.shared.queue_flags[queue as usize];
        let src = ExecScope::make_src(queue_flags, src_stages, PipelineStages::empty());
        let src_access = access_scope(&src.valid_accesses, src_access_mask);
        context.detect_barrier_hazard(resource, range, queue, src.exec_scope, &src_access)
    }

    /// Snapshot of a queue's submitted history, for inspection.
    pub fn submitted_context(&self, queue: QueueId) -> Option<AccessContext> {
        self.shared
            .state
            .lock()
            .contexts
            .get(queue as usize)
            .cloned()
    }

    /// Record a presentation of a resource range: the present engine's read
    /// and hand-off, modelled as a write. The hazard check runs first; the
    /// presented state is recorded either way so later misuse is caught.
    pub fn record_present(
        &self,
        queue: QueueId,
        resource: ResourceId,
        range: AccessRange,
    ) -> (Tag, HazardResult) {
        let mut state = self.shared.state.lock();
        let present_tag = state.next_tag;
        state.next_tag += 1;

        let context = match state.contexts.get_mut(queue as usize) {
            Some(context) => context,
            None => return (present_tag, HazardResult::none()),
        };
        let mut hazard = context.detect_hazard(
            resource,
            range,
            AccessIndex::PresentEnginePresented,
            OrderingRule::None,
            queue,
        );
        if !self.shared.config.report_present_as_hazard {
            hazard.demote_present();
        }
        context.update_access(
            resource,
            range,
            AccessIndex::PresentEnginePresented,
            OrderingRule::None,
            TagEx::new(present_tag),
            SyncFlags::PRESENT,
        );
        context.set_queue_id(queue);
        (present_tag, hazard)
    }

    /// Record the acquire matching an earlier present: the presented write
    /// (and a prior acquire read, if its tag is supplied) are retired from
    /// every queue's history, making the resource usable again.
    pub fn record_acquire(
        &self,
        resource: ResourceId,
        range: AccessRange,
        present_tag: Tag,
        prior_acquire_tag: Option<Tag>,
    ) -> Tag {
        let mut state = self.shared.state.lock();
        let acquire_tag = state.next_tag;
        state.next_tag += 1;

        let predicate = WaitAcquirePredicate {
            present_tag,
            acquire_tag: prior_acquire_tag.unwrap_or(acquire_tag),
        };
        for context in &mut state.contexts {
            context.clear_predicated_range(resource, range, &predicate);
        }
        acquire_tag
    }

    /// Tags still referenced by a queue's submitted history. Reporters use
    /// this to trim their per-tag debug records.
    pub fn referenced_tags(&self, queue: QueueId) -> TagSet {
        let mut used = TagSet::new();
        if let Some(context) = self.shared.state.lock().contexts.get(queue as usize) {
            context.gather_referenced_tags(&mut used);
        }
        used
    }
}

impl std::fmt::Debug for QueueCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCoordinator")
            .field("queues", &self.fifos.len())
            .finish_non_exhaustive()
    }
}

impl Drop for QueueCoordinator {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for fifo in &self.fifos {
            fifo.cond.notify_all();
        }
        self.shared.state_cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(shared: Arc<Shared>, fifo: Arc<QueueFifo>, queue: QueueId) {
    loop {
        let item = {
            let mut pending = fifo.queue.lock();
            loop {
                if let Some(item) = pending.pop_front() {
                    break Some(item);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                fifo.cond.wait(&mut pending);
            }
        };
        let (submit_id, submission) = match item {
            Some(item) => item,
            None => return,
        };
        process_submission(&shared, queue, submit_id, submission);
    }
}

fn process_submission(
    shared: &Shared,
    queue: QueueId,
    submit_id: SubmitId,
    submission: Submission,
) {
    let span = debug_span!("queue_submission", queue, submit_id);
    let _entered = span.enter();

    let queue_flags = shared.queue_flags[queue as usize];
    let mut hazards: Vec<HazardResult> = Vec::new();
    let mut errors: Vec<SubmitError> = Vec::new();

    let mut state = shared.state.lock();

    // Resolve waits first; a wait submitted before its signal parks the
    // worker (and with it the rest of this queue's submission order) until
    // the signal is reached.
    for wait in &submission.waits {
        let resolved = loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                break None;
            }
            match state.semaphores.resolve_wait(wait.semaphore, wait.value) {
                Ok(Some(info)) => break Some(info),
                Ok(None) => {
                    debug!(
                        semaphore = wait.semaphore.0,
                        value = wait.value,
                        "wait-before-signal, parking"
                    );
                    shared.state_cond.wait(&mut state);
                }
                Err(err) => {
                    errors.push(err);
                    break None;
                }
            }
        };

        if let Some(info) = resolved {
            if info.scope.queue != queue {
                // Carry the signal's first scope over: the signaling queue's
                // accesses become visible to the wait's second scope.
                let wait_scope =
                    SemaphoreScope::new(queue, ExecScope::make_dst(queue_flags, wait.stages));
                let mut carried = (*info.accesses).clone();
                carried.apply_semaphore(&info.scope, &wait_scope);
                state.contexts[queue as usize].resolve_from(&carried, 0);

                // Everything the signaling queue had reached is now ordered
                // before this queue's subsequent work.
                join_synced(&mut state.synced[queue as usize], &info.synced);
                if info.scope.queue != crate::INVALID_QUEUE {
                    let signaler = info.scope.queue as usize;
                    let synced = &mut state.synced[queue as usize][signaler];
                    *synced = (*synced).max(info.tag);
                }
            }
            // A same-queue pair adds nothing; submission order covers it.
        }
    }

    // Relocate command-buffer-local tags into the global space, replay the
    // first-use logs and absorb the accesses.
    let base_tag = state.next_tag;
    let tag_count = submission.tag_count.max(1);
    state.next_tag += tag_count;
    let tag_range = TagRange::new(base_tag, base_tag + tag_count);

    for recorded in &submission.command_buffers {
        let mut relocated = recorded.clone();
        relocated.offset_tags(base_tag);
        relocated.set_queue_id(queue);

        let context = &state.contexts[queue as usize];
        let mut hazard = context.detect_first_use_hazard(queue, &relocated, &tag_range);
        if hazard.is_hazard() {
            if !shared.config.report_present_as_hazard {
                hazard.demote_present();
            }
            warn!(
                queue,
                submit_id,
                hazard = hazard.hazard().map(|h| h.as_str()),
                "submission hazard"
            );
            hazards.push(hazard);
        }

        // Accesses of other queues are unordered against this submission
        // unless a semaphore chain proved otherwise; anything they touched
        // past the synced-until point races.
        for other in 0..state.contexts.len() {
            if other == queue as usize {
                continue;
            }
            let start_tag = state.synced[queue as usize][other];
            let mut racing = state.contexts[other].detect_async_first_use_hazard(
                other as QueueId,
                &relocated,
                &tag_range,
                start_tag,
            );
            if racing.is_hazard() {
                if !shared.config.report_present_as_hazard {
                    racing.demote_present();
                }
                warn!(
                    queue,
                    submit_id,
                    other_queue = other,
                    hazard = racing.hazard().map(|h| h.as_str()),
                    "cross-queue racing hazard"
                );
                hazards.push(racing);
            }
        }

        state.contexts[queue as usize].resolve_from(&relocated, 0);
    }

    // Signals last: they publish this queue's accesses with the signal's
    // first scope attached.
    for signal in &submission.signals {
        let scope = SemaphoreScope::new(
            queue,
            ExecScope::make_src(queue_flags, signal.stages, PipelineStages::empty()),
        );
        let tag = state.next_tag;
        // The snapshot outlives this batch; store it in canonical form.
        let mut snapshot = state.contexts[queue as usize].clone();
        snapshot.normalize();
        let mut synced = state.synced[queue as usize].clone();
        synced[queue as usize] = tag;
        let info = SignalInfo {
            scope,
            tag,
            accesses: Arc::new(snapshot),
            synced,
        };
        if let Err(err) = state
            .semaphores
            .signal(signal.semaphore, queue, signal.value, info)
        {
            errors.push(err);
        }
    }

    state.pending[queue as usize] -= 1;
    drop(state);
    shared.state_cond.notify_all();

    if !hazards.is_empty() || !errors.is_empty() {
        shared.reports.lock().push(ValidationReport {
            submit_id,
            queue,
            hazards,
            errors,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_rejects_unknown_queue() {
        let coordinator =
            QueueCoordinator::new(ValidatorConfig::default(), vec![QueueFlags::GRAPHICS]);
        let err = coordinator.submit(3, Submission::default()).unwrap_err();
        assert_eq!(err, SubmitError::UnknownQueue);
    }

    #[test]
    fn rejected_submission_leaves_pairing_state_intact() {
        let coordinator = QueueCoordinator::new(
            ValidatorConfig::default(),
            vec![QueueFlags::GRAPHICS, QueueFlags::GRAPHICS],
        );
        let binary = coordinator.create_binary_semaphore();

        // Signal plus an invalid wait on a never-signaled second semaphore.
        let other = coordinator.create_binary_semaphore();
        let submission = Submission {
            waits: vec![SemaphoreOp::binary(other, PipelineStages::ALL_COMMANDS)],
            signals: vec![SemaphoreOp::binary(binary, PipelineStages::ALL_COMMANDS)],
            ..Submission::default()
        };
        assert_eq!(
            coordinator.submit(0, submission).unwrap_err(),
            SubmitError::BinarySemaphoreNotSignaled
        );

        // The rejected signal must not have consumed the semaphore.
        let ok = Submission {
            signals: vec![SemaphoreOp::binary(binary, PipelineStages::ALL_COMMANDS)],
            ..Submission::default()
        };
        coordinator.submit(0, ok).unwrap();
        coordinator.wait_device_idle();
    }
}
