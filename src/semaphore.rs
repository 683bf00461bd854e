use std::sync::Arc;

use hashbrown::HashMap;
use slab::Slab;
use tracing::debug;

use crate::{
    barrier::SemaphoreScope,
    context::AccessContext,
    queue::SubmitError,
    QueueId, Tag,
};

/// Handle to a semaphore tracked by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub(crate) usize);

/// Payload carried by a resolved signal: the first sync scope and the
/// signaling queue's submitted accesses at signal time.
#[derive(Clone, Debug)]
pub struct SignalInfo {
    pub scope: SemaphoreScope,
    pub tag: Tag,
    /// Snapshot of the signaling queue's submitted state. Shared, the wait
    /// clones it before applying its second scope.
    pub accesses: Arc<AccessContext>,
    /// Per-queue tags the signaling queue had synchronized with when it
    /// signaled; a waiter joins these into its own synced-until vector.
    pub synced: Vec<Tag>,
}

#[derive(Debug, Default)]
pub(crate) struct BinarySemaphore {
    /// Pairing state maintained at submit validation: a signal has been
    /// submitted and no wait has claimed it yet.
    submitted_outstanding: bool,
    /// Set when the signaling queue's worker reaches the signal.
    signaled: Option<SignalInfo>,
}

#[derive(Clone, Debug)]
pub(crate) struct TimelineSignal {
    pub queue: QueueId,
    pub value: u64,
    pub info: SignalInfo,
}

#[derive(Debug, Default)]
pub(crate) struct TimelineSemaphore {
    /// Last value submitted per queue, for the monotonicity rule.
    submitted_values: HashMap<QueueId, u64>,
    /// Signals reached by queue workers, in submission order.
    signals: Vec<TimelineSignal>,
    /// Highest signaled value.
    payload: u64,
}

#[derive(Debug)]
pub(crate) enum Semaphore {
    Binary(BinarySemaphore),
    Timeline(TimelineSemaphore),
}

/// Outcome of a timeline wait query.
#[derive(Debug)]
pub(crate) enum TimelineResolution {
    /// The wait resolves against this signal.
    Resolved(SignalInfo),
    /// No signal with a sufficient value has been reached yet.
    Unresolved,
}

#[derive(Debug, Default)]
pub(crate) struct SemaphoreRegistry {
    semaphores: Slab<Semaphore>,
}

impl SemaphoreRegistry {
    pub fn create_binary(&mut self) -> SemaphoreId {
        SemaphoreId(self.semaphores.insert(Semaphore::Binary(BinarySemaphore::default())))
    }

    pub fn create_timeline(&mut self, initial_value: u64) -> SemaphoreId {
        let mut timeline = TimelineSemaphore::default();
        timeline.payload = initial_value;
        SemaphoreId(self.semaphores.insert(Semaphore::Timeline(timeline)))
    }

    pub fn destroy(&mut self, id: SemaphoreId) {
        if self.semaphores.contains(id.0) {
            self.semaphores.remove(id.0);
        }
    }

    fn get_mut(&mut self, id: SemaphoreId) -> Result<&mut Semaphore, SubmitError> {
        self.semaphores
            .get_mut(id.0)
            .ok_or(SubmitError::UnknownSemaphore)
    }

    // ---- submit-time validation (no state mutation on error) ----

    /// Validate and register a signal submission.
    pub fn validate_signal(
        &mut self,
        id: SemaphoreId,
        queue: QueueId,
        value: u64,
    ) -> Result<(), SubmitError> {
        match self.get_mut(id)? {
            Semaphore::Binary(binary) => {
                if binary.submitted_outstanding {
                    return Err(SubmitError::BinarySemaphoreAlreadySignaled);
                }
                binary.submitted_outstanding = true;
                Ok(())
            }
            Semaphore::Timeline(timeline) => {
                let last = timeline.submitted_values.get(&queue).copied().unwrap_or(0);
                if value < last {
                    return Err(SubmitError::TimelineValueDecreased {
                        last,
                        submitted: value,
                    });
                }
                timeline.submitted_values.insert(queue, value);
                Ok(())
            }
        }
    }

    /// Validate a wait submission. Binary waits require an already submitted
    /// signal; timeline waits may legally precede their signal.
    pub fn validate_wait(&mut self, id: SemaphoreId) -> Result<(), SubmitError> {
        match self.get_mut(id)? {
            Semaphore::Binary(binary) => {
                if !binary.submitted_outstanding {
                    return Err(SubmitError::BinarySemaphoreNotSignaled);
                }
                binary.submitted_outstanding = false;
                Ok(())
            }
            Semaphore::Timeline(_) => Ok(()),
        }
    }

    // ---- queue-worker operations ----

    /// Record that the signaling queue reached the signal.
    pub fn signal(
        &mut self,
        id: SemaphoreId,
        queue: QueueId,
        value: u64,
        info: SignalInfo,
    ) -> Result<(), SubmitError> {
        match self.get_mut(id)? {
            Semaphore::Binary(binary) => {
                debug!(semaphore = id.0, queue, "binary semaphore signaled");
                binary.signaled = Some(info);
                Ok(())
            }
            Semaphore::Timeline(timeline) => {
                debug!(semaphore = id.0, queue, value, "timeline semaphore signaled");
                timeline.payload = timeline.payload.max(value);
                timeline.signals.push(TimelineSignal { queue, value, info });
                Ok(())
            }
        }
    }

    /// Consume a binary signal. `None` while the signaling worker has not
    /// reached it yet.
    pub fn take_binary_signal(&mut self, id: SemaphoreId) -> Result<Option<SignalInfo>, SubmitError> {
        match self.get_mut(id)? {
            Semaphore::Binary(binary) => Ok(binary.signaled.take()),
            Semaphore::Timeline(_) => Err(SubmitError::SemaphoreKindMismatch),
        }
    }

    /// Resolve a timeline wait against the earliest signal with
    /// `value >= wait_value`. Ambiguity between two queues signaling the
    /// same resolving value is an invalid submission.
    pub fn resolve_timeline_wait(
        &mut self,
        id: SemaphoreId,
        wait_value: u64,
    ) -> Result<TimelineResolution, SubmitError> {
        match self.get_mut(id)? {
            Semaphore::Binary(_) => Err(SubmitError::SemaphoreKindMismatch),
            Semaphore::Timeline(timeline) => {
                let mut best: Option<&TimelineSignal> = None;
                let mut ambiguous = false;
                for signal in &timeline.signals {
                    if signal.value < wait_value {
                        continue;
                    }
                    match best {
                        None => best = Some(signal),
                        Some(current) => {
                            if signal.value < current.value {
                                best = Some(signal);
                                ambiguous = false;
                            } else if signal.value == current.value
                                && signal.queue != current.queue
                            {
                                ambiguous = true;
                            }
                        }
                    }
                }
                if ambiguous {
                    return Err(SubmitError::AmbiguousTimelineResolve);
                }
                match best {
                    Some(signal) => Ok(TimelineResolution::Resolved(signal.info.clone())),
                    None => Ok(TimelineResolution::Unresolved),
                }
            }
        }
    }

    /// Resolve a wait of either kind. `Ok(None)` means the matching signal
    /// has not been reached by its queue worker yet (legal for timelines,
    /// transient for binaries whose signal is already submitted).
    pub fn resolve_wait(
        &mut self,
        id: SemaphoreId,
        value: u64,
    ) -> Result<Option<SignalInfo>, SubmitError> {
        let is_binary = matches!(
            self.semaphores.get(id.0),
            Some(Semaphore::Binary(_))
        );
        if is_binary {
            self.take_binary_signal(id)
        } else {
            match self.resolve_timeline_wait(id, value)? {
                TimelineResolution::Resolved(info) => Ok(Some(info)),
                TimelineResolution::Unresolved => Ok(None),
            }
        }
    }

    /// Validate a whole submission's semaphore usage. Waits are processed
    /// before signals, as they execute. On error no pairing state is
    /// changed.
    pub fn validate_submission(
        &mut self,
        queue: QueueId,
        waits: &[(SemaphoreId, u64)],
        signals: &[(SemaphoreId, u64)],
    ) -> Result<(), SubmitError> {
        let mut touched: Vec<(SemaphoreId, PairingSnapshot)> = Vec::new();
        let snapshot = |registry: &Slab<Semaphore>,
                        id: SemaphoreId,
                        touched: &mut Vec<(SemaphoreId, PairingSnapshot)>| {
            if touched.iter().any(|(t, _)| *t == id) {
                return;
            }
            if let Some(sem) = registry.get(id.0) {
                touched.push((id, PairingSnapshot::of(sem)));
            }
        };

        let result = (|| {
            for &(id, _value) in waits {
                snapshot(&self.semaphores, id, &mut touched);
                self.validate_wait(id)?;
            }
            for &(id, value) in signals {
                snapshot(&self.semaphores, id, &mut touched);
                self.validate_signal(id, queue, value)?;
            }
            Ok(())
        })();

        if result.is_err() {
            for (id, snap) in touched {
                if let Some(sem) = self.semaphores.get_mut(id.0) {
                    snap.restore(sem);
                }
            }
        }
        result
    }

    /// Current payload of a timeline semaphore.
    pub fn payload(&self, id: SemaphoreId) -> Option<u64> {
        match self.semaphores.get(id.0)? {
            Semaphore::Timeline(timeline) => Some(timeline.payload),
            Semaphore::Binary(_) => None,
        }
    }
}

/// Pairing state captured for rollback of a rejected submission.
#[derive(Debug)]
enum PairingSnapshot {
    Binary { submitted_outstanding: bool },
    Timeline { submitted_values: HashMap<QueueId, u64> },
}

impl PairingSnapshot {
    fn of(sem: &Semaphore) -> Self {
        match sem {
            Semaphore::Binary(binary) => PairingSnapshot::Binary {
                submitted_outstanding: binary.submitted_outstanding,
            },
            Semaphore::Timeline(timeline) => PairingSnapshot::Timeline {
                submitted_values: timeline.submitted_values.clone(),
            },
        }
    }

    fn restore(self, sem: &mut Semaphore) {
        match (self, sem) {
            (
                PairingSnapshot::Binary {
                    submitted_outstanding,
                },
                Semaphore::Binary(binary),
            ) => binary.submitted_outstanding = submitted_outstanding,
            (
                PairingSnapshot::Timeline { submitted_values },
                Semaphore::Timeline(timeline),
            ) => timeline.submitted_values = submitted_values,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ExecScope;
    use crate::stage::{PipelineStages, QueueFlags};

    fn info(queue: QueueId, tag: Tag) -> SignalInfo {
        SignalInfo {
            scope: SemaphoreScope::new(
                queue,
                ExecScope::make_src(
                    QueueFlags::GRAPHICS,
                    PipelineStages::ALL_COMMANDS,
                    PipelineStages::empty(),
                ),
            ),
            tag,
            accesses: Arc::new(AccessContext::new()),
            synced: Vec::new(),
        }
    }

    #[test]
    fn binary_signal_wait_pairing() {
        let mut registry = SemaphoreRegistry::default();
        let sem = registry.create_binary();

        // Wait before any signal is invalid.
        assert_eq!(
            registry.validate_wait(sem),
            Err(SubmitError::BinarySemaphoreNotSignaled)
        );

        registry.validate_signal(sem, 0, 0).unwrap();
        // Double signal without an intervening wait is invalid.
        assert_eq!(
            registry.validate_signal(sem, 0, 0),
            Err(SubmitError::BinarySemaphoreAlreadySignaled)
        );

        registry.validate_wait(sem).unwrap();
        // Consumed: next wait needs a new signal.
        assert_eq!(
            registry.validate_wait(sem),
            Err(SubmitError::BinarySemaphoreNotSignaled)
        );
    }

    #[test]
    fn timeline_values_must_not_decrease_per_queue() {
        let mut registry = SemaphoreRegistry::default();
        let sem = registry.create_timeline(0);

        registry.validate_signal(sem, 1, 5).unwrap();
        assert_eq!(
            registry.validate_signal(sem, 1, 4),
            Err(SubmitError::TimelineValueDecreased {
                last: 5,
                submitted: 4
            })
        );
        // Another queue has its own monotonic sequence.
        registry.validate_signal(sem, 0, 4).unwrap();
    }

    #[test]
    fn timeline_wait_resolves_against_earliest_sufficient_signal() {
        let mut registry = SemaphoreRegistry::default();
        let sem = registry.create_timeline(0);

        match registry.resolve_timeline_wait(sem, 5).unwrap() {
            TimelineResolution::Unresolved => {}
            _ => panic!("wait must be unresolved before any signal"),
        }

        registry.signal(sem, 0, 3, info(0, 30)).unwrap();
        match registry.resolve_timeline_wait(sem, 5).unwrap() {
            TimelineResolution::Unresolved => {}
            _ => panic!("value 3 cannot resolve a wait for 5"),
        }

        registry.signal(sem, 0, 7, info(0, 70)).unwrap();
        registry.signal(sem, 1, 9, info(1, 90)).unwrap();
        match registry.resolve_timeline_wait(sem, 5).unwrap() {
            TimelineResolution::Resolved(signal) => assert_eq!(signal.tag, 70),
            _ => panic!("signal with value 7 resolves the wait"),
        }
        assert_eq!(registry.payload(sem), Some(9));
    }

    #[test]
    fn ambiguous_timeline_resolution_is_invalid() {
        let mut registry = SemaphoreRegistry::default();
        let sem = registry.create_timeline(0);
        registry.signal(sem, 0, 5, info(0, 50)).unwrap();
        registry.signal(sem, 1, 5, info(1, 51)).unwrap();

        assert_eq!(
            registry.resolve_timeline_wait(sem, 5).unwrap_err(),
            SubmitError::AmbiguousTimelineResolve
        );
    }
}
