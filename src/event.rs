use tracing::debug;

use crate::{
    access::{AccessFlags, AccessIndex},
    barrier::{BarrierScope, SyncBarrier},
    context::{AccessContext, ResourceId},
    range::AccessRange,
    scope::{access_scope, ExecScope},
    state::HazardResult,
    stage::PipelineStages,
    QueueId, Tag, NO_HANDLE,
};

/// Scope captured by a set-event: the first sync scope and a snapshot of the
/// per-resource accesses at the moment of the set. Accesses recorded after
/// the set tag are outside the scope.
#[derive(Clone, Debug)]
pub struct EventScope {
    pub src: ExecScope,
    pub queue: QueueId,
    pub tag: Tag,
    snapshot: AccessContext,
}

/// Rejection causes for event operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The host stage may only participate when set and wait happen on the
    /// same queue family.
    #[error("host stage in an event scope requires matching queue families")]
    HostStageQueueMismatch,
}

/// Device-scope event: a flag with the barrier scope and access snapshot of
/// its last set.
#[derive(Clone, Debug, Default)]
pub struct Event {
    scope: Option<EventScope>,
}

impl Event {
    pub fn new() -> Self {
        Event { scope: None }
    }

    pub fn is_set(&self) -> bool {
        self.scope.is_some()
    }

    pub fn scope(&self) -> Option<&EventScope> {
        self.scope.as_ref()
    }

    /// Record a set: snapshot the context under the source scope.
    pub fn set(&mut self, context: &AccessContext, src: ExecScope, queue: QueueId, tag: Tag) {
        debug!(queue, tag, "event set");
        self.scope = Some(EventScope {
            src,
            queue,
            tag,
            snapshot: context.clone(),
        });
    }

    /// Invalidate the snapshot.
    pub fn reset(&mut self) {
        self.scope = None;
    }

    /// Apply the wait: the recorded source scope joins each barrier's first
    /// scope, and application is restricted to accesses captured by the set.
    ///
    /// Waiting on an event that was never set applies nothing.
    pub fn wait(
        &self,
        context: &mut AccessContext,
        barriers: &[SyncBarrier],
        wait_queue: QueueId,
        tag: Tag,
    ) -> Result<(), EventError> {
        let Some(scope) = &self.scope else {
            return Ok(());
        };
        self.validate_host_stage(barriers, wait_queue)?;

        debug!(set_queue = scope.queue, wait_queue, tag, "event wait");
        let barrier_scope = BarrierScope::Event {
            queue: scope.queue,
            tag: scope.tag,
        };
        // The wait uses the set's first scope; the caller only contributes
        // the second scope of each barrier.
        let barriers: Vec<SyncBarrier> = barriers
            .iter()
            .map(|barrier| self.rescope(scope, barrier))
            .collect();

        for resource in scope.snapshot.resources().collect::<Vec<ResourceId>>() {
            let ranges: Vec<AccessRange> = scope
                .snapshot
                .map(resource)
                .map(|map| map.iter().map(|(range, _)| range).collect())
                .unwrap_or_default();
            for range in ranges {
                context.apply_barrier_batch(
                    barrier_scope,
                    resource,
                    Some(range),
                    &barriers,
                    false,
                    NO_HANDLE,
                    tag,
                );
            }
        }
        Ok(())
    }

    /// Hazard check for a layout transition applied by this event's wait.
    pub fn detect_layout_hazard(
        &self,
        context: &AccessContext,
        resource: ResourceId,
        range: AccessRange,
        src_access_mask: AccessFlags,
    ) -> HazardResult {
        let Some(scope) = &self.scope else {
            return HazardResult::none();
        };
        let usage = AccessIndex::ImageLayoutTransition.info();
        let src_access_scope = access_scope(&scope.src.valid_accesses, src_access_mask);

        let Some(active_map) = context.map(resource) else {
            return HazardResult::none();
        };
        let scope_map = scope.snapshot.map(resource);
        for (active_range, active_state) in active_map.iter_range(&range) {
            let scope_state = scope_map.and_then(|map| {
                map.iter_range(&active_range)
                    .next()
                    .map(|(_, state)| state)
            });
            let hazard = match scope_state {
                Some(scope_state) => active_state.detect_event_barrier_hazard(
                    usage,
                    scope_state,
                    scope.src.exec_scope,
                    &src_access_scope,
                    scope.queue,
                    scope.tag,
                ),
                // Nothing was captured here; the plain barrier check with
                // the event cutoff still applies.
                None => active_state.detect_barrier_hazard(
                    usage,
                    scope.queue,
                    scope.src.exec_scope,
                    &src_access_scope,
                ),
            };
            if hazard.is_hazard() {
                return hazard;
            }
        }
        HazardResult::none()
    }

    fn rescope(&self, scope: &EventScope, barrier: &SyncBarrier) -> SyncBarrier {
        SyncBarrier {
            src_exec_scope: scope.src,
            src_access_scope: access_scope(&scope.src.valid_accesses, barrier.original_src_access),
            original_src_access: barrier.original_src_access,
            dst_exec_scope: barrier.dst_exec_scope,
            dst_access_scope: barrier.dst_access_scope,
            original_dst_access: barrier.original_dst_access,
        }
    }

    fn validate_host_stage(
        &self,
        barriers: &[SyncBarrier],
        wait_queue: QueueId,
    ) -> Result<(), EventError> {
        let scope = self.scope.as_ref().unwrap();
        let uses_host = scope.src.mask_param.contains(PipelineStages::HOST)
            || barriers
                .iter()
                .any(|b| b.dst_exec_scope.mask_param.contains(PipelineStages::HOST));
        if uses_host && scope.queue != wait_queue {
            return Err(EventError::HostStageQueueMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::OrderingRule;
    use crate::state::{Hazard, SyncFlags};
    use crate::stage::QueueFlags;
    use crate::{TagEx, INVALID_QUEUE};

    const IMG: ResourceId = ResourceId(7);

    fn tag(t: Tag) -> TagEx {
        TagEx {
            tag: t,
            handle_index: NO_HANDLE,
        }
    }

    fn src(stages: PipelineStages) -> ExecScope {
        ExecScope::make_src(QueueFlags::GRAPHICS, stages, PipelineStages::empty())
    }

    fn dst(stages: PipelineStages) -> ExecScope {
        ExecScope::make_dst(QueueFlags::GRAPHICS, stages)
    }

    #[test]
    fn wait_applies_set_scope_to_captured_accesses() {
        let mut context = AccessContext::new();
        context.update_access(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::CopyTransferWrite,
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let mut event = Event::new();
        event.set(&context, src(PipelineStages::COPY), INVALID_QUEUE, 2);

        let barrier = SyncBarrier::new(
            src(PipelineStages::COPY),
            AccessFlags::TRANSFER_WRITE,
            dst(PipelineStages::FRAGMENT_SHADER),
            AccessFlags::SHADER_SAMPLED_READ,
        );
        event
            .wait(&mut context, &[barrier], INVALID_QUEUE, 3)
            .unwrap();

        let hazard = context.detect_hazard(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::FragmentShaderSampledRead,
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(!hazard.is_hazard());
    }

    #[test]
    fn accesses_after_set_are_outside_the_scope() {
        let mut context = AccessContext::new();
        context.update_access(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::CopyTransferWrite,
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let mut event = Event::new();
        event.set(&context, src(PipelineStages::COPY), INVALID_QUEUE, 2);

        // This write happens after the set; the event cannot cover it.
        context.update_access(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::ClearTransferWrite,
            OrderingRule::None,
            tag(5),
            SyncFlags::empty(),
        );

        let barrier = SyncBarrier::new(
            src(PipelineStages::COPY | PipelineStages::CLEAR),
            AccessFlags::TRANSFER_WRITE,
            dst(PipelineStages::FRAGMENT_SHADER),
            AccessFlags::SHADER_SAMPLED_READ,
        );
        event
            .wait(&mut context, &[barrier], INVALID_QUEUE, 6)
            .unwrap();

        let hazard = context.detect_hazard(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::FragmentShaderSampledRead,
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert_eq!(hazard.hazard(), Some(Hazard::ReadAfterWrite));
        assert_eq!(hazard.tag(), Some(5));
    }

    #[test]
    fn reset_invalidates_the_snapshot() {
        let mut context = AccessContext::new();
        context.update_access(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::CopyTransferWrite,
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let mut event = Event::new();
        event.set(&context, src(PipelineStages::COPY), INVALID_QUEUE, 2);
        event.reset();
        assert!(!event.is_set());

        let barrier = SyncBarrier::new(
            src(PipelineStages::COPY),
            AccessFlags::TRANSFER_WRITE,
            dst(PipelineStages::FRAGMENT_SHADER),
            AccessFlags::SHADER_SAMPLED_READ,
        );
        // Waiting an unset event applies nothing.
        event
            .wait(&mut context, &[barrier], INVALID_QUEUE, 3)
            .unwrap();
        let hazard = context.detect_hazard(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::FragmentShaderSampledRead,
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(hazard.is_hazard());
    }

    #[test]
    fn host_stage_requires_matching_queues() {
        let mut context = AccessContext::new();
        context.update_access(
            IMG,
            AccessRange::new(0, 64),
            AccessIndex::HostWrite,
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let mut event = Event::new();
        event.set(&context, src(PipelineStages::HOST), 0, 2);

        let barrier = SyncBarrier::new(
            src(PipelineStages::HOST),
            AccessFlags::HOST_WRITE,
            dst(PipelineStages::COPY),
            AccessFlags::TRANSFER_READ,
        );
        assert_eq!(
            event.wait(&mut context, &[barrier], 1, 3),
            Err(EventError::HostStageQueueMismatch)
        );
        assert!(event.wait(&mut context, &[barrier], 0, 3).is_ok());
    }
}
