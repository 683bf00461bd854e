use hashbrown::HashMap;
use tracing::trace;

use crate::{
    access::{AccessIndex, AccessInfo},
    barrier::{BarrierScope, OrderingRule, SemaphoreScope, SyncBarrier},
    map::{AccessMap, InfillUpdateOps, ParallelIterator},
    range::{AccessRange, TagRange},
    scope::AccessScope,
    stage::PipelineStages,
    state::{AccessPredicate, AccessState, HazardResult, SyncFlags, TagSet},
    QueueId, Tag, TagEx, HandleIndex, NO_HANDLE,
};

/// Opaque identifier of a tracked resource. Each resource owns a linearized
/// address space of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceId(pub u64);

/// Default mutation count between amortized consolidation sweeps.
pub const DEFAULT_CONSOLIDATION_THRESHOLD: u32 = 64;

/// Access tracking for one recording or one queue's submitted history:
/// a range map per resource plus the update/detect/barrier drivers.
#[derive(Clone, Debug)]
pub struct AccessContext {
    maps: HashMap<ResourceId, AccessMap>,
    /// Tag of the first access recorded in this context; racing detection
    /// ignores anything older.
    start_tag: Tag,
    consolidation_threshold: u32,
    mutations: u32,
}

impl Default for AccessContext {
    fn default() -> Self {
        AccessContext::new()
    }
}

struct UpdateOps<'a> {
    usage: &'a AccessInfo,
    ordering_rule: OrderingRule,
    tag_ex: TagEx,
    flags: SyncFlags,
}

impl InfillUpdateOps for UpdateOps<'_> {
    fn infill(&mut self, _gap: AccessRange) -> Option<AccessState> {
        let mut state = AccessState::new();
        state.update(self.usage, self.ordering_rule, self.tag_ex, self.flags);
        Some(state)
    }

    fn update(&mut self, _range: AccessRange, state: &mut AccessState) {
        state.update(self.usage, self.ordering_rule, self.tag_ex, self.flags);
    }
}

struct BarrierBatchOps<'a> {
    scope: BarrierScope,
    barriers: &'a [SyncBarrier],
    layout_transition: bool,
    layout_transition_handle: HandleIndex,
    tag: Tag,
}

impl BarrierBatchOps<'_> {
    fn apply(&self, state: &mut AccessState) {
        for barrier in self.barriers {
            state.apply_barrier(
                &self.scope,
                barrier,
                self.layout_transition,
                self.layout_transition_handle,
            );
        }
        state.apply_pending_barriers(self.tag);
    }
}

impl InfillUpdateOps for BarrierBatchOps<'_> {
    fn infill(&mut self, _gap: AccessRange) -> Option<AccessState> {
        // Only a layout transition writes into previously untracked space.
        if !self.layout_transition {
            return None;
        }
        let mut state = AccessState::new();
        self.apply(&mut state);
        Some(state)
    }

    fn update(&mut self, _range: AccessRange, state: &mut AccessState) {
        self.apply(state);
    }
}

struct ResolveOps<'a> {
    incoming: &'a AccessState,
}

impl InfillUpdateOps for ResolveOps<'_> {
    fn infill(&mut self, _gap: AccessRange) -> Option<AccessState> {
        Some(self.incoming.clone())
    }

    fn update(&mut self, _range: AccessRange, state: &mut AccessState) {
        state.resolve(self.incoming);
    }
}

impl AccessContext {
    pub fn new() -> Self {
        AccessContext {
            maps: HashMap::new(),
            start_tag: 0,
            consolidation_threshold: DEFAULT_CONSOLIDATION_THRESHOLD,
            mutations: 0,
        }
    }

    pub fn with_consolidation_threshold(threshold: u32) -> Self {
        AccessContext {
            consolidation_threshold: threshold.max(1),
            ..AccessContext::new()
        }
    }

    pub fn set_start_tag(&mut self, tag: Tag) {
        self.start_tag = tag;
    }

    pub fn start_tag(&self) -> Tag {
        self.start_tag
    }

    pub fn is_empty(&self) -> bool {
        self.maps.values().all(|map| map.is_empty())
    }

    pub fn map(&self, resource: ResourceId) -> Option<&AccessMap> {
        self.maps.get(&resource)
    }

    pub fn map_mut(&mut self, resource: ResourceId) -> &mut AccessMap {
        self.maps.entry(resource).or_insert_with(AccessMap::new)
    }

    pub fn resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.maps.keys().copied()
    }

    // ---- recording ----

    /// Record an access over a range of a resource.
    pub fn update_access(
        &mut self,
        resource: ResourceId,
        range: AccessRange,
        access_index: AccessIndex,
        ordering_rule: OrderingRule,
        tag_ex: TagEx,
        flags: SyncFlags,
    ) {
        if !range.non_empty() {
            return;
        }
        let mut ops = UpdateOps {
            usage: access_index.info(),
            ordering_rule,
            tag_ex,
            flags,
        };
        self.map_mut(resource).infill_update_range(range, &mut ops);
        self.note_mutation(resource);
    }

    /// Hazard check of a prospective access against the recorded state.
    /// The state is not modified.
    pub fn detect_hazard(
        &self,
        resource: ResourceId,
        range: AccessRange,
        access_index: AccessIndex,
        ordering_rule: OrderingRule,
        queue_id: QueueId,
    ) -> HazardResult {
        let usage = access_index.info();
        if let Some(map) = self.maps.get(&resource) {
            for (entry_range, state) in map.iter_range(&range) {
                let hazard = state.detect_hazard_with_rule(usage, ordering_rule, queue_id);
                if hazard.is_hazard() {
                    trace!(
                        resource = resource.0,
                        begin = entry_range.begin,
                        end = entry_range.end,
                        hazard = hazard.hazard().map(|h| h.as_str()),
                        "hazard detected"
                    );
                    return hazard;
                }
            }
        }
        HazardResult::none()
    }

    /// Hazard check for the first scope of a layout transition barrier.
    pub fn detect_barrier_hazard(
        &self,
        resource: ResourceId,
        range: AccessRange,
        queue_id: QueueId,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> HazardResult {
        let usage = AccessIndex::ImageLayoutTransition.info();
        if let Some(map) = self.maps.get(&resource) {
            for (_, state) in map.iter_range(&range) {
                let hazard =
                    state.detect_barrier_hazard(usage, queue_id, src_exec_scope, src_access_scope);
                if hazard.is_hazard() {
                    return hazard;
                }
            }
        }
        HazardResult::none()
    }

    /// Racing-hazard check against accesses of an unordered context. Only
    /// this context's accesses on `queue_id` at or after `start_tag` race;
    /// older ones are known to be ordered before the prospective access.
    pub fn detect_async_hazard(
        &self,
        resource: ResourceId,
        range: AccessRange,
        access_index: AccessIndex,
        queue_id: QueueId,
        start_tag: Tag,
    ) -> HazardResult {
        let usage = access_index.info();
        if let Some(map) = self.maps.get(&resource) {
            for (_, state) in map.iter_range(&range) {
                let hazard = state.detect_async_hazard(usage, start_tag, queue_id);
                if hazard.is_hazard() {
                    return hazard;
                }
            }
        }
        HazardResult::none()
    }

    // ---- barriers ----

    /// Apply a batch of independent barriers over a range (or everything the
    /// resource has recorded), then commit pending state at the batch tag.
    /// Barriers of one batch cannot chain through each other.
    pub fn apply_barrier_batch(
        &mut self,
        scope: BarrierScope,
        resource: ResourceId,
        range: Option<AccessRange>,
        barriers: &[SyncBarrier],
        layout_transition: bool,
        layout_transition_handle: HandleIndex,
        tag: Tag,
    ) {
        let mut ops = BarrierBatchOps {
            scope,
            barriers,
            layout_transition,
            layout_transition_handle,
            tag,
        };
        let map = self.map_mut(resource);
        match range {
            Some(range) => map.infill_update_range(range, &mut ops),
            None => {
                for (_, state) in map.iter_mut() {
                    ops.apply(state);
                }
            }
        }
        self.note_mutation(resource);
    }

    /// Apply a barrier batch to every resource this context tracks.
    pub fn apply_global_barrier_batch(&mut self, scope: BarrierScope, barriers: &[SyncBarrier], tag: Tag) {
        let ops = BarrierBatchOps {
            scope,
            barriers,
            layout_transition: false,
            layout_transition_handle: NO_HANDLE,
            tag,
        };
        for map in self.maps.values_mut() {
            for (_, state) in map.iter_mut() {
                ops.apply(state);
            }
            map.consolidate();
        }
    }

    /// Apply a semaphore signal/wait scope pair to every tracked access.
    pub fn apply_semaphore(&mut self, signal: &SemaphoreScope, wait: &SemaphoreScope) {
        for map in self.maps.values_mut() {
            for (_, state) in map.iter_mut() {
                state.apply_semaphore(signal, wait);
            }
        }
    }

    // ---- resolve ----

    /// Absorb the accesses of a child context (a recorded command buffer or
    /// an earlier batch), offsetting its tags into this context's tag space.
    pub fn resolve_from(&mut self, child: &AccessContext, tag_offset: Tag) {
        for (resource, child_map) in &child.maps {
            for (range, child_state) in child_map.iter() {
                let mut incoming = child_state.clone();
                if tag_offset != 0 {
                    incoming.offset_tags(tag_offset);
                }
                let mut ops = ResolveOps {
                    incoming: &incoming,
                };
                self.map_mut(*resource).infill_update_range(range, &mut ops);
            }
            self.note_mutation(*resource);
        }
    }

    /// Replay the first-use log of a recorded context against this one.
    /// `tag_range` restricts the replay to the recorded tags of interest
    /// (relocated into this context's tag space).
    pub fn detect_first_use_hazard(
        &self,
        queue_id: QueueId,
        recorded: &AccessContext,
        tag_range: &TagRange,
    ) -> HazardResult {
        for (resource, recorded_map) in &recorded.maps {
            let Some(active_map) = self.maps.get(resource) else {
                continue;
            };
            if recorded_map.is_empty() || active_map.is_empty() {
                continue;
            }
            // Walk both maps in parallel; over each sub-range both sides are
            // constant, so one state-level replay per sub-range suffices.
            let mut it = ParallelIterator::new(active_map, recorded_map, 0);
            loop {
                if it.pos_a.inside_lower_bound_range && it.pos_b.inside_lower_bound_range {
                    let active_state = active_map.state(&it.pos_a.lower_bound.unwrap()).unwrap();
                    let recorded_state =
                        recorded_map.state(&it.pos_b.lower_bound.unwrap()).unwrap();
                    let hazard =
                        active_state.detect_first_use_hazard(recorded_state, queue_id, tag_range);
                    if hazard.is_hazard() {
                        return hazard;
                    }
                }
                if it.range.is_empty() {
                    break;
                }
                it.advance();
            }
        }
        HazardResult::none()
    }

    /// Racing variant of the first-use replay: the recorded accesses are
    /// checked against this context's accesses on `queue_id` at or after
    /// `start_tag`.
    pub fn detect_async_first_use_hazard(
        &self,
        queue_id: QueueId,
        recorded: &AccessContext,
        tag_range: &TagRange,
        start_tag: Tag,
    ) -> HazardResult {
        for (resource, recorded_map) in &recorded.maps {
            let Some(active_map) = self.maps.get(resource) else {
                continue;
            };
            for (range, recorded_state) in recorded_map.iter() {
                for (_, active_state) in active_map.iter_range(&range) {
                    let hazard = active_state.detect_async_first_use_hazard(
                        recorded_state,
                        tag_range,
                        start_tag,
                        queue_id,
                    );
                    if hazard.is_hazard() {
                        return hazard;
                    }
                }
            }
        }
        HazardResult::none()
    }

    // ---- waits and lifecycle ----

    /// Clear accesses matching a wait predicate within one resource range.
    pub fn clear_predicated_range<P: AccessPredicate>(
        &mut self,
        resource: ResourceId,
        range: AccessRange,
        predicate: &P,
    ) {
        let Some(map) = self.maps.get_mut(&resource) else {
            return;
        };
        let keys: Vec<AccessRange> = map.iter_range(&range).map(|(key, _)| key).collect();
        for key in keys {
            if let Some(state) = map.state_mut(&key) {
                if state.clear_predicated(predicate) {
                    map.erase(&key);
                }
            }
        }
        map.consolidate();
        if map.is_empty() {
            self.maps.remove(&resource);
        }
    }

    /// Clear accesses matching a wait predicate; empty entries and maps are
    /// erased.
    pub fn clear_predicated<P: AccessPredicate>(&mut self, predicate: &P) {
        for map in self.maps.values_mut() {
            let empties: Vec<AccessRange> = map
                .iter_mut()
                .filter_map(|(range, state)| state.clear_predicated(predicate).then_some(range))
                .collect();
            for range in empties {
                map.erase(&range);
            }
            map.consolidate();
        }
        self.maps.retain(|_, map| !map.is_empty());
    }

    /// Relocate every recorded tag by `delta` (applied on submission).
    pub fn offset_tags(&mut self, delta: Tag) {
        if delta == 0 {
            return;
        }
        self.start_tag += delta;
        for map in self.maps.values_mut() {
            for (_, state) in map.iter_mut() {
                state.offset_tags(delta);
            }
        }
    }

    /// Assign a queue to all accesses recorded before submission.
    pub fn set_queue_id(&mut self, queue_id: QueueId) {
        for map in self.maps.values_mut() {
            for (_, state) in map.iter_mut() {
                state.set_queue_id(queue_id);
            }
        }
    }

    /// Canonical form for long-lived submitted state.
    pub fn normalize(&mut self) {
        for map in self.maps.values_mut() {
            for (_, state) in map.iter_mut() {
                state.normalize();
            }
            map.consolidate();
        }
    }

    pub fn gather_referenced_tags(&self, used: &mut TagSet) {
        for map in self.maps.values() {
            for (_, state) in map.iter() {
                state.gather_referenced_tags(used);
            }
        }
    }

    pub fn consolidate(&mut self) {
        for map in self.maps.values_mut() {
            map.consolidate();
        }
    }

    fn note_mutation(&mut self, resource: ResourceId) {
        self.mutations += 1;
        if self.mutations >= self.consolidation_threshold {
            self.mutations = 0;
            if let Some(map) = self.maps.get_mut(&resource) {
                map.consolidate();
            }
        }
    }
}
