use std::collections::BTreeSet;

use smallvec::SmallVec;

use crate::{
    access::{AccessIndex, AccessInfo},
    barrier::{
        intern_layout_ordering, layout_ordering, BarrierScope, OrderingBarrier, OrderingIndex,
        OrderingRule, SemaphoreScope, SyncBarrier, NO_ORDERING_INDEX,
    },
    range::TagRange,
    scope::AccessScope,
    stage::PipelineStages,
    QueueId, Tag, TagEx, HandleIndex, INVALID_QUEUE, INVALID_TAG, NO_HANDLE,
};

bitflags::bitflags! {
    /// Qualifiers of a write access.
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct SyncFlags: u32 {
        /// Attachment load operation.
        const LOAD_OP = 0x01;
        /// Attachment store operation.
        const STORE_OP = 0x02;
        /// Presentation-engine access.
        const PRESENT = 0x04;
        /// Debug marker access.
        const MARKER = 0x08;
    }
}

/// Kind of a detected hazard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum Hazard {
    ReadAfterWrite,
    WriteAfterRead,
    WriteAfterWrite,
    ReadRacingWrite,
    WriteRacingWrite,
    WriteRacingRead,
    /// Once presented, an image may not be written until acquired.
    WriteAfterPresent,
    ReadAfterPresent,
    /// An image must be unreferenced and visible before present.
    PresentAfterRead,
    PresentAfterWrite,
}

/// Broad classification of a hazard kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HazardInfo {
    pub is_write: bool,
    pub is_prior_write: bool,
    pub is_racing: bool,
}

impl Hazard {
    pub fn info(self) -> HazardInfo {
        let (is_write, is_prior_write, is_racing) = match self {
            Hazard::ReadAfterWrite => (false, true, false),
            Hazard::WriteAfterRead => (true, false, false),
            Hazard::WriteAfterWrite => (true, true, false),
            Hazard::ReadRacingWrite => (false, true, true),
            Hazard::WriteRacingWrite => (true, true, true),
            Hazard::WriteRacingRead => (true, false, true),
            Hazard::ReadAfterPresent => (false, true, false),
            Hazard::WriteAfterPresent => (true, true, false),
            Hazard::PresentAfterWrite => (true, true, false),
            Hazard::PresentAfterRead => (true, false, false),
        };
        HazardInfo {
            is_write,
            is_prior_write,
            is_racing,
        }
    }

    /// Stable identifier, suitable for report filtering.
    pub fn as_str(self) -> &'static str {
        match self {
            Hazard::ReadAfterWrite => "READ-AFTER-WRITE",
            Hazard::WriteAfterRead => "WRITE-AFTER-READ",
            Hazard::WriteAfterWrite => "WRITE-AFTER-WRITE",
            Hazard::ReadRacingWrite => "READ-RACING-WRITE",
            Hazard::WriteRacingWrite => "WRITE-RACING-WRITE",
            Hazard::WriteRacingRead => "WRITE-RACING-READ",
            Hazard::WriteAfterPresent => "WRITE-AFTER-PRESENT",
            Hazard::ReadAfterPresent => "READ-AFTER-PRESENT",
            Hazard::PresentAfterRead => "PRESENT-AFTER-READ",
            Hazard::PresentAfterWrite => "PRESENT-AFTER-WRITE",
        }
    }
}

/// One access in the first-use log of a recording.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct FirstAccess {
    pub access_index: AccessIndex,
    pub tag: Tag,
    pub handle_index: HandleIndex,
    pub ordering_rule: OrderingRule,
    pub flags: SyncFlags,
}

impl FirstAccess {
    pub fn tag_ex(&self) -> TagEx {
        TagEx {
            tag: self.tag,
            handle_index: self.handle_index,
        }
    }
}

impl PartialEq for FirstAccess {
    fn eq(&self, rhs: &Self) -> bool {
        self.tag == rhs.tag
            && self.access_index == rhs.access_index
            && self.ordering_rule == rhs.ordering_rule
            && self.flags == rhs.flags
    }
}

/// Per-stage most recent read.
///
/// Multiple reads can be outstanding and independently synchronized, but only
/// one per pipeline stage matters: a newer read from the same stage becomes
/// the applicable one for hazard detection.
#[derive(Clone, Copy, Debug)]
pub struct ReadState {
    /// The single stage of this read.
    pub stage: PipelineStages,
    pub access_index: AccessIndex,
    /// All stages barriered to this read (the second sync scopes).
    pub barriers: PipelineStages,
    /// Stages of reads known to have happened after this one.
    pub sync_stages: PipelineStages,
    pub tag: Tag,
    pub handle_index: HandleIndex,
    pub queue: QueueId,
    /// Nonzero only during barrier batch application.
    pub pending_dep_chain: PipelineStages,
}

impl ReadState {
    pub fn new(stage: PipelineStages, access_index: AccessIndex, tag_ex: TagEx) -> Self {
        let mut read = ReadState {
            stage: PipelineStages::empty(),
            access_index: AccessIndex::None,
            barriers: PipelineStages::empty(),
            sync_stages: PipelineStages::empty(),
            tag: INVALID_TAG,
            handle_index: NO_HANDLE,
            queue: INVALID_QUEUE,
            pending_dep_chain: PipelineStages::empty(),
        };
        read.set(stage, access_index, tag_ex);
        read
    }

    pub fn set(&mut self, stage: PipelineStages, access_index: AccessIndex, tag_ex: TagEx) {
        debug_assert!(access_index != AccessIndex::None);
        self.stage = stage;
        self.access_index = access_index;
        self.barriers = PipelineStages::empty();
        self.sync_stages = PipelineStages::empty();
        self.tag = tag_ex.tag;
        self.handle_index = tag_ex.handle_index;
        self.queue = INVALID_QUEUE;
        // A new read is never part of the barrier set being applied.
        self.pending_dep_chain = PipelineStages::empty();
    }

    pub fn tag_ex(&self) -> TagEx {
        TagEx {
            tag: self.tag,
            handle_index: self.handle_index,
        }
    }

    /// Whether a barrier with the given source scope fails to cover this
    /// read. The read is safe if its stage is in the source scope on the
    /// barrier's queue, or if the scope chains off an existing barrier.
    pub fn is_read_barrier_hazard(
        &self,
        barrier_queue: QueueId,
        mut src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> bool {
        // An all-empty source scope means "no explicit dependency", which the
        // chain test must still treat as reachable from the top of the pipe.
        if src_exec_scope.is_empty() && src_access_scope.none() {
            src_exec_scope = PipelineStages::TOP_OF_PIPE;
        }
        let queue_ordered_stage = if self.queue == barrier_queue {
            self.stage
        } else {
            PipelineStages::empty()
        };
        (src_exec_scope & (queue_ordered_stage | self.barriers)).is_empty()
    }

    pub fn read_in_scope_or_chain(&self, exec_scope: PipelineStages) -> bool {
        exec_scope.intersects(self.stage | self.barriers)
    }

    /// Scope test with queue-submission-order effects: the read's own stage
    /// only counts on its own queue, but barriers applied to it (via
    /// semaphores) can be chained off from anywhere.
    pub fn read_in_queue_scope_or_chain(
        &self,
        scope_queue: QueueId,
        exec_scope: PipelineStages,
    ) -> bool {
        let effective = self.barriers
            | if scope_queue == self.queue {
                self.stage
            } else {
                PipelineStages::empty()
            };
        exec_scope.intersects(effective)
    }

    /// The read was inside the first scope of a set-event iff it happened
    /// before the set on the setting queue.
    pub fn read_in_event_scope(
        &self,
        exec_scope: PipelineStages,
        scope_queue: QueueId,
        scope_tag: Tag,
    ) -> bool {
        self.tag < scope_tag && self.read_in_queue_scope_or_chain(scope_queue, exec_scope)
    }

    pub fn apply_read_barrier(&mut self, dst_exec_scope: PipelineStages) {
        self.pending_dep_chain |= dst_exec_scope;
    }

    pub fn apply_pending_barriers(&mut self) -> PipelineStages {
        self.barriers |= self.pending_dep_chain;
        self.pending_dep_chain = PipelineStages::empty();
        self.barriers
    }
}

impl PartialEq for ReadState {
    fn eq(&self, rhs: &Self) -> bool {
        // Handle index is reporting metadata, not synchronization state.
        self.stage == rhs.stage
            && self.access_index == rhs.access_index
            && self.barriers == rhs.barriers
            && self.sync_stages == rhs.sync_stages
            && self.tag == rhs.tag
            && self.queue == rhs.queue
    }
}

/// The most recent write to a range.
///
/// Reads are each required to be safe relative to their prior write, so only
/// the most recent write needs to be kept: anything transitively unsafe is
/// already covered.
#[derive(Clone, Copy, Debug)]
pub struct WriteState {
    pub access_index: AccessIndex,
    pub flags: SyncFlags,
    /// Union of destination access scopes of barriers covering this write.
    pub barriers: AccessScope,
    /// Accumulated destination stages of barriers that chain off this write.
    pub dependency_chain: PipelineStages,
    pub tag: Tag,
    pub handle_index: HandleIndex,
    pub queue: QueueId,

    pending_barriers: AccessScope,
    pending_dep_chain: PipelineStages,
    pending_layout_ordering: OrderingBarrier,
}

impl WriteState {
    pub fn new(access_index: AccessIndex, tag_ex: TagEx, flags: SyncFlags) -> Self {
        WriteState {
            access_index,
            flags,
            barriers: AccessScope::empty(),
            dependency_chain: PipelineStages::empty(),
            tag: tag_ex.tag,
            handle_index: tag_ex.handle_index,
            queue: INVALID_QUEUE,
            pending_barriers: AccessScope::empty(),
            pending_dep_chain: PipelineStages::empty(),
            pending_layout_ordering: OrderingBarrier::default(),
        }
    }

    /// Overwrite the identity of the write and drop accumulated visibility.
    /// Pending state is intentionally left alone; the caller commits or
    /// clears it through `apply_pending_barriers`.
    pub fn set(&mut self, access_index: AccessIndex, tag_ex: TagEx, flags: SyncFlags) {
        self.access_index = access_index;
        self.flags = flags;
        self.barriers.reset();
        self.dependency_chain = PipelineStages::empty();
        self.tag = tag_ex.tag;
        self.handle_index = tag_ex.handle_index;
        self.queue = INVALID_QUEUE;
    }

    pub fn tag_ex(&self) -> TagEx {
        TagEx {
            tag: self.tag,
            handle_index: self.handle_index,
        }
    }

    pub fn is_index(&self, access_index: AccessIndex) -> bool {
        self.access_index == access_index
    }

    pub fn is_queue(&self, queue: QueueId) -> bool {
        self.queue == queue
    }

    pub fn is_load_op(&self) -> bool {
        self.flags.contains(SyncFlags::LOAD_OP)
    }

    pub fn is_store_op(&self) -> bool {
        self.flags.contains(SyncFlags::STORE_OP)
    }

    pub fn is_present(&self) -> bool {
        self.flags.contains(SyncFlags::PRESENT)
    }

    /// The write is unsafe to a new access unless that access has been made
    /// visible by an applied barrier.
    pub fn is_write_hazard(&self, usage: &AccessInfo) -> bool {
        !self.barriers.contains(usage.access_index)
    }

    pub fn is_ordered(&self, ordering: &OrderingBarrier, queue_id: QueueId) -> bool {
        self.queue == queue_id && ordering.access_scope.contains(self.access_index)
    }

    pub fn write_in_chain(&self, src_exec_scope: PipelineStages) -> bool {
        self.dependency_chain.intersects(src_exec_scope)
    }

    pub fn write_in_scope(&self, src_access_scope: &AccessScope) -> bool {
        src_access_scope.contains(self.access_index)
    }

    pub fn write_in_source_scope_or_chain(
        &self,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> bool {
        self.write_in_chain(src_exec_scope) || self.write_in_scope(src_access_scope)
    }

    pub fn write_in_queue_source_scope_or_chain(
        &self,
        queue: QueueId,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> bool {
        self.write_in_chain(src_exec_scope)
            || (queue == self.queue && self.write_in_scope(src_access_scope))
    }

    /// The write was already inside the first sync scope of a set-event when
    /// the event was set, i.e. it predates the set on the setting queue.
    pub fn write_in_event_scope(
        &self,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
        scope_queue: QueueId,
        scope_tag: Tag,
    ) -> bool {
        self.tag < scope_tag
            && self.write_in_queue_source_scope_or_chain(scope_queue, src_exec_scope, src_access_scope)
    }

    /// Whether a barrier with the given source scope fails to cover this
    /// write.
    pub fn is_write_barrier_hazard(
        &self,
        queue_id: QueueId,
        mut src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> bool {
        // See `ReadState::is_read_barrier_hazard` for the empty-scope rule.
        if src_exec_scope.is_empty() && src_access_scope.none() {
            src_exec_scope = PipelineStages::TOP_OF_PIPE;
        }

        // Sequential layout transitions have their own rules.
        if self.is_index(AccessIndex::ImageLayoutTransition) {
            if queue_id == self.queue {
                // In queue, they are implicitly ordered.
                return false;
            }
            // Across queues the first transition must be in the chain.
            return !self.write_in_chain(src_exec_scope);
        }

        // A write in the chain is available, and available writes are made
        // visible by the transition.
        if self.write_in_chain(src_exec_scope) {
            return false;
        }
        !self.write_in_scope(src_access_scope)
    }

    pub fn merge_barriers(&mut self, other: &WriteState) {
        self.barriers |= other.barriers;
        self.dependency_chain |= other.dependency_chain;

        self.pending_barriers |= other.pending_barriers;
        self.pending_dep_chain |= other.pending_dep_chain;
        self.pending_layout_ordering.merge(&other.pending_layout_ordering);
    }

    pub fn update_pending_barriers(&mut self, barrier: &SyncBarrier) {
        self.pending_barriers |= barrier.dst_access_scope;
        self.pending_dep_chain |= barrier.dst_exec_scope.exec_scope;
    }

    pub fn update_pending_layout_ordering(&mut self, barrier: &SyncBarrier) {
        self.pending_layout_ordering.merge(&OrderingBarrier::new(
            barrier.src_exec_scope.exec_scope,
            barrier.src_access_scope,
        ));
    }

    pub fn pending_layout_ordering(&self) -> &OrderingBarrier {
        &self.pending_layout_ordering
    }

    pub fn has_pending_state(&self) -> bool {
        self.pending_barriers.any() || !self.pending_dep_chain.is_empty()
    }

    pub fn apply_pending_barriers(&mut self) {
        self.dependency_chain |= self.pending_dep_chain;
        self.barriers |= self.pending_barriers;

        self.pending_dep_chain = PipelineStages::empty();
        self.pending_barriers.reset();
        self.pending_layout_ordering = OrderingBarrier::default();
    }

    pub fn set_queue_id(&mut self, id: QueueId) {
        if self.queue == INVALID_QUEUE {
            self.queue = id;
        }
    }

    pub fn offset_tag(&mut self, offset: Tag) {
        self.tag += offset;
    }

    pub(crate) fn set_barriers_for_semaphore(
        &mut self,
        barriers: AccessScope,
        dependency_chain: PipelineStages,
    ) {
        self.barriers = barriers;
        self.dependency_chain = dependency_chain;
    }
}

impl PartialEq for WriteState {
    fn eq(&self, rhs: &Self) -> bool {
        // Flags and handle index are reporting metadata.
        self.access_index == rhs.access_index
            && self.barriers == rhs.barriers
            && self.tag == rhs.tag
            && self.queue == rhs.queue
            && self.dependency_chain == rhs.dependency_chain
    }
}

/// Snapshot and description of a detected hazard.
#[derive(Clone, Debug)]
pub struct HazardState {
    /// Deep copy of the access state the hazard was detected against.
    pub access_state: Box<AccessState>,
    /// The first-use record that surfaced the hazard during replay, if any.
    pub recorded_access: Option<FirstAccess>,
    /// The access that was attempted.
    pub access_index: AccessIndex,
    /// The conflicting prior access.
    pub prior_access_index: AccessIndex,
    /// Tag of the prior access.
    pub tag: Tag,
    pub handle_index: HandleIndex,
    pub hazard: Hazard,
}

/// Result of a hazard check. Empty when the access is safe.
#[derive(Clone, Debug, Default)]
pub struct HazardResult {
    state: Option<Box<HazardState>>,
}

impl HazardResult {
    fn new(
        access_state: &AccessState,
        usage: &AccessInfo,
        hazard: Hazard,
        prior_access_index: AccessIndex,
        prior_tag_ex: TagEx,
    ) -> Self {
        debug_assert!(prior_access_index != AccessIndex::None);
        // Touch up the hazard to reflect present-as-release semantics.
        let hazard = if access_state.is_last_write(AccessIndex::PresentEnginePresented) {
            match hazard {
                Hazard::ReadAfterWrite => Hazard::ReadAfterPresent,
                Hazard::WriteAfterWrite => Hazard::WriteAfterPresent,
                other => other,
            }
        } else if usage.access_index == AccessIndex::PresentEnginePresented {
            match hazard {
                Hazard::WriteAfterRead => Hazard::PresentAfterRead,
                Hazard::WriteAfterWrite => Hazard::PresentAfterWrite,
                other => other,
            }
        } else {
            hazard
        };
        HazardResult {
            state: Some(Box::new(HazardState {
                access_state: Box::new(access_state.clone()),
                recorded_access: None,
                access_index: usage.access_index,
                prior_access_index,
                tag: prior_tag_ex.tag,
                handle_index: prior_tag_ex.handle_index,
                hazard,
            })),
        }
    }

    pub fn vs_prior_write(
        access_state: &AccessState,
        usage: &AccessInfo,
        hazard: Hazard,
        prior_write: &WriteState,
    ) -> Self {
        HazardResult::new(
            access_state,
            usage,
            hazard,
            prior_write.access_index,
            prior_write.tag_ex(),
        )
    }

    pub fn vs_prior_read(
        access_state: &AccessState,
        usage: &AccessInfo,
        hazard: Hazard,
        prior_read: &ReadState,
    ) -> Self {
        HazardResult::new(
            access_state,
            usage,
            hazard,
            prior_read.access_index,
            prior_read.tag_ex(),
        )
    }

    pub const fn none() -> Self {
        HazardResult { state: None }
    }

    pub fn is_hazard(&self) -> bool {
        self.state.is_some()
    }

    pub fn hazard(&self) -> Option<Hazard> {
        self.state.as_ref().map(|s| s.hazard)
    }

    pub fn tag(&self) -> Option<Tag> {
        self.state.as_ref().map(|s| s.tag)
    }

    pub fn tag_ex(&self) -> Option<TagEx> {
        self.state.as_ref().map(|s| TagEx {
            tag: s.tag,
            handle_index: s.handle_index,
        })
    }

    pub fn state(&self) -> Option<&HazardState> {
        self.state.as_deref()
    }

    pub fn is_waw_hazard(&self) -> bool {
        match &self.state {
            Some(s) => s.hazard == Hazard::WriteAfterWrite && s.prior_access_index == s.access_index,
            None => false,
        }
    }

    pub fn add_recorded_access(&mut self, first_access: &FirstAccess) {
        if let Some(state) = &mut self.state {
            state.recorded_access = Some(*first_access);
        }
    }

    /// Undo the present-specific remapping when present reporting is off.
    pub fn demote_present(&mut self) {
        if let Some(state) = &mut self.state {
            state.hazard = match state.hazard {
                Hazard::ReadAfterPresent => Hazard::ReadAfterWrite,
                Hazard::WriteAfterPresent => Hazard::WriteAfterWrite,
                Hazard::PresentAfterRead => Hazard::WriteAfterRead,
                Hazard::PresentAfterWrite => Hazard::WriteAfterWrite,
                other => other,
            };
        }
    }
}

/// Predicate deciding which accesses a wait operation synchronizes.
pub trait AccessPredicate {
    fn read(&self, read: &ReadState) -> bool;
    fn write(&self, write: &WriteState) -> bool;
}

/// Queue wait: everything on the queue up to and including `tag`.
#[derive(Clone, Copy, Debug)]
pub struct WaitQueueTagPredicate {
    pub queue: QueueId,
    pub tag: Tag,
}

impl AccessPredicate for WaitQueueTagPredicate {
    fn read(&self, read: &ReadState) -> bool {
        read.queue == self.queue
            && read.tag <= self.tag
            && read.stage != PipelineStages::PRESENT_ENGINE
    }

    fn write(&self, write: &WriteState) -> bool {
        write.is_queue(self.queue)
            && write.tag <= self.tag
            && !write.is_index(AccessIndex::PresentEnginePresented)
    }
}

/// Device or fence wait: everything up to and including `tag`.
#[derive(Clone, Copy, Debug)]
pub struct WaitTagPredicate {
    pub tag: Tag,
}

impl AccessPredicate for WaitTagPredicate {
    fn read(&self, read: &ReadState) -> bool {
        read.tag <= self.tag && read.stage != PipelineStages::PRESENT_ENGINE
    }

    fn write(&self, write: &WriteState) -> bool {
        write.tag <= self.tag && !write.is_index(AccessIndex::PresentEnginePresented)
    }
}

/// Swapchain acquire: only the exactly tagged present and acquire accesses.
#[derive(Clone, Copy, Debug)]
pub struct WaitAcquirePredicate {
    pub present_tag: Tag,
    pub acquire_tag: Tag,
}

impl AccessPredicate for WaitAcquirePredicate {
    fn read(&self, read: &ReadState) -> bool {
        read.tag == self.acquire_tag && read.stage == PipelineStages::PRESENT_ENGINE
    }

    fn write(&self, write: &WriteState) -> bool {
        write.tag == self.present_tag && write.is_index(AccessIndex::PresentEnginePresented)
    }
}

/// Set of referenced tags with a small direct-mapped insert cache in front
/// of the ordered set, for the heavy repeat-insert traffic of tag gathering.
#[derive(Clone, Debug)]
pub struct TagSet {
    cache: [Tag; TagSet::CACHE_SIZE],
    set: BTreeSet<Tag>,
}

impl TagSet {
    const CACHE_SIZE: usize = 16;

    pub fn new() -> Self {
        TagSet {
            cache: [INVALID_TAG; TagSet::CACHE_SIZE],
            set: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, tag: Tag) {
        let slot = (tag as usize) & (TagSet::CACHE_SIZE - 1);
        if self.cache[slot] != tag {
            self.cache[slot] = tag;
            self.set.insert(tag);
        }
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.set.contains(&tag)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.set.iter()
    }
}

impl Default for TagSet {
    fn default() -> Self {
        TagSet::new()
    }
}

type ReadStates = SmallVec<[ReadState; 1]>;
type FirstAccesses = SmallVec<[FirstAccess; 2]>;

/// Per-range access state machine: the most recent write, the per-stage most
/// recent reads, and the first-use log of the hosting recording.
#[derive(Clone, Debug)]
pub struct AccessState {
    last_write: Option<WriteState>,

    last_reads: ReadStates,
    last_read_stages: PipelineStages,
    /// Union of every read's `barriers`.
    read_execution_barriers: PipelineStages,

    /// Whether the tracked fragment-shader read is an input-attachment read.
    input_attachment_read: bool,

    /// Set while a barrier batch with a layout transition is pending; the
    /// commit installs the transition write. Can exist without `last_write`.
    pending_layout_transition: bool,
    pending_layout_transition_handle: HandleIndex,

    first_accesses: FirstAccesses,
    first_read_stages: PipelineStages,
    first_write_layout_ordering_index: OrderingIndex,
    first_access_closed: bool,
}

impl PartialEq for AccessState {
    fn eq(&self, rhs: &Self) -> bool {
        self.read_execution_barriers == rhs.read_execution_barriers
            && self.input_attachment_read == rhs.input_attachment_read
            && self.last_write == rhs.last_write
            && self.last_read_stages == rhs.last_read_stages
            && self.last_reads == rhs.last_reads
            && self.first_accesses == rhs.first_accesses
            && self.first_read_stages == rhs.first_read_stages
            && self.first_write_layout_ordering_index == rhs.first_write_layout_ordering_index
    }
}

impl Default for AccessState {
    fn default() -> Self {
        AccessState::new()
    }
}

impl AccessState {
    pub fn new() -> Self {
        AccessState {
            last_write: None,
            last_reads: ReadStates::new_const(),
            last_read_stages: PipelineStages::empty(),
            read_execution_barriers: PipelineStages::empty(),
            input_attachment_read: false,
            pending_layout_transition: false,
            pending_layout_transition_handle: NO_HANDLE,
            first_accesses: FirstAccesses::new_const(),
            first_read_stages: PipelineStages::empty(),
            first_write_layout_ordering_index: NO_ORDERING_INDEX,
            first_access_closed: false,
        }
    }

    // ---- hazard detection ----

    /// Hazard check with no ordering rules: the access must be covered by
    /// explicit synchronization.
    pub fn detect_hazard(&self, usage: &AccessInfo) -> HazardResult {
        if usage.is_read {
            if self.is_raw_hazard(usage) {
                return HazardResult::vs_prior_write(
                    self,
                    usage,
                    Hazard::ReadAfterWrite,
                    self.last_write.as_ref().unwrap(),
                );
            }
        } else {
            // If reads exist, test only against them: either they were
            // hazards (already reported) or they are ordered after the last
            // write, making the write test redundant.
            if !self.last_reads.is_empty() {
                for read_access in &self.last_reads {
                    if self.is_read_hazard(usage.stage, read_access) {
                        return HazardResult::vs_prior_read(
                            self,
                            usage,
                            Hazard::WriteAfterRead,
                            read_access,
                        );
                    }
                }
            } else if let Some(last_write) = &self.last_write {
                if last_write.is_write_hazard(usage) {
                    return HazardResult::vs_prior_write(
                        self,
                        usage,
                        Hazard::WriteAfterWrite,
                        last_write,
                    );
                }
            }
        }
        HazardResult::none()
    }

    pub fn detect_hazard_with_rule(
        &self,
        usage: &AccessInfo,
        ordering_rule: OrderingRule,
        queue_id: QueueId,
    ) -> HazardResult {
        self.detect_hazard_with_ordering(usage, ordering_rule.barrier(), queue_id)
    }

    /// Hazard check with implicit ordering guarantees acting as a barrier
    /// against the most recent accesses.
    pub fn detect_hazard_with_ordering(
        &self,
        usage: &AccessInfo,
        ordering: &OrderingBarrier,
        queue_id: QueueId,
    ) -> HazardResult {
        let usage_stage = usage.stage;
        let input_attachment_ordering = ordering
            .access_scope
            .contains(AccessIndex::FragmentShaderInputAttachmentRead);

        if usage.is_read {
            let mut is_raw_hazard = self.is_raw_hazard(usage);
            if is_raw_hazard {
                // See if the ordering rules save us from the plain RAW check:
                // the usage must be ordered, and so must the most recent
                // write or a read subsequent to it.
                let usage_is_input_attachment =
                    usage.access_index == AccessIndex::FragmentShaderInputAttachmentRead;
                let usage_is_ordered = (input_attachment_ordering && usage_is_input_attachment)
                    || ordering.exec_scope.intersects(usage_stage);
                if usage_is_ordered {
                    let most_recent_is_ordered = self
                        .last_write
                        .as_ref()
                        .map_or(false, |w| w.is_ordered(ordering, queue_id))
                        || !self.get_ordered_stages(queue_id, ordering).is_empty();
                    is_raw_hazard = !most_recent_is_ordered;
                }
            }
            if is_raw_hazard {
                return HazardResult::vs_prior_write(
                    self,
                    usage,
                    Hazard::ReadAfterWrite,
                    self.last_write.as_ref().unwrap(),
                );
            }
        } else if usage.access_index == AccessIndex::ImageLayoutTransition {
            // The ordering barrier carries the first sync scope of the
            // layout transition.
            return self.detect_barrier_hazard(
                usage,
                queue_id,
                ordering.exec_scope,
                &ordering.access_scope,
            );
        } else {
            let usage_write_is_ordered = ordering.access_scope.contains(usage.access_index);
            if !self.last_reads.is_empty() {
                // Look for WAR hazards outside the ordered set of stages.
                let ordered_stages = if usage_write_is_ordered {
                    self.get_ordered_stages(queue_id, ordering)
                } else {
                    PipelineStages::empty()
                };
                if ordered_stages & self.last_read_stages != self.last_read_stages {
                    for read_access in &self.last_reads {
                        if ordered_stages.intersects(read_access.stage) {
                            continue;
                        }
                        if self.is_read_hazard(usage_stage, read_access) {
                            return HazardResult::vs_prior_read(
                                self,
                                usage,
                                Hazard::WriteAfterRead,
                                read_access,
                            );
                        }
                    }
                }
            } else if let Some(last_write) = &self.last_write {
                if !(last_write.is_ordered(ordering, queue_id) && usage_write_is_ordered) {
                    // Transition after transition checks the second sync
                    // scope of the first against the first sync scope of the
                    // second, which the caller passed in the ordering.
                    let ilt_ilt_hazard = usage.access_index == AccessIndex::ImageLayoutTransition
                        && last_write.is_index(AccessIndex::ImageLayoutTransition)
                        && !(last_write.barriers & ordering.access_scope).any();
                    if ilt_ilt_hazard || last_write.is_write_hazard(usage) {
                        return HazardResult::vs_prior_write(
                            self,
                            usage,
                            Hazard::WriteAfterWrite,
                            last_write,
                        );
                    }
                }
            }
        }
        HazardResult::none()
    }

    /// Replay a recorded first-use log against this state.
    pub fn detect_first_use_hazard(
        &self,
        recorded: &AccessState,
        queue_id: QueueId,
        tag_range: &TagRange,
    ) -> HazardResult {
        let recorded_accesses = &recorded.first_accesses;
        let mut count = recorded_accesses.len();
        if count == 0 {
            return HazardResult::none();
        }

        // The log is closed iff the last entry is a write; writes get the
        // special handling below.
        let mut do_write_last = recorded.first_access_closed;
        if do_write_last {
            count -= 1;
        }

        for first in &recorded_accesses[..count] {
            if first.tag < tag_range.begin {
                continue;
            }
            if first.tag >= tag_range.end {
                // The last entry can't be in the tag range either.
                do_write_last = false;
                break;
            }

            let mut hazard = self.detect_hazard_with_rule(
                first.access_index.info(),
                first.ordering_rule,
                queue_id,
            );
            if hazard.is_hazard() {
                hazard.add_recorded_access(first);
                return hazard;
            }
        }

        if do_write_last {
            let last_access = recorded_accesses.last().unwrap();
            if tag_range.includes(last_access.tag) {
                let mut barrier = *last_access.ordering_rule.barrier();
                if last_access.access_index == AccessIndex::ImageLayoutTransition {
                    // A recorded first-write transition straddles the barrier
                    // that applied it; its saved first scope joins the rule.
                    barrier.merge(&layout_ordering(recorded.first_write_layout_ordering_index));
                }
                if !recorded.first_read_stages.is_empty() {
                    // Read stages present in the recorded context are most
                    // recent relative to its write; suppress RAW against the
                    // active context for those stages, and WAW by injecting
                    // the write into the rule.
                    barrier.exec_scope |= recorded.first_read_stages;
                    barrier
                        .access_scope
                        .set(last_access.access_index);
                }
                let mut hazard = self.detect_hazard_with_ordering(
                    last_access.access_index.info(),
                    &barrier,
                    queue_id,
                );
                if hazard.is_hazard() {
                    hazard.add_recorded_access(last_access);
                    return hazard;
                }
            }
        }
        HazardResult::none()
    }

    /// Racing hazards between contexts with no ordering path between them.
    /// Only accesses at or after `start_tag` on `queue_id` participate;
    /// anything older was checked when the racing context began.
    pub fn detect_async_hazard(
        &self,
        usage: &AccessInfo,
        start_tag: Tag,
        queue_id: QueueId,
    ) -> HazardResult {
        if usage.is_read {
            if let Some(write) = &self.last_write {
                if write.is_queue(queue_id) && write.tag >= start_tag {
                    return HazardResult::vs_prior_write(
                        self,
                        usage,
                        Hazard::ReadRacingWrite,
                        write,
                    );
                }
            }
        } else {
            if let Some(write) = &self.last_write {
                if write.is_queue(queue_id) && write.tag >= start_tag {
                    return HazardResult::vs_prior_write(
                        self,
                        usage,
                        Hazard::WriteRacingWrite,
                        write,
                    );
                }
            }
            for read_access in &self.last_reads {
                if read_access.queue == queue_id && read_access.tag >= start_tag {
                    return HazardResult::vs_prior_read(
                        self,
                        usage,
                        Hazard::WriteRacingRead,
                        read_access,
                    );
                }
            }
        }
        HazardResult::none()
    }

    pub fn detect_async_first_use_hazard(
        &self,
        recorded: &AccessState,
        tag_range: &TagRange,
        start_tag: Tag,
        queue_id: QueueId,
    ) -> HazardResult {
        for first in &recorded.first_accesses {
            if first.tag < tag_range.begin {
                continue;
            }
            if first.tag >= tag_range.end {
                break;
            }
            let mut hazard =
                self.detect_async_hazard(first.access_index.info(), start_tag, queue_id);
            if hazard.is_hazard() {
                hazard.add_recorded_access(first);
                return hazard;
            }
        }
        HazardResult::none()
    }

    /// Hazard check for a barrier's first scope against this state. Only
    /// layout transitions are modelled as barrier-writes.
    pub fn detect_barrier_hazard(
        &self,
        usage: &AccessInfo,
        queue_id: QueueId,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> HazardResult {
        debug_assert!(usage.access_index == AccessIndex::ImageLayoutTransition);

        // Only test for WAW when there are no intervening reads.
        if !self.last_reads.is_empty() {
            for read_access in &self.last_reads {
                if read_access.is_read_barrier_hazard(queue_id, src_exec_scope, src_access_scope) {
                    return HazardResult::vs_prior_read(
                        self,
                        usage,
                        Hazard::WriteAfterRead,
                        read_access,
                    );
                }
            }
        } else if let Some(last_write) = &self.last_write {
            if last_write.is_write_barrier_hazard(queue_id, src_exec_scope, src_access_scope) {
                return HazardResult::vs_prior_write(
                    self,
                    usage,
                    Hazard::WriteAfterWrite,
                    last_write,
                );
            }
        }
        HazardResult::none()
    }

    /// Event-wait variant: accesses are compared against the snapshot taken
    /// at set-event time; anything after the set tag escapes the scope.
    pub fn detect_event_barrier_hazard(
        &self,
        usage: &AccessInfo,
        scope_state: &AccessState,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
        event_queue: QueueId,
        event_tag: Tag,
    ) -> HazardResult {
        debug_assert!(usage.access_index == AccessIndex::ImageLayoutTransition);

        if let Some(last_write) = &self.last_write {
            if last_write.tag >= event_tag {
                // A write after the set-event cannot be in its first scope.
                return HazardResult::vs_prior_write(
                    self,
                    usage,
                    Hazard::WriteAfterWrite,
                    last_write,
                );
            }
        }

        if !self.last_reads.is_empty() {
            // Because there has been no write since the set, the current
            // reads are a superset of the scoped ones in the same stage
            // order.
            let scope_reads = &scope_state.last_reads;
            debug_assert!(self.last_reads.len() >= scope_reads.len());
            for (scope_read, current_read) in scope_reads.iter().zip(self.last_reads.iter()) {
                debug_assert!(scope_read.stage == current_read.stage);
                if current_read.tag > event_tag {
                    // More recent than the set; no barrier from the wait.
                    return HazardResult::vs_prior_read(
                        self,
                        usage,
                        Hazard::WriteAfterRead,
                        current_read,
                    );
                }
                if scope_read.is_read_barrier_hazard(event_queue, src_exec_scope, src_access_scope)
                {
                    return HazardResult::vs_prior_read(
                        self,
                        usage,
                        Hazard::WriteAfterRead,
                        scope_read,
                    );
                }
            }
            if self.last_reads.len() > scope_reads.len() {
                let current_read = &self.last_reads[scope_reads.len()];
                return HazardResult::vs_prior_read(
                    self,
                    usage,
                    Hazard::WriteAfterRead,
                    current_read,
                );
            }
        } else if self.last_write.is_some() {
            // With no reads, the write is either the reason the range is in
            // the event scope or a hazard; run the normal barrier check on
            // the scope snapshot.
            if let Some(scope_write) = &scope_state.last_write {
                if scope_write.is_write_barrier_hazard(event_queue, src_exec_scope, src_access_scope)
                {
                    return HazardResult::vs_prior_write(
                        scope_state,
                        usage,
                        Hazard::WriteAfterWrite,
                        scope_write,
                    );
                }
            }
        }
        HazardResult::none()
    }

    // ---- update ----

    /// Record an accepted access.
    pub fn update(
        &mut self,
        usage: &AccessInfo,
        ordering_rule: OrderingRule,
        tag_ex: TagEx,
        flags: SyncFlags,
    ) {
        let usage_stage = usage.stage;
        if usage.is_read {
            // Multiple outstanding reads chain independently, but only one
            // per stage matters for barrier tracking.
            if self.last_read_stages.intersects(usage_stage) {
                for read_access in &mut self.last_reads {
                    if read_access.stage == usage_stage {
                        read_access.set(usage_stage, usage.access_index, tag_ex);
                    } else if read_access.barriers.intersects(usage_stage) {
                        // The new access is barriered to this read, so it is
                        // known to happen after it.
                        read_access.sync_stages |= usage_stage;
                    } else {
                        // Not barriered: semaphores can clear effective
                        // barriers, so the old happens-after claim may no
                        // longer hold.
                        read_access.sync_stages -= usage_stage;
                    }
                }
            } else {
                for read_access in &mut self.last_reads {
                    if read_access.barriers.intersects(usage_stage) {
                        read_access.sync_stages |= usage_stage;
                    }
                }
                self.last_reads
                    .push(ReadState::new(usage_stage, usage.access_index, tag_ex));
                self.last_read_stages |= usage_stage;
            }

            // Fragment-shader reads come in two flavors; track whether the
            // current one is the input-attachment kind.
            if usage_stage == PipelineStages::FRAGMENT_SHADER {
                self.input_attachment_read =
                    usage.access_index == AccessIndex::FragmentShaderInputAttachmentRead;
            }
        } else {
            self.set_write(usage.access_index, tag_ex, flags);
        }
        self.update_first(tag_ex, usage, ordering_rule, flags);
    }

    /// Install a new write: all prior reads and accumulated visibility are
    /// clobbered, as this write is now after them. Pending barrier state is
    /// deliberately untouched.
    pub fn set_write(&mut self, access_index: AccessIndex, tag_ex: TagEx, flags: SyncFlags) {
        self.clear_read();
        match &mut self.last_write {
            Some(write) => write.set(access_index, tag_ex, flags),
            None => self.last_write = Some(WriteState::new(access_index, tag_ex, flags)),
        }
    }

    pub fn clear_write(&mut self) {
        self.last_write = None;
    }

    pub fn clear_read(&mut self) {
        self.last_reads.clear();
        self.last_read_stages = PipelineStages::empty();
        self.read_execution_barriers = PipelineStages::empty();
        self.input_attachment_read = false;
    }

    pub fn clear_first_use(&mut self) {
        self.first_accesses.clear();
        self.first_read_stages = PipelineStages::empty();
        self.first_write_layout_ordering_index = NO_ORDERING_INDEX;
        self.first_access_closed = false;
    }

    // ---- resolve ----

    /// Merge `other` into this state over the same range.
    ///
    /// Hazards between the two must already have been reported: an early
    /// hazard can mask a later one, but fixing it either fixes or unmasks
    /// the rest.
    pub fn resolve(&mut self, other: &AccessState) {
        let mut skip_first = false;
        match (self.last_write, other.last_write) {
            (Some(my_write), Some(other_write)) => {
                if my_write.tag < other_write.tag {
                    // Other is the more recent operation; adopt it wholesale.
                    *self = other.clone();
                    skip_first = true;
                } else if my_write.tag == other_write.tag {
                    // Same write from both paths: union barriers and reads,
                    // without chaining logic or stage expansion.
                    self.last_write
                        .as_mut()
                        .unwrap()
                        .merge_barriers(&other_write);
                    self.merge_pending(other);
                    self.merge_reads(other);
                } else {
                    // Other's write is older; first-use has been closed
                    // since before it, nothing to merge.
                    skip_first = true;
                }
            }
            (Some(_), None) => {
                // Only this side has a write; other's reads are at best
                // async and already reported.
                skip_first = true;
            }
            (None, Some(_)) => {
                *self = other.clone();
                skip_first = true;
            }
            (None, None) => {
                self.merge_pending(other);
                self.merge_reads(other);
            }
        }

        // Rebuild the first-use log as a tag-ordered shuffle of both logs.
        if !skip_first
            && self.first_accesses != other.first_accesses
            && !other.first_accesses.is_empty()
        {
            let mine = std::mem::take(&mut self.first_accesses);
            self.clear_first_use();
            let mut a = mine.iter().peekable();
            for b in &other.first_accesses {
                while let Some(first) = a.peek() {
                    if first.tag < b.tag {
                        self.update_first(
                            first.tag_ex(),
                            first.access_index.info(),
                            first.ordering_rule,
                            first.flags,
                        );
                        a.next();
                    } else {
                        break;
                    }
                }
                self.update_first(b.tag_ex(), b.access_index.info(), b.ordering_rule, b.flags);
            }
            for first in a {
                self.update_first(
                    first.tag_ex(),
                    first.access_index.info(),
                    first.ordering_rule,
                    first.flags,
                );
            }
        }
    }

    fn merge_pending(&mut self, other: &AccessState) {
        self.pending_layout_transition |= other.pending_layout_transition;
    }

    fn merge_reads(&mut self, other: &AccessState) {
        let pre_merge_count = self.last_reads.len();
        let pre_merge_stages = self.last_read_stages;
        for other_read in &other.last_reads {
            if pre_merge_stages.intersects(other_read.stage) {
                for my_read in &mut self.last_reads[..pre_merge_count] {
                    if other_read.stage != my_read.stage {
                        continue;
                    }
                    if my_read.tag < other_read.tag {
                        // Other is more recent; copy in its state.
                        my_read.access_index = other_read.access_index;
                        my_read.tag = other_read.tag;
                        my_read.handle_index = other_read.handle_index;
                        my_read.queue = other_read.queue;
                        my_read.pending_dep_chain = other_read.pending_dep_chain;
                        my_read.barriers = other_read.barriers;
                        my_read.sync_stages = other_read.sync_stages;
                        if my_read.stage == PipelineStages::FRAGMENT_SHADER {
                            self.input_attachment_read = other.input_attachment_read;
                        }
                    } else if other_read.tag == my_read.tag {
                        // Matching tags: merge the barriers.
                        my_read.barriers |= other_read.barriers;
                        my_read.sync_stages |= other_read.sync_stages;
                        my_read.pending_dep_chain |= other_read.pending_dep_chain;
                    }
                    break;
                }
            } else {
                self.last_reads.push(*other_read);
                self.last_read_stages |= other_read.stage;
                if other_read.stage == PipelineStages::FRAGMENT_SHADER {
                    self.input_attachment_read = other.input_attachment_read;
                }
            }
        }
        self.read_execution_barriers |= other.read_execution_barriers;
    }

    // ---- barrier application ----

    /// Apply one barrier of a batch, accumulating into pending state only so
    /// that barriers of the same batch cannot chain through each other.
    pub fn apply_barrier(
        &mut self,
        scope: &BarrierScope,
        barrier: &SyncBarrier,
        layout_transition: bool,
        layout_transition_handle: HandleIndex,
    ) {
        if layout_transition {
            // The transition is modelled as a write in scope with the
            // barrier; if the current accesses aren't safe against it,
            // `detect_barrier_hazard` reports that separately.
            if self.last_write.is_none() {
                self.last_write = Some(WriteState::new(
                    AccessIndex::None,
                    TagEx::default(),
                    SyncFlags::empty(),
                ));
            }
            let write = self.last_write.as_mut().unwrap();
            write.update_pending_barriers(barrier);
            write.update_pending_layout_ordering(barrier);
            self.pending_layout_transition = true;
            if layout_transition_handle != NO_HANDLE {
                self.pending_layout_transition_handle = layout_transition_handle;
            }
        } else {
            if self.last_write.is_some() && scope.write_in_scope(barrier, self) {
                self.last_write
                    .as_mut()
                    .unwrap()
                    .update_pending_barriers(barrier);
            }

            if !self.pending_layout_transition {
                // A pending transition will clear the reads at commit, so
                // their chains don't need tracking.
                let mut stages_in_scope = PipelineStages::empty();
                for read_access in &self.last_reads {
                    if scope.read_in_scope(barrier, read_access) {
                        stages_in_scope |= read_access.stage;
                    }
                }

                for read_access in &mut self.last_reads {
                    if (read_access.stage | read_access.sync_stages).intersects(stages_in_scope) {
                        // Forwarding to known-earlier stages makes the
                        // sync_stages propagation deep rather than shallow.
                        read_access.apply_read_barrier(barrier.dst_exec_scope.exec_scope);
                    }
                }
            }
        }
    }

    /// Apply a list of barriers without committing pending state.
    pub fn apply_barriers(&mut self, barriers: &[SyncBarrier], layout_transition: bool) {
        let scope = BarrierScope::Untagged;
        for barrier in barriers {
            self.apply_barrier(&scope, barrier, layout_transition, NO_HANDLE);
        }
    }

    /// Apply a fully inclusive barrier list and commit immediately.
    pub fn apply_barriers_immediate(&mut self, barriers: &[SyncBarrier]) {
        debug_assert!(!self.has_pending_state());
        self.apply_barriers(barriers, false);
        self.apply_pending_barriers(INVALID_TAG);
    }

    /// Commit the pending state accumulated by a barrier batch.
    pub fn apply_pending_barriers(&mut self, tag: Tag) {
        if self.pending_layout_transition {
            let tag_ex = TagEx {
                tag,
                handle_index: self.pending_layout_transition_handle,
            };
            // set_write clobbers the read states, so they need no clearing.
            self.set_write(AccessIndex::ImageLayoutTransition, tag_ex, SyncFlags::empty());
            self.update_first(
                tag_ex,
                AccessIndex::ImageLayoutTransition.info(),
                OrderingRule::None,
                SyncFlags::empty(),
            );
            let pending_ordering = *self.last_write.as_ref().unwrap().pending_layout_ordering();
            self.touchup_first_for_layout_transition(tag, &pending_ordering);

            self.last_write.as_mut().unwrap().apply_pending_barriers();
            self.pending_layout_transition = false;
            self.pending_layout_transition_handle = NO_HANDLE;
        } else {
            // Commit the accumulated execution barriers, updating chains.
            for read_access in &mut self.last_reads {
                self.read_execution_barriers |= read_access.apply_pending_barriers();
            }
            if let Some(write) = &mut self.last_write {
                write.apply_pending_barriers();
            }
        }
    }

    pub fn has_pending_state(&self) -> bool {
        self.pending_layout_transition
            || self
                .last_write
                .as_ref()
                .map_or(false, |w| w.has_pending_state())
    }

    // ---- semaphores ----

    /// Apply a signal/wait pair across queues. Semaphores only guarantee the
    /// first scope of the signal happens before the second scope of the
    /// wait; accesses outside the first scope lose their barriers entirely.
    pub fn apply_semaphore(&mut self, signal: &SemaphoreScope, wait: &SemaphoreScope) {
        debug_assert!(signal.queue != wait.queue);
        for read_access in &mut self.last_reads {
            if read_access.read_in_queue_scope_or_chain(signal.queue, signal.exec.exec_scope) {
                // Deflects WAR on the wait queue.
                read_access.barriers = wait.exec.exec_scope;
            } else {
                // sync_stages stays; update clears unsynchronized stages on
                // subsequent reads as needed.
                read_access.barriers = PipelineStages::empty();
            }
        }
        let write_in_scope = self.last_write.as_ref().map_or(false, |w| {
            w.write_in_queue_source_scope_or_chain(
                signal.queue,
                signal.exec.exec_scope,
                &signal.exec.valid_accesses,
            )
        });
        if write_in_scope {
            // Deflects RAW on the wait queue; WAW needs a chained barrier.
            self.read_execution_barriers = wait.exec.exec_scope;
            let chain = self.read_execution_barriers;
            self.last_write
                .as_mut()
                .unwrap()
                .set_barriers_for_semaphore(wait.exec.valid_accesses, chain);
        } else {
            self.read_execution_barriers = PipelineStages::empty();
            if let Some(write) = &mut self.last_write {
                write.set_barriers_for_semaphore(AccessScope::empty(), PipelineStages::empty());
            }
        }
    }

    // ---- predicated clearing ----

    /// Clear accesses the predicate declares synchronized. Returns true when
    /// nothing remains.
    pub fn clear_predicated<P: AccessPredicate>(&mut self, predicate: &P) -> bool {
        let mut sync_reads = PipelineStages::empty();

        // First pass: stages directly synchronized by the predicate.
        for read_access in &self.last_reads {
            if predicate.read(read_access) {
                sync_reads |= read_access.stage;
            }
        }

        // Second pass: pick up stages known to be earlier than a
        // synchronized one. sync_stages is deep because barriers are
        // forwarded to known prior stages.
        let mut unsync_count = 0usize;
        for read_access in &self.last_reads {
            if (read_access.stage | read_access.sync_stages).intersects(sync_reads) {
                sync_reads |= read_access.stage;
            } else {
                unsync_count += 1;
            }
        }

        if unsync_count != 0 {
            if !sync_reads.is_empty() {
                let mut unsync_reads = ReadStates::new();
                let mut unsync_read_stages = PipelineStages::empty();
                for read_access in &self.last_reads {
                    if !sync_reads.intersects(read_access.stage) {
                        unsync_reads.push(*read_access);
                        unsync_read_stages |= read_access.stage;
                    }
                }
                self.last_read_stages = unsync_read_stages;
                self.last_reads = unsync_reads;
            }
        } else {
            // Nothing remains (or it was empty to begin with).
            self.clear_read();
        }

        let mut all_clear = self.last_reads.is_empty();
        if let Some(write) = &self.last_write {
            if predicate.write(write) || !sync_reads.is_empty() {
                // Clearing the write alongside synchronized reads can drop a
                // RAW report, but only one that fixing the read hazards
                // would have precluded anyway.
                self.clear_write();
            } else {
                all_clear = false;
            }
        }
        all_clear
    }

    // ---- first-use log ----

    fn update_first(
        &mut self,
        tag_ex: TagEx,
        usage: &AccessInfo,
        ordering_rule: OrderingRule,
        flags: SyncFlags,
    ) {
        // Only record until the first write closes the log.
        if self.first_access_closed {
            return;
        }
        let is_read = usage.is_read;
        // Writes map to an empty stage here, so they always pass both masks.
        let usage_stage = if is_read {
            usage.stage
        } else {
            PipelineStages::empty()
        };
        if (usage_stage & self.first_read_stages).is_empty() {
            self.first_read_stages |= usage_stage;
            // A read already masked by an execution barrier is invisible to
            // the replaying context.
            if (self.read_execution_barriers & usage_stage).is_empty() {
                self.first_accesses.push(FirstAccess {
                    access_index: usage.access_index,
                    tag: tag_ex.tag,
                    handle_index: tag_ex.handle_index,
                    ordering_rule,
                    flags,
                });
                self.first_access_closed = !is_read;
            }
        }
    }

    fn touchup_first_for_layout_transition(&mut self, tag: Tag, layout_ordering: &OrderingBarrier) {
        debug_assert!(!self.first_accesses.is_empty());
        if let Some(last) = self.first_accesses.last() {
            if last.tag == tag {
                debug_assert!(last.access_index == AccessIndex::ImageLayoutTransition);
                self.first_write_layout_ordering_index = intern_layout_ordering(layout_ordering);
            }
        }
    }

    pub fn first_access_range(&self) -> Option<TagRange> {
        if self.first_accesses.is_empty() {
            return None;
        }
        Some(TagRange::new(
            self.first_accesses.first().unwrap().tag,
            self.first_accesses.last().unwrap().tag + 1,
        ))
    }

    pub fn first_access_in_tag_range(&self, tag_range: &TagRange) -> bool {
        match self.first_access_range() {
            Some(range) => tag_range.intersects(&range),
            None => false,
        }
    }

    pub fn first_accesses(&self) -> &[FirstAccess] {
        &self.first_accesses
    }

    pub fn is_first_access_closed(&self) -> bool {
        self.first_access_closed
    }

    // ---- bookkeeping ----

    pub fn offset_tags(&mut self, offset: Tag) {
        if let Some(write) = &mut self.last_write {
            write.offset_tag(offset);
        }
        for read_access in &mut self.last_reads {
            read_access.tag += offset;
        }
        for first in &mut self.first_accesses {
            first.tag += offset;
        }
    }

    /// Assign the queue to accesses recorded before submission.
    pub fn set_queue_id(&mut self, id: QueueId) {
        for read_access in &mut self.last_reads {
            if read_access.queue == INVALID_QUEUE {
                read_access.queue = id;
            }
        }
        if let Some(write) = &mut self.last_write {
            write.set_queue_id(id);
        }
    }

    /// Canonical form for long-lived storage: reads sorted by stage, no
    /// first-use log.
    pub fn normalize(&mut self) {
        self.last_reads.sort_by_key(|read| read.stage.bits());
        self.clear_first_use();
    }

    pub fn gather_referenced_tags(&self, used: &mut TagSet) {
        if let Some(write) = &self.last_write {
            used.insert(write.tag);
        }
        for read_access in &self.last_reads {
            used.insert(read_access.tag);
        }
    }

    pub fn has_write(&self) -> bool {
        self.last_write.is_some()
    }

    pub fn last_write(&self) -> Option<&WriteState> {
        self.last_write.as_ref()
    }

    pub fn is_last_write(&self, access_index: AccessIndex) -> bool {
        self.last_write
            .as_ref()
            .map_or(false, |w| w.access_index == access_index)
    }

    pub fn last_write_tag(&self) -> Tag {
        self.last_write.as_ref().map_or(0, |w| w.tag)
    }

    pub fn last_reads(&self) -> &[ReadState] {
        &self.last_reads
    }

    pub fn last_read_stages(&self) -> PipelineStages {
        self.last_read_stages
    }

    pub fn read_execution_barriers(&self) -> PipelineStages {
        self.read_execution_barriers
    }

    pub fn input_attachment_read(&self) -> bool {
        self.input_attachment_read
    }

    pub fn get_read_barriers(&self, access_index: AccessIndex) -> PipelineStages {
        for read_access in &self.last_reads {
            if read_access.access_index == access_index {
                return read_access.barriers;
            }
        }
        PipelineStages::empty()
    }

    pub fn get_write_barriers(&self) -> AccessScope {
        self.last_write
            .as_ref()
            .map_or(AccessScope::empty(), |w| w.barriers)
    }

    pub fn is_empty(&self) -> bool {
        self.last_write.is_none() && self.last_reads.is_empty()
    }

    pub fn write_in_source_scope_or_chain(
        &self,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> bool {
        self.last_write
            .as_ref()
            .map_or(false, |w| w.write_in_source_scope_or_chain(src_exec_scope, src_access_scope))
    }

    pub fn write_in_queue_source_scope_or_chain(
        &self,
        queue: QueueId,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
    ) -> bool {
        self.last_write.as_ref().map_or(false, |w| {
            w.write_in_queue_source_scope_or_chain(queue, src_exec_scope, src_access_scope)
        })
    }

    pub fn write_in_event_scope(
        &self,
        src_exec_scope: PipelineStages,
        src_access_scope: &AccessScope,
        scope_queue: QueueId,
        scope_tag: Tag,
    ) -> bool {
        self.last_write.as_ref().map_or(false, |w| {
            w.write_in_event_scope(src_exec_scope, src_access_scope, scope_queue, scope_tag)
        })
    }

    // ---- internal predicates ----

    fn is_raw_hazard(&self, usage: &AccessInfo) -> bool {
        debug_assert!(usage.is_read);
        // RAW vs last_write only matters if the read doesn't happen-after
        // another read: prior safe reads prove visibility, and prior unsafe
        // reads have been reported.
        self.last_write.as_ref().map_or(false, |w| {
            !self.read_execution_barriers.intersects(usage.stage) && w.is_write_hazard(usage)
        })
    }

    fn is_read_hazard(&self, stage_mask: PipelineStages, read_access: &ReadState) -> bool {
        stage_mask != (stage_mask & read_access.barriers)
    }

    /// Stages of the most recent reads that the ordering rule covers,
    /// limited by queue submission order: reads from other queues do not
    /// participate in implicit ordering.
    fn get_ordered_stages(&self, queue_id: QueueId, ordering: &OrderingBarrier) -> PipelineStages {
        let mut non_qso_stages = PipelineStages::empty();
        if queue_id != INVALID_QUEUE {
            for read_access in &self.last_reads {
                if read_access.queue != queue_id {
                    non_qso_stages |= read_access.stage;
                }
            }
        }
        let read_stages_in_qso = self.last_read_stages - non_qso_stages;
        let mut ordered_stages = read_stages_in_qso & ordering.exec_scope;

        // The input-attachment access is ordered through the access scope
        // only, never the exec scope.
        let input_attachment_ordering = ordering
            .access_scope
            .contains(AccessIndex::FragmentShaderInputAttachmentRead);
        if input_attachment_ordering && self.input_attachment_read {
            ordered_stages |= PipelineStages::FRAGMENT_SHADER;
        }
        ordered_stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessFlags;
    use crate::scope::ExecScope;
    use crate::stage::QueueFlags;

    fn tag(t: Tag) -> TagEx {
        TagEx {
            tag: t,
            handle_index: NO_HANDLE,
        }
    }

    fn barrier(
        src_stages: PipelineStages,
        src_access: AccessFlags,
        dst_stages: PipelineStages,
        dst_access: AccessFlags,
    ) -> SyncBarrier {
        SyncBarrier::new(
            ExecScope::make_src(QueueFlags::GRAPHICS, src_stages, PipelineStages::empty()),
            src_access,
            ExecScope::make_dst(QueueFlags::GRAPHICS, dst_stages),
            dst_access,
        )
    }

    #[test]
    fn raw_without_barrier() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let hazard = state.detect_hazard_with_rule(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert_eq!(hazard.hazard(), Some(Hazard::ReadAfterWrite));
        assert_eq!(hazard.tag(), Some(1));
    }

    #[test]
    fn raw_fixed_by_barrier() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let b = barrier(
            PipelineStages::COPY,
            AccessFlags::TRANSFER_WRITE,
            PipelineStages::FRAGMENT_SHADER,
            AccessFlags::SHADER_SAMPLED_READ,
        );
        state.apply_barrier(&BarrierScope::Untagged, &b, false, NO_HANDLE);
        state.apply_pending_barriers(2);

        let hazard = state.detect_hazard_with_rule(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(!hazard.is_hazard());

        // A stage outside the destination scope is still hazardous.
        let hazard = state.detect_hazard_with_rule(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(hazard.is_hazard());
    }

    #[test]
    fn war_fixed_by_execution_only_barrier() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let b = barrier(
            PipelineStages::FRAGMENT_SHADER,
            AccessFlags::empty(),
            PipelineStages::COPY,
            AccessFlags::empty(),
        );
        state.apply_barrier(&BarrierScope::Untagged, &b, false, NO_HANDLE);
        state.apply_pending_barriers(2);

        let hazard = state.detect_hazard_with_rule(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(!hazard.is_hazard(), "execution dependency suffices for WAR");
    }

    #[test]
    fn waw_detected_and_reported_against_write() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        let hazard = state.detect_hazard_with_rule(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert_eq!(hazard.hazard(), Some(Hazard::WriteAfterWrite));
    }

    #[test]
    fn color_ordering_suppresses_raster_waw() {
        let mut state = AccessState::new();
        state.set_queue_id(0);
        state.update(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::ColorAttachment,
            tag(1),
            SyncFlags::empty(),
        );
        state.set_queue_id(0);

        let hazard = state.detect_hazard_with_rule(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::ColorAttachment,
            0,
        );
        assert!(!hazard.is_hazard(), "raster order writes are implicitly ordered");
    }

    #[test]
    fn reads_are_tracked_per_stage() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        state.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(2),
            SyncFlags::empty(),
        );
        assert_eq!(state.last_reads().len(), 2);

        // Overwrite the fragment read; still two entries.
        state.update(
            AccessIndex::FragmentShaderInputAttachmentRead.info(),
            OrderingRule::None,
            tag(3),
            SyncFlags::empty(),
        );
        assert_eq!(state.last_reads().len(), 2);
        assert!(state.input_attachment_read());
        assert_eq!(
            state.last_read_stages(),
            PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER
        );
    }

    #[test]
    fn write_clears_reads() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(2),
            SyncFlags::empty(),
        );
        assert!(state.last_reads().is_empty());
        assert!(state.has_write());
        assert_eq!(state.last_write_tag(), 2);
    }

    #[test]
    fn first_use_log_closes_on_write() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        state.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(2),
            SyncFlags::empty(),
        );
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(3),
            SyncFlags::empty(),
        );
        // Post-close accesses are not recorded.
        state.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(4),
            SyncFlags::empty(),
        );

        assert!(state.is_first_access_closed());
        assert_eq!(state.first_accesses().len(), 3);
        assert_eq!(state.first_accesses()[2].access_index, AccessIndex::CopyTransferWrite);
        assert_eq!(state.first_access_range(), Some(TagRange::new(1, 4)));
    }

    #[test]
    fn independent_barriers_do_not_chain_within_batch() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        // Barrier A: copy -> vertex shader. Barrier B: vertex -> fragment.
        // Applied as one batch, B must not chain through A.
        let a = barrier(
            PipelineStages::COPY,
            AccessFlags::TRANSFER_WRITE,
            PipelineStages::VERTEX_SHADER,
            AccessFlags::SHADER_SAMPLED_READ,
        );
        let b = barrier(
            PipelineStages::VERTEX_SHADER,
            AccessFlags::SHADER_SAMPLED_READ,
            PipelineStages::FRAGMENT_SHADER,
            AccessFlags::SHADER_SAMPLED_READ,
        );
        let scope = BarrierScope::Untagged;
        state.apply_barrier(&scope, &a, false, NO_HANDLE);
        state.apply_barrier(&scope, &b, false, NO_HANDLE);
        state.apply_pending_barriers(2);

        let hazard = state.detect_hazard_with_rule(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(hazard.is_hazard(), "chaining within a batch is forbidden");

        // Applied as two batches, the chain is established.
        let mut state = AccessState::new();
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        state.apply_barrier(&scope, &a, false, NO_HANDLE);
        state.apply_pending_barriers(2);
        state.apply_barrier(&scope, &b, false, NO_HANDLE);
        state.apply_pending_barriers(3);

        let hazard = state.detect_hazard_with_rule(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(!hazard.is_hazard(), "chaining across batches is allowed");
    }

    #[test]
    fn layout_transition_commit_installs_write() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        let b = barrier(
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            PipelineStages::FRAGMENT_SHADER,
            AccessFlags::SHADER_SAMPLED_READ,
        );
        state.apply_barrier(&BarrierScope::Untagged, &b, true, NO_HANDLE);
        assert!(state.has_pending_state());
        state.apply_pending_barriers(5);

        assert!(state.is_last_write(AccessIndex::ImageLayoutTransition));
        assert_eq!(state.last_write_tag(), 5);
        // The transition is visible to the destination scope.
        let hazard = state.detect_hazard_with_rule(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            INVALID_QUEUE,
        );
        assert!(!hazard.is_hazard());
    }

    #[test]
    fn resolve_keeps_later_write() {
        let mut a = AccessState::new();
        a.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        let mut b = AccessState::new();
        b.update(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::None,
            tag(5),
            SyncFlags::empty(),
        );

        a.resolve(&b);
        assert!(a.is_last_write(AccessIndex::ColorAttachmentOutputColorWrite));
        assert_eq!(a.last_write_tag(), 5);

        // Symmetric case keeps the same (later) write.
        b.resolve(&AccessState::new());
        assert!(b.is_last_write(AccessIndex::ColorAttachmentOutputColorWrite));
    }

    #[test]
    fn resolve_merges_reads_per_stage() {
        let mut a = AccessState::new();
        a.update(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        let mut b = AccessState::new();
        b.update(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            tag(3),
            SyncFlags::empty(),
        );
        b.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(4),
            SyncFlags::empty(),
        );

        a.resolve(&b);
        assert_eq!(a.last_reads().len(), 2);
        let vs_read = a
            .last_reads()
            .iter()
            .find(|r| r.stage == PipelineStages::VERTEX_SHADER)
            .unwrap();
        assert_eq!(vs_read.tag, 3, "later read wins per stage");
    }

    #[test]
    fn predicated_wait_clears_matching_accesses() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        state.set_queue_id(0);

        // A queue wait on another queue leaves the state alone.
        let other_queue = WaitQueueTagPredicate { queue: 1, tag: 10 };
        assert!(!state.clear_predicated(&other_queue));
        assert!(state.has_write());

        // A queue wait on the owning queue clears it.
        let this_queue = WaitQueueTagPredicate { queue: 0, tag: 10 };
        assert!(state.clear_predicated(&this_queue));
        assert!(!state.has_write());
    }

    #[test]
    fn present_hazards_are_remapped() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::PresentEnginePresented.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::PRESENT,
        );

        let hazard = state.detect_hazard(AccessIndex::FragmentShaderSampledRead.info());
        assert_eq!(hazard.hazard(), Some(Hazard::ReadAfterPresent));

        let mut demoted = hazard.clone();
        demoted.demote_present();
        assert_eq!(demoted.hazard(), Some(Hazard::ReadAfterWrite));

        let mut state = AccessState::new();
        state.update(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        let hazard = state.detect_hazard(AccessIndex::PresentEnginePresented.info());
        assert_eq!(hazard.hazard(), Some(Hazard::PresentAfterWrite));
    }

    #[test]
    fn async_detection_flags_racing_accesses() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(10),
            SyncFlags::empty(),
        );
        state.set_queue_id(0);

        let hazard = state.detect_async_hazard(
            AccessIndex::FragmentShaderSampledRead.info(),
            5,
            0,
        );
        assert_eq!(hazard.hazard(), Some(Hazard::ReadRacingWrite));

        // Accesses before the racing context started don't count.
        let hazard = state.detect_async_hazard(
            AccessIndex::FragmentShaderSampledRead.info(),
            20,
            0,
        );
        assert!(!hazard.is_hazard());
    }

    #[test]
    fn semaphore_scope_carries_write_into_wait_queue() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::None,
            tag(10),
            SyncFlags::empty(),
        );
        state.set_queue_id(0);

        let signal = SemaphoreScope::new(
            0,
            ExecScope::make_src(
                QueueFlags::GRAPHICS,
                PipelineStages::ALL_COMMANDS,
                PipelineStages::empty(),
            ),
        );
        let wait = SemaphoreScope::new(
            1,
            ExecScope::make_dst(QueueFlags::GRAPHICS, PipelineStages::FRAGMENT_SHADER),
        );
        state.apply_semaphore(&signal, &wait);

        // The write is now visible to the wait scope on queue 1.
        let hazard = state.detect_hazard_with_rule(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            1,
        );
        assert!(!hazard.is_hazard());

        // An empty wait scope would have cleared the barriers instead.
        let mut state2 = AccessState::new();
        state2.update(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::None,
            tag(10),
            SyncFlags::empty(),
        );
        state2.set_queue_id(0);
        let narrow_signal = SemaphoreScope::new(
            0,
            ExecScope::make_src(
                QueueFlags::GRAPHICS,
                PipelineStages::COPY,
                PipelineStages::empty(),
            ),
        );
        state2.apply_semaphore(&narrow_signal, &wait);
        let hazard = state2.detect_hazard_with_rule(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            1,
        );
        assert!(hazard.is_hazard(), "write outside the signal scope stays unsafe");
    }

    #[test]
    fn sequential_layout_transitions_follow_queue_rules() {
        // First transition committed on queue 0.
        let mut state = AccessState::new();
        let b = barrier(
            PipelineStages::TOP_OF_PIPE,
            AccessFlags::empty(),
            PipelineStages::FRAGMENT_SHADER,
            AccessFlags::SHADER_SAMPLED_READ,
        );
        state.apply_barrier(&BarrierScope::Untagged, &b, true, NO_HANDLE);
        state.apply_pending_barriers(1);
        state.set_queue_id(0);
        assert!(state.is_last_write(AccessIndex::ImageLayoutTransition));

        // A second transition on the same queue is implicitly ordered, even
        // with an unrelated source scope.
        let hazard = state.detect_barrier_hazard(
            AccessIndex::ImageLayoutTransition.info(),
            0,
            PipelineStages::COPY.with_earlier(),
            &AccessScope::empty(),
        );
        assert!(!hazard.is_hazard());

        // Across queues the first transition must be in the barrier's chain.
        let hazard = state.detect_barrier_hazard(
            AccessIndex::ImageLayoutTransition.info(),
            1,
            PipelineStages::COPY.with_earlier(),
            &AccessScope::empty(),
        );
        assert_eq!(hazard.hazard(), Some(Hazard::WriteAfterWrite));

        // The first transition's destination scope chains: a source scope
        // intersecting it finds the write available.
        let hazard = state.detect_barrier_hazard(
            AccessIndex::ImageLayoutTransition.info(),
            1,
            PipelineStages::FRAGMENT_SHADER.with_earlier(),
            &AccessScope::empty(),
        );
        assert!(!hazard.is_hazard());
    }

    #[test]
    fn predicated_wait_forwards_through_sync_stages() {
        let mut state = AccessState::new();
        // Vertex-shader read on queue 0.
        state.update(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        state.set_queue_id(0);

        // Barrier the vertex read to the fragment stage, then read there on
        // queue 1: the vertex read now knows the fragment read follows it.
        let b = barrier(
            PipelineStages::VERTEX_SHADER,
            AccessFlags::empty(),
            PipelineStages::FRAGMENT_SHADER,
            AccessFlags::empty(),
        );
        state.apply_barrier(&BarrierScope::Untagged, &b, false, NO_HANDLE);
        state.apply_pending_barriers(2);
        state.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(3),
            SyncFlags::empty(),
        );
        state.set_queue_id(1);

        let vs_read = state
            .last_reads()
            .iter()
            .find(|r| r.stage == PipelineStages::VERTEX_SHADER)
            .unwrap();
        assert!(vs_read.sync_stages.contains(PipelineStages::FRAGMENT_SHADER));

        // Waiting for queue 1 synchronizes the fragment read directly and
        // the vertex read through its sync_stages.
        let wait = WaitQueueTagPredicate {
            queue: 1,
            tag: 100,
        };
        assert!(state.clear_predicated(&wait));
        assert!(state.last_reads().is_empty());
    }

    #[test]
    fn event_scope_pairing_detects_post_set_reads() {
        let mut state = AccessState::new();
        state.update(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            tag(2),
            SyncFlags::empty(),
        );
        // Snapshot at set-event time (tag 3).
        let scope_state = state.clone();

        // A read from another stage lands after the set.
        state.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(5),
            SyncFlags::empty(),
        );

        let src = ExecScope::make_src(
            QueueFlags::GRAPHICS,
            PipelineStages::VERTEX_SHADER,
            PipelineStages::empty(),
        );
        let hazard = state.detect_event_barrier_hazard(
            AccessIndex::ImageLayoutTransition.info(),
            &scope_state,
            src.exec_scope,
            &src.valid_accesses,
            INVALID_QUEUE,
            3,
        );
        assert_eq!(hazard.hazard(), Some(Hazard::WriteAfterRead));
        assert_eq!(hazard.tag(), Some(5), "the uncaptured read is reported");
    }

    #[test]
    fn recorded_write_is_masked_by_recorded_read_stages() {
        // Recorded context: fragment read, then an attachment write closing
        // the log.
        let mut recorded = AccessState::new();
        recorded.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(10),
            SyncFlags::empty(),
        );
        recorded.update(
            AccessIndex::ColorAttachmentOutputColorWrite.info(),
            OrderingRule::None,
            tag(11),
            SyncFlags::empty(),
        );

        // Active context with a fragment read: the recorded read at the same
        // stage already shadows it, so the recorded write is not a hazard
        // against it.
        let mut active = AccessState::new();
        active.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        let hazard = active.detect_first_use_hazard(
            &recorded,
            INVALID_QUEUE,
            &TagRange::new(0, INVALID_TAG),
        );
        assert!(!hazard.is_hazard());

        // A read at a stage the recording never used stays unprotected.
        let mut active = AccessState::new();
        active.update(
            AccessIndex::VertexShaderSampledRead.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );
        let hazard = active.detect_first_use_hazard(
            &recorded,
            INVALID_QUEUE,
            &TagRange::new(0, INVALID_TAG),
        );
        assert_eq!(hazard.hazard(), Some(Hazard::WriteAfterRead));
    }

    #[test]
    fn first_use_replay_detects_hazard_against_active_state() {
        // Active state: unsynchronized write.
        let mut active = AccessState::new();
        active.update(
            AccessIndex::CopyTransferWrite.info(),
            OrderingRule::None,
            tag(1),
            SyncFlags::empty(),
        );

        // Recorded context: first access is a fragment read.
        let mut recorded = AccessState::new();
        recorded.update(
            AccessIndex::FragmentShaderSampledRead.info(),
            OrderingRule::None,
            tag(10),
            SyncFlags::empty(),
        );

        let hazard = active.detect_first_use_hazard(
            &recorded,
            INVALID_QUEUE,
            &TagRange::new(0, INVALID_TAG),
        );
        assert_eq!(hazard.hazard(), Some(Hazard::ReadAfterWrite));
        let recorded_access = hazard.state().unwrap().recorded_access.unwrap();
        assert_eq!(recorded_access.access_index, AccessIndex::FragmentShaderSampledRead);
    }
}
