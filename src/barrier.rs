use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::{
    access::{AccessFlags, AccessIndex},
    scope::{access_scope, AccessScope, ExecScope},
    stage::PipelineStages,
    state::{AccessState, ReadState},
    QueueId, Tag, INVALID_QUEUE, INVALID_TAG, NO_HANDLE,
};

/// A barrier with both sides fully expanded: stages include all logically
/// earlier/later stages and access masks are resolved to atomic accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncBarrier {
    pub src_exec_scope: ExecScope,
    pub src_access_scope: AccessScope,
    /// The access mask as the caller passed it, kept for reporting.
    pub original_src_access: AccessFlags,

    pub dst_exec_scope: ExecScope,
    pub dst_access_scope: AccessScope,
    pub original_dst_access: AccessFlags,
}

impl Default for SyncBarrier {
    fn default() -> Self {
        SyncBarrier {
            src_exec_scope: ExecScope::default(),
            src_access_scope: AccessScope::empty(),
            original_src_access: AccessFlags::empty(),
            dst_exec_scope: ExecScope::default(),
            dst_access_scope: AccessScope::empty(),
            original_dst_access: AccessFlags::empty(),
        }
    }
}

impl SyncBarrier {
    /// Execution-only barrier: both access scopes are empty.
    pub fn execution_only(src_exec: ExecScope, dst_exec: ExecScope) -> SyncBarrier {
        SyncBarrier {
            src_exec_scope: src_exec,
            dst_exec_scope: dst_exec,
            ..SyncBarrier::default()
        }
    }

    pub fn new(
        src_exec: ExecScope,
        src_access_mask: AccessFlags,
        dst_exec: ExecScope,
        dst_access_mask: AccessFlags,
    ) -> SyncBarrier {
        SyncBarrier {
            src_exec_scope: src_exec,
            src_access_scope: access_scope(&src_exec.valid_accesses, src_access_mask),
            original_src_access: src_access_mask,
            dst_exec_scope: dst_exec,
            dst_access_scope: access_scope(&dst_exec.valid_accesses, dst_access_mask),
            original_dst_access: dst_access_mask,
        }
    }

    /// Barrier covering every access valid at the given scopes.
    pub fn all_access(src_exec: ExecScope, dst_exec: ExecScope) -> SyncBarrier {
        SyncBarrier {
            src_exec_scope: src_exec,
            src_access_scope: src_exec.valid_accesses,
            original_src_access: AccessFlags::empty(),
            dst_exec_scope: dst_exec,
            dst_access_scope: dst_exec.valid_accesses,
            original_dst_access: AccessFlags::empty(),
        }
    }

    /// Union of a batch. Only the exec and access scope fields are meaningful
    /// on the result.
    pub fn merged<'a>(barriers: impl IntoIterator<Item = &'a SyncBarrier>) -> SyncBarrier {
        let mut merged = SyncBarrier::default();
        for barrier in barriers {
            merged.src_exec_scope.exec_scope |= barrier.src_exec_scope.exec_scope;
            merged.src_access_scope |= barrier.src_access_scope;
            merged.dst_exec_scope.exec_scope |= barrier.dst_exec_scope.exec_scope;
            merged.dst_access_scope |= barrier.dst_access_scope;
        }
        merged
    }
}

/// Implicit ordering guarantees of a subpass, acting as a barrier against the
/// most recent accesses independent of synchronization commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OrderingBarrier {
    pub exec_scope: PipelineStages,
    pub access_scope: AccessScope,
}

impl Default for OrderingBarrier {
    fn default() -> Self {
        OrderingBarrier {
            exec_scope: PipelineStages::empty(),
            access_scope: AccessScope::empty(),
        }
    }
}

impl OrderingBarrier {
    pub const fn new(exec_scope: PipelineStages, access_scope: AccessScope) -> Self {
        OrderingBarrier {
            exec_scope,
            access_scope,
        }
    }

    pub fn merge(&mut self, rhs: &OrderingBarrier) {
        self.exec_scope |= rhs.exec_scope;
        self.access_scope |= rhs.access_scope;
    }
}

/// The four preset ordering rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OrderingRule {
    None = 0,
    ColorAttachment,
    DepthStencilAttachment,
    Raster,
}

impl OrderingRule {
    pub fn barrier(self) -> &'static OrderingBarrier {
        &ORDERING_RULES[self as usize]
    }
}

// The input-attachment read bit goes *only* into the access scopes and not
// the exec scopes: raster ordering applies to that specific access, not to
// the fragment shader stage as a whole. Hazard detection handles the access
// through `ordered_stages`, not through the exec scope.
static ORDERING_RULES: Lazy<[OrderingBarrier; 4]> = Lazy::new(|| {
    let mut color_access = AccessScope::empty();
    color_access.set(AccessIndex::ColorAttachmentOutputColorRead);
    color_access.set(AccessIndex::ColorAttachmentOutputColorWrite);
    color_access.set(AccessIndex::FragmentShaderInputAttachmentRead);

    let mut depth_access = AccessScope::empty();
    depth_access.set(AccessIndex::EarlyFragmentTestsDepthStencilRead);
    depth_access.set(AccessIndex::EarlyFragmentTestsDepthStencilWrite);
    depth_access.set(AccessIndex::LateFragmentTestsDepthStencilRead);
    depth_access.set(AccessIndex::LateFragmentTestsDepthStencilWrite);
    depth_access.set(AccessIndex::FragmentShaderInputAttachmentRead);

    let color = OrderingBarrier::new(PipelineStages::COLOR_ATTACHMENT_OUTPUT, color_access);
    let depth = OrderingBarrier::new(
        PipelineStages::EARLY_FRAGMENT_TESTS | PipelineStages::LATE_FRAGMENT_TESTS,
        depth_access,
    );
    let raster = OrderingBarrier::new(
        color.exec_scope | depth.exec_scope,
        color.access_scope | depth.access_scope,
    );

    [OrderingBarrier::default(), color, depth, raster]
});

/// Source scope of a barrier application, deciding which prior accesses the
/// barrier reaches. Dispatched inline; the three variants correspond to
/// record-time barriers, queue-time barriers and event waits.
#[derive(Clone, Copy, Debug)]
pub enum BarrierScope {
    /// Record time: accesses have no queue assigned yet, every access on the
    /// recording is eligible.
    Untagged,
    /// Queue submission time: only accesses from the given queue participate
    /// in submission-order chaining.
    Queue(QueueId),
    /// Event wait: only accesses recorded on the setting queue before the
    /// set-event tag were captured in the event's first scope.
    Event { queue: QueueId, tag: Tag },
}

impl BarrierScope {
    pub fn write_in_scope(&self, barrier: &SyncBarrier, access: &AccessState) -> bool {
        match *self {
            BarrierScope::Untagged => access.write_in_source_scope_or_chain(
                barrier.src_exec_scope.exec_scope,
                &barrier.src_access_scope,
            ),
            BarrierScope::Queue(queue) => access.write_in_queue_source_scope_or_chain(
                queue,
                barrier.src_exec_scope.exec_scope,
                &barrier.src_access_scope,
            ),
            BarrierScope::Event { queue, tag } => access.write_in_event_scope(
                barrier.src_exec_scope.exec_scope,
                &barrier.src_access_scope,
                queue,
                tag,
            ),
        }
    }

    pub fn read_in_scope(&self, barrier: &SyncBarrier, read: &ReadState) -> bool {
        match *self {
            BarrierScope::Untagged => {
                read.read_in_scope_or_chain(barrier.src_exec_scope.exec_scope)
            }
            BarrierScope::Queue(queue) => {
                read.read_in_queue_scope_or_chain(queue, barrier.src_exec_scope.exec_scope)
            }
            BarrierScope::Event { queue, tag } => {
                read.read_in_event_scope(barrier.src_exec_scope.exec_scope, queue, tag)
            }
        }
    }
}

/// One side of a semaphore operation: the exec scope plus the queue it
/// belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreScope {
    pub queue: QueueId,
    pub exec: ExecScope,
}

impl SemaphoreScope {
    pub fn new(queue: QueueId, exec: ExecScope) -> Self {
        SemaphoreScope { queue, exec }
    }
}

/// Stable handle into the process-wide layout-ordering interning table.
pub type OrderingIndex = u32;

/// Sentinel for "no interned ordering".
pub const NO_ORDERING_INDEX: OrderingIndex = NO_HANDLE;

#[derive(Default)]
struct OrderingBarrierTable {
    entries: Vec<OrderingBarrier>,
    index: HashMap<OrderingBarrier, OrderingIndex>,
}

// Layout-transition ordering barriers are interned process-wide so the
// access state can keep a 32-bit handle and stay trivially copyable.
static LAYOUT_ORDERING_TABLE: Lazy<RwLock<OrderingBarrierTable>> =
    Lazy::new(|| RwLock::new(OrderingBarrierTable::default()));

/// Intern an ordering barrier, returning its stable index. Idempotent.
pub fn intern_layout_ordering(ordering: &OrderingBarrier) -> OrderingIndex {
    {
        let table = LAYOUT_ORDERING_TABLE.read();
        if let Some(&index) = table.index.get(ordering) {
            return index;
        }
    }
    let mut table = LAYOUT_ORDERING_TABLE.write();
    if let Some(&index) = table.index.get(ordering) {
        return index;
    }
    let index = table.entries.len() as OrderingIndex;
    table.entries.push(*ordering);
    table.index.insert(*ordering, index);
    index
}

/// Fetch an interned ordering barrier. The sentinel yields the empty barrier.
pub fn layout_ordering(index: OrderingIndex) -> OrderingBarrier {
    if index == NO_ORDERING_INDEX {
        return OrderingBarrier::default();
    }
    LAYOUT_ORDERING_TABLE.read().entries[index as usize]
}

impl Default for BarrierScope {
    fn default() -> Self {
        BarrierScope::Untagged
    }
}

impl BarrierScope {
    /// The queue accesses are compared against; record-time scopes match the
    /// unassigned queue of recorded accesses.
    pub fn scope_queue(&self) -> QueueId {
        match *self {
            BarrierScope::Untagged => INVALID_QUEUE,
            BarrierScope::Queue(queue) => queue,
            BarrierScope::Event { queue, .. } => queue,
        }
    }

    pub fn scope_tag(&self) -> Tag {
        match *self {
            BarrierScope::Event { tag, .. } => tag,
            _ => INVALID_TAG,
        }
    }
}
