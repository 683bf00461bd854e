//! Record-time hazard scenarios driven through the public surface.

use vigil::{
    AccessContext, AccessFlags, AccessIndex, AccessRange, BarrierScope, ExecScope, Hazard,
    OrderingRule, PipelineStages, QueueFlags, ResourceId, SyncBarrier, SyncFlags, TagEx,
    INVALID_QUEUE, NO_HANDLE,
};

const BUFFER: ResourceId = ResourceId(1);

fn src(stages: PipelineStages) -> ExecScope {
    ExecScope::make_src(QueueFlags::GRAPHICS, stages, PipelineStages::empty())
}

fn dst(stages: PipelineStages) -> ExecScope {
    ExecScope::make_dst(QueueFlags::GRAPHICS, stages)
}

fn write_transfer(ctx: &mut AccessContext, range: AccessRange, tag: u64) {
    ctx.update_access(
        BUFFER,
        range,
        AccessIndex::CopyTransferWrite,
        OrderingRule::None,
        TagEx::new(tag),
        SyncFlags::empty(),
    );
}

#[test]
fn read_after_write_without_barrier() {
    let mut ctx = AccessContext::new();
    write_transfer(&mut ctx, AccessRange::new(0, 256), 1);

    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(0, 256),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        0,
    );
    assert_eq!(hazard.hazard(), Some(Hazard::ReadAfterWrite));
    assert_eq!(hazard.tag(), Some(1));

    // The failed check did not mutate the state: checking again yields the
    // same hazard.
    let again = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(0, 256),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        0,
    );
    assert_eq!(again.hazard(), Some(Hazard::ReadAfterWrite));
}

#[test]
fn read_after_write_fixed_by_pipeline_barrier() {
    let mut ctx = AccessContext::new();
    write_transfer(&mut ctx, AccessRange::new(0, 256), 1);

    let barrier = SyncBarrier::new(
        src(PipelineStages::COPY),
        AccessFlags::TRANSFER_WRITE,
        dst(PipelineStages::FRAGMENT_SHADER),
        AccessFlags::SHADER_SAMPLED_READ,
    );
    ctx.apply_barrier_batch(
        BarrierScope::Untagged,
        BUFFER,
        Some(AccessRange::new(0, 256)),
        &[barrier],
        false,
        NO_HANDLE,
        2,
    );

    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(0, 256),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        0,
    );
    assert!(!hazard.is_hazard());
}

#[test]
fn write_after_read_fixed_by_execution_only_barrier() {
    let mut ctx = AccessContext::new();
    ctx.update_access(
        BUFFER,
        AccessRange::new(0, 256),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        TagEx::new(1),
        SyncFlags::empty(),
    );

    let barrier = SyncBarrier::execution_only(src(PipelineStages::FRAGMENT_SHADER), dst(PipelineStages::COPY));
    ctx.apply_barrier_batch(
        BarrierScope::Untagged,
        BUFFER,
        Some(AccessRange::new(0, 256)),
        &[barrier],
        false,
        NO_HANDLE,
        2,
    );

    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(0, 256),
        AccessIndex::CopyTransferWrite,
        OrderingRule::None,
        0,
    );
    assert!(
        !hazard.is_hazard(),
        "an execution dependency is sufficient for write-after-read"
    );
}

#[test]
fn barrier_covers_exactly_its_destination_scope() {
    // After barrier + commit, an access is safe iff it is in the barrier's
    // destination access scope and its stage is covered.
    let mut ctx = AccessContext::new();
    write_transfer(&mut ctx, AccessRange::new(0, 64), 1);

    let barrier = SyncBarrier::new(
        src(PipelineStages::COPY),
        AccessFlags::TRANSFER_WRITE,
        dst(PipelineStages::COMPUTE_SHADER),
        AccessFlags::SHADER_STORAGE_READ,
    );
    ctx.apply_barrier_batch(
        BarrierScope::Untagged,
        BUFFER,
        Some(AccessRange::new(0, 64)),
        &[barrier],
        false,
        NO_HANDLE,
        2,
    );

    // Covered access and stage.
    assert!(!ctx
        .detect_hazard(
            BUFFER,
            AccessRange::new(0, 64),
            AccessIndex::ComputeShaderStorageRead,
            OrderingRule::None,
            0,
        )
        .is_hazard());

    // Same stage, different access kind.
    assert!(ctx
        .detect_hazard(
            BUFFER,
            AccessRange::new(0, 64),
            AccessIndex::ComputeShaderSampledRead,
            OrderingRule::None,
            0,
        )
        .is_hazard());

    // Covered access kind at an uncovered stage.
    assert!(ctx
        .detect_hazard(
            BUFFER,
            AccessRange::new(0, 64),
            AccessIndex::FragmentShaderStorageRead,
            OrderingRule::None,
            0,
        )
        .is_hazard());
}

#[test]
fn sub_range_accesses_only_conflict_where_they_overlap() {
    let mut ctx = AccessContext::new();
    write_transfer(&mut ctx, AccessRange::new(0, 128), 1);

    // Read of a disjoint part of the buffer is safe.
    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(128, 256),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        0,
    );
    assert!(!hazard.is_hazard());

    // Read overlapping a single byte is not.
    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(127, 256),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        0,
    );
    assert!(hazard.is_hazard());
}

#[test]
fn raster_order_suppresses_attachment_conflicts() {
    let mut ctx = AccessContext::new();
    ctx.update_access(
        BUFFER,
        AccessRange::new(0, 64),
        AccessIndex::ColorAttachmentOutputColorWrite,
        OrderingRule::ColorAttachment,
        TagEx::new(1),
        SyncFlags::empty(),
    );
    ctx.set_queue_id(0);

    // A second attachment write in raster order on the same queue is
    // implicitly ordered.
    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(0, 64),
        AccessIndex::ColorAttachmentOutputColorWrite,
        OrderingRule::ColorAttachment,
        0,
    );
    assert!(!hazard.is_hazard());

    // Without the ordering rule it is a plain WAW hazard.
    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(0, 64),
        AccessIndex::ColorAttachmentOutputColorWrite,
        OrderingRule::None,
        0,
    );
    assert_eq!(hazard.hazard(), Some(Hazard::WriteAfterWrite));
}

#[test]
fn consolidation_collapses_equal_neighbours() {
    let mut ctx = AccessContext::new();
    // One write recorded in three touching pieces.
    for (begin, end) in [(0u64, 10u64), (10, 20), (20, 30)] {
        ctx.update_access(
            BUFFER,
            AccessRange::new(begin, end),
            AccessIndex::CopyTransferWrite,
            OrderingRule::None,
            TagEx::new(1),
            SyncFlags::empty(),
        );
    }
    ctx.consolidate();
    assert_eq!(ctx.map(BUFFER).unwrap().len(), 1);

    // A differing neighbour survives consolidation.
    ctx.update_access(
        BUFFER,
        AccessRange::new(30, 40),
        AccessIndex::ClearTransferWrite,
        OrderingRule::None,
        TagEx::new(2),
        SyncFlags::empty(),
    );
    ctx.consolidate();
    assert_eq!(ctx.map(BUFFER).unwrap().len(), 2);
}

#[test]
fn recorded_context_replay_sees_parent_write() {
    // A secondary command buffer recorded standalone reads the buffer; the
    // primary wrote it without a barrier. Replay must surface the hazard the
    // recording could not see.
    let mut primary = AccessContext::new();
    write_transfer(&mut primary, AccessRange::new(0, 64), 1);

    let mut secondary = AccessContext::new();
    secondary.update_access(
        BUFFER,
        AccessRange::new(0, 64),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        TagEx::new(0),
        SyncFlags::empty(),
    );

    let mut relocated = secondary.clone();
    relocated.offset_tags(100);
    let hazard = primary.detect_first_use_hazard(
        INVALID_QUEUE,
        &relocated,
        &AccessRange::new(100, 101),
    );
    assert_eq!(hazard.hazard(), Some(Hazard::ReadAfterWrite));
    let state = hazard.state().unwrap();
    assert_eq!(
        state.recorded_access.unwrap().access_index,
        AccessIndex::FragmentShaderSampledRead
    );

    // After absorbing the secondary, later conflicting accesses are still
    // reported against the surviving state.
    primary.resolve_from(&relocated, 0);
    let hazard = primary.detect_hazard(
        BUFFER,
        AccessRange::new(0, 64),
        AccessIndex::ClearTransferWrite,
        OrderingRule::None,
        INVALID_QUEUE,
    );
    assert!(hazard.is_hazard());
}

#[test]
fn global_barrier_covers_every_resource() {
    let other = ResourceId(2);
    let mut ctx = AccessContext::new();
    write_transfer(&mut ctx, AccessRange::new(0, 64), 1);
    ctx.update_access(
        other,
        AccessRange::new(0, 64),
        AccessIndex::CopyTransferWrite,
        OrderingRule::None,
        TagEx::new(2),
        SyncFlags::empty(),
    );

    let barrier = SyncBarrier::new(
        src(PipelineStages::COPY),
        AccessFlags::TRANSFER_WRITE,
        dst(PipelineStages::FRAGMENT_SHADER),
        AccessFlags::SHADER_SAMPLED_READ,
    );
    ctx.apply_global_barrier_batch(BarrierScope::Untagged, &[barrier], 3);

    for resource in [BUFFER, other] {
        let hazard = ctx.detect_hazard(
            resource,
            AccessRange::new(0, 64),
            AccessIndex::FragmentShaderSampledRead,
            OrderingRule::None,
            0,
        );
        assert!(!hazard.is_hazard());
    }
}

#[test]
fn ill_formed_ranges_are_rejected_without_mutation() {
    let mut ctx = AccessContext::new();
    write_transfer(&mut ctx, AccessRange::new(16, 16), 1);
    assert!(ctx.map(BUFFER).map_or(true, |m| m.is_empty()));

    let hazard = ctx.detect_hazard(
        BUFFER,
        AccessRange::new(32, 16),
        AccessIndex::FragmentShaderSampledRead,
        OrderingRule::None,
        0,
    );
    assert!(!hazard.is_hazard());
}
