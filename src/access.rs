use crate::stage::PipelineStages;

bitflags::bitflags! {
    /// Access mask parameter of a barrier, before expansion into atomic
    /// accesses. `SHADER_READ`, `SHADER_WRITE`, `MEMORY_READ` and
    /// `MEMORY_WRITE` are meta-accesses.
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct AccessFlags: u64 {
        const INDIRECT_COMMAND_READ = 0x0000_0001;
        const INDEX_READ = 0x0000_0002;
        const VERTEX_ATTRIBUTE_READ = 0x0000_0004;
        const UNIFORM_READ = 0x0000_0008;
        const INPUT_ATTACHMENT_READ = 0x0000_0010;
        const SHADER_SAMPLED_READ = 0x0000_0020;
        const SHADER_STORAGE_READ = 0x0000_0040;
        const SHADER_STORAGE_WRITE = 0x0000_0080;
        const COLOR_ATTACHMENT_READ = 0x0000_0100;
        const COLOR_ATTACHMENT_WRITE = 0x0000_0200;
        const DEPTH_STENCIL_ATTACHMENT_READ = 0x0000_0400;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 0x0000_0800;
        const TRANSFER_READ = 0x0000_1000;
        const TRANSFER_WRITE = 0x0000_2000;
        const HOST_READ = 0x0000_4000;
        const HOST_WRITE = 0x0000_8000;
        const ACCELERATION_STRUCTURE_READ = 0x0001_0000;
        const ACCELERATION_STRUCTURE_WRITE = 0x0002_0000;

        /// Meta-access covering uniform, sampled and storage reads.
        const SHADER_READ = 0x0010_0000;
        /// Meta-access covering storage writes.
        const SHADER_WRITE = 0x0020_0000;
        /// Meta-access covering every read access.
        const MEMORY_READ = 0x0040_0000;
        /// Meta-access covering every write access.
        const MEMORY_WRITE = 0x0080_0000;
    }
}

impl AccessFlags {
    /// Atomic accesses `SHADER_READ` stands for.
    pub const SHADER_READ_EXPANDED: AccessFlags = AccessFlags::from_bits_truncate(
        AccessFlags::UNIFORM_READ.bits()
            | AccessFlags::SHADER_SAMPLED_READ.bits()
            | AccessFlags::SHADER_STORAGE_READ.bits(),
    );

    /// Atomic accesses `SHADER_WRITE` stands for.
    pub const SHADER_WRITE_EXPANDED: AccessFlags =
        AccessFlags::from_bits_truncate(AccessFlags::SHADER_STORAGE_WRITE.bits());

    /// Replace meta-accesses with the atomic accesses they cover.
    pub fn expand(self) -> AccessFlags {
        let mut expanded = self;
        if self.contains(AccessFlags::SHADER_READ) {
            expanded -= AccessFlags::SHADER_READ;
            expanded |= AccessFlags::SHADER_READ_EXPANDED;
        }
        if self.contains(AccessFlags::SHADER_WRITE) {
            expanded -= AccessFlags::SHADER_WRITE;
            expanded |= AccessFlags::SHADER_WRITE_EXPANDED;
        }
        if self.contains(AccessFlags::MEMORY_READ) {
            expanded -= AccessFlags::MEMORY_READ;
            expanded |= ALL_READ_ACCESSES;
        }
        if self.contains(AccessFlags::MEMORY_WRITE) {
            expanded -= AccessFlags::MEMORY_WRITE;
            expanded |= ALL_WRITE_ACCESSES;
        }
        expanded
    }
}

const ALL_READ_ACCESSES: AccessFlags = AccessFlags::from_bits_truncate(
    AccessFlags::INDIRECT_COMMAND_READ.bits()
        | AccessFlags::INDEX_READ.bits()
        | AccessFlags::VERTEX_ATTRIBUTE_READ.bits()
        | AccessFlags::UNIFORM_READ.bits()
        | AccessFlags::INPUT_ATTACHMENT_READ.bits()
        | AccessFlags::SHADER_SAMPLED_READ.bits()
        | AccessFlags::SHADER_STORAGE_READ.bits()
        | AccessFlags::COLOR_ATTACHMENT_READ.bits()
        | AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.bits()
        | AccessFlags::TRANSFER_READ.bits()
        | AccessFlags::HOST_READ.bits()
        | AccessFlags::ACCELERATION_STRUCTURE_READ.bits(),
);

const ALL_WRITE_ACCESSES: AccessFlags = AccessFlags::from_bits_truncate(
    AccessFlags::SHADER_STORAGE_WRITE.bits()
        | AccessFlags::COLOR_ATTACHMENT_WRITE.bits()
        | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.bits()
        | AccessFlags::TRANSFER_WRITE.bits()
        | AccessFlags::HOST_WRITE.bits()
        | AccessFlags::ACCELERATION_STRUCTURE_WRITE.bits(),
);

/// Atomic `(stage, access)` pair. The discriminant is the bit position in
/// [`AccessScope`](crate::scope::AccessScope) and the row in [`ACCESS_INFOS`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum AccessIndex {
    /// Placeholder for "no access"; used by barrier application when a
    /// layout transition targets a range with no prior write.
    None = 0,

    DrawIndirectCommandRead,
    IndexInputIndexRead,
    VertexAttributeInputAttributeRead,

    VertexShaderUniformRead,
    VertexShaderSampledRead,
    VertexShaderStorageRead,
    VertexShaderStorageWrite,

    TessellationControlShaderUniformRead,
    TessellationControlShaderSampledRead,
    TessellationControlShaderStorageRead,
    TessellationControlShaderStorageWrite,

    TessellationEvaluationShaderUniformRead,
    TessellationEvaluationShaderSampledRead,
    TessellationEvaluationShaderStorageRead,
    TessellationEvaluationShaderStorageWrite,

    GeometryShaderUniformRead,
    GeometryShaderSampledRead,
    GeometryShaderStorageRead,
    GeometryShaderStorageWrite,

    FragmentShaderUniformRead,
    FragmentShaderSampledRead,
    FragmentShaderStorageRead,
    FragmentShaderInputAttachmentRead,
    FragmentShaderStorageWrite,

    EarlyFragmentTestsDepthStencilRead,
    EarlyFragmentTestsDepthStencilWrite,
    LateFragmentTestsDepthStencilRead,
    LateFragmentTestsDepthStencilWrite,

    ColorAttachmentOutputColorRead,
    ColorAttachmentOutputColorWrite,

    ComputeShaderUniformRead,
    ComputeShaderSampledRead,
    ComputeShaderStorageRead,
    ComputeShaderStorageWrite,

    CopyTransferRead,
    CopyTransferWrite,
    BlitTransferRead,
    BlitTransferWrite,
    ClearTransferWrite,
    ResolveTransferRead,
    ResolveTransferWrite,

    RayTracingShaderUniformRead,
    RayTracingShaderSampledRead,
    RayTracingShaderStorageRead,
    RayTracingShaderStorageWrite,

    AccelerationStructureBuildAccelerationStructureRead,
    AccelerationStructureBuildAccelerationStructureWrite,
    /// The build stage consumes `SHADER_READ` directly: drivers are free to
    /// pick the atomic accesses, so the meta access is kept unexpanded here.
    AccelerationStructureBuildShaderRead,
    AccelerationStructureCopyAccelerationStructureRead,
    AccelerationStructureCopyAccelerationStructureWrite,

    HostRead,
    HostWrite,

    PresentEngineAcquireRead,
    PresentEnginePresented,

    /// Image layout transition, modelled as a write performed by the barrier
    /// itself.
    ImageLayoutTransition,
}

pub const ACCESS_INDEX_COUNT: usize = AccessIndex::ImageLayoutTransition as usize + 1;

/// Static description of one atomic access.
#[derive(Clone, Copy, Debug)]
pub struct AccessInfo {
    pub access_index: AccessIndex,
    /// The single stage bit this access happens at. Empty for `None` and
    /// `ImageLayoutTransition`.
    pub stage: PipelineStages,
    /// The single access-mask bit that selects this access. Empty for the
    /// special entries.
    pub access: AccessFlags,
    pub is_read: bool,
    pub name: &'static str,
}

impl AccessInfo {
    pub fn is_write(&self) -> bool {
        !self.is_read
    }
}

impl AccessIndex {
    pub fn info(self) -> &'static AccessInfo {
        &ACCESS_INFOS[self as usize]
    }

    pub fn is_read(self) -> bool {
        self.info().is_read
    }

    pub fn stage(self) -> PipelineStages {
        self.info().stage
    }
}

macro_rules! access_info {
    ($index:ident, $stage:ident, $access:ident, $is_read:expr) => {
        AccessInfo {
            access_index: AccessIndex::$index,
            stage: PipelineStages::$stage,
            access: AccessFlags::$access,
            is_read: $is_read,
            name: stringify!($index),
        }
    };
}

/// One row per `AccessIndex`, in discriminant order.
pub static ACCESS_INFOS: [AccessInfo; ACCESS_INDEX_COUNT] = [
    AccessInfo {
        access_index: AccessIndex::None,
        stage: PipelineStages::empty(),
        access: AccessFlags::empty(),
        is_read: false,
        name: "None",
    },
    access_info!(DrawIndirectCommandRead, DRAW_INDIRECT, INDIRECT_COMMAND_READ, true),
    access_info!(IndexInputIndexRead, INDEX_INPUT, INDEX_READ, true),
    access_info!(VertexAttributeInputAttributeRead, VERTEX_ATTRIBUTE_INPUT, VERTEX_ATTRIBUTE_READ, true),
    access_info!(VertexShaderUniformRead, VERTEX_SHADER, UNIFORM_READ, true),
    access_info!(VertexShaderSampledRead, VERTEX_SHADER, SHADER_SAMPLED_READ, true),
    access_info!(VertexShaderStorageRead, VERTEX_SHADER, SHADER_STORAGE_READ, true),
    access_info!(VertexShaderStorageWrite, VERTEX_SHADER, SHADER_STORAGE_WRITE, false),
    access_info!(TessellationControlShaderUniformRead, TESSELLATION_CONTROL_SHADER, UNIFORM_READ, true),
    access_info!(TessellationControlShaderSampledRead, TESSELLATION_CONTROL_SHADER, SHADER_SAMPLED_READ, true),
    access_info!(TessellationControlShaderStorageRead, TESSELLATION_CONTROL_SHADER, SHADER_STORAGE_READ, true),
    access_info!(TessellationControlShaderStorageWrite, TESSELLATION_CONTROL_SHADER, SHADER_STORAGE_WRITE, false),
    access_info!(TessellationEvaluationShaderUniformRead, TESSELLATION_EVALUATION_SHADER, UNIFORM_READ, true),
    access_info!(TessellationEvaluationShaderSampledRead, TESSELLATION_EVALUATION_SHADER, SHADER_SAMPLED_READ, true),
    access_info!(TessellationEvaluationShaderStorageRead, TESSELLATION_EVALUATION_SHADER, SHADER_STORAGE_READ, true),
    access_info!(TessellationEvaluationShaderStorageWrite, TESSELLATION_EVALUATION_SHADER, SHADER_STORAGE_WRITE, false),
    access_info!(GeometryShaderUniformRead, GEOMETRY_SHADER, UNIFORM_READ, true),
    access_info!(GeometryShaderSampledRead, GEOMETRY_SHADER, SHADER_SAMPLED_READ, true),
    access_info!(GeometryShaderStorageRead, GEOMETRY_SHADER, SHADER_STORAGE_READ, true),
    access_info!(GeometryShaderStorageWrite, GEOMETRY_SHADER, SHADER_STORAGE_WRITE, false),
    access_info!(FragmentShaderUniformRead, FRAGMENT_SHADER, UNIFORM_READ, true),
    access_info!(FragmentShaderSampledRead, FRAGMENT_SHADER, SHADER_SAMPLED_READ, true),
    access_info!(FragmentShaderStorageRead, FRAGMENT_SHADER, SHADER_STORAGE_READ, true),
    access_info!(FragmentShaderInputAttachmentRead, FRAGMENT_SHADER, INPUT_ATTACHMENT_READ, true),
    access_info!(FragmentShaderStorageWrite, FRAGMENT_SHADER, SHADER_STORAGE_WRITE, false),
    access_info!(EarlyFragmentTestsDepthStencilRead, EARLY_FRAGMENT_TESTS, DEPTH_STENCIL_ATTACHMENT_READ, true),
    access_info!(EarlyFragmentTestsDepthStencilWrite, EARLY_FRAGMENT_TESTS, DEPTH_STENCIL_ATTACHMENT_WRITE, false),
    access_info!(LateFragmentTestsDepthStencilRead, LATE_FRAGMENT_TESTS, DEPTH_STENCIL_ATTACHMENT_READ, true),
    access_info!(LateFragmentTestsDepthStencilWrite, LATE_FRAGMENT_TESTS, DEPTH_STENCIL_ATTACHMENT_WRITE, false),
    access_info!(ColorAttachmentOutputColorRead, COLOR_ATTACHMENT_OUTPUT, COLOR_ATTACHMENT_READ, true),
    access_info!(ColorAttachmentOutputColorWrite, COLOR_ATTACHMENT_OUTPUT, COLOR_ATTACHMENT_WRITE, false),
    access_info!(ComputeShaderUniformRead, COMPUTE_SHADER, UNIFORM_READ, true),
    access_info!(ComputeShaderSampledRead, COMPUTE_SHADER, SHADER_SAMPLED_READ, true),
    access_info!(ComputeShaderStorageRead, COMPUTE_SHADER, SHADER_STORAGE_READ, true),
    access_info!(ComputeShaderStorageWrite, COMPUTE_SHADER, SHADER_STORAGE_WRITE, false),
    access_info!(CopyTransferRead, COPY, TRANSFER_READ, true),
    access_info!(CopyTransferWrite, COPY, TRANSFER_WRITE, false),
    access_info!(BlitTransferRead, BLIT, TRANSFER_READ, true),
    access_info!(BlitTransferWrite, BLIT, TRANSFER_WRITE, false),
    access_info!(ClearTransferWrite, CLEAR, TRANSFER_WRITE, false),
    access_info!(ResolveTransferRead, RESOLVE, TRANSFER_READ, true),
    access_info!(ResolveTransferWrite, RESOLVE, TRANSFER_WRITE, false),
    access_info!(RayTracingShaderUniformRead, RAY_TRACING_SHADER, UNIFORM_READ, true),
    access_info!(RayTracingShaderSampledRead, RAY_TRACING_SHADER, SHADER_SAMPLED_READ, true),
    access_info!(RayTracingShaderStorageRead, RAY_TRACING_SHADER, SHADER_STORAGE_READ, true),
    access_info!(RayTracingShaderStorageWrite, RAY_TRACING_SHADER, SHADER_STORAGE_WRITE, false),
    access_info!(AccelerationStructureBuildAccelerationStructureRead, ACCELERATION_STRUCTURE_BUILD, ACCELERATION_STRUCTURE_READ, true),
    access_info!(AccelerationStructureBuildAccelerationStructureWrite, ACCELERATION_STRUCTURE_BUILD, ACCELERATION_STRUCTURE_WRITE, false),
    access_info!(AccelerationStructureBuildShaderRead, ACCELERATION_STRUCTURE_BUILD, SHADER_READ, true),
    access_info!(AccelerationStructureCopyAccelerationStructureRead, ACCELERATION_STRUCTURE_COPY, ACCELERATION_STRUCTURE_READ, true),
    access_info!(AccelerationStructureCopyAccelerationStructureWrite, ACCELERATION_STRUCTURE_COPY, ACCELERATION_STRUCTURE_WRITE, false),
    access_info!(HostRead, HOST, HOST_READ, true),
    access_info!(HostWrite, HOST, HOST_WRITE, false),
    // Present-engine accesses are issued by the validator itself and are
    // never selected through an access mask.
    AccessInfo {
        access_index: AccessIndex::PresentEngineAcquireRead,
        stage: PipelineStages::PRESENT_ENGINE,
        access: AccessFlags::empty(),
        is_read: true,
        name: "PresentEngineAcquireRead",
    },
    AccessInfo {
        access_index: AccessIndex::PresentEnginePresented,
        stage: PipelineStages::PRESENT_ENGINE,
        access: AccessFlags::empty(),
        is_read: false,
        name: "PresentEnginePresented",
    },
    AccessInfo {
        access_index: AccessIndex::ImageLayoutTransition,
        stage: PipelineStages::empty(),
        access: AccessFlags::empty(),
        is_read: false,
        name: "ImageLayoutTransition",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_rows_match_discriminants() {
        for (i, info) in ACCESS_INFOS.iter().enumerate() {
            assert_eq!(info.access_index as usize, i, "row {} out of order", i);
        }
    }

    #[test]
    fn meta_access_expansion() {
        let expanded = (AccessFlags::SHADER_READ | AccessFlags::TRANSFER_WRITE).expand();
        assert!(expanded.contains(AccessFlags::UNIFORM_READ));
        assert!(expanded.contains(AccessFlags::SHADER_SAMPLED_READ));
        assert!(expanded.contains(AccessFlags::SHADER_STORAGE_READ));
        assert!(expanded.contains(AccessFlags::TRANSFER_WRITE));
        assert!(!expanded.contains(AccessFlags::SHADER_READ));
    }

    #[test]
    fn read_write_classification() {
        assert!(AccessIndex::FragmentShaderSampledRead.is_read());
        assert!(!AccessIndex::CopyTransferWrite.is_read());
        assert!(!AccessIndex::ImageLayoutTransition.is_read());
    }
}
