use once_cell::sync::Lazy;

bitflags::bitflags! {
    /// Pipeline stages of the abstract GPU execution model.
    ///
    /// Single-bit values denote real stages; `VERTEX_INPUT`, `ALL_TRANSFER`,
    /// `PRE_RASTERIZATION_SHADERS`, `ALL_GRAPHICS` and `ALL_COMMANDS` are
    /// meta-stages that must be expanded before being stored in any scope.
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct PipelineStages: u64 {
        /// Pseudo-stage that precedes all other stages.
        /// Used as a source scope it waits for nothing; as a destination
        /// scope it blocks everything behind the dependency.
        const TOP_OF_PIPE = 0x0000_0001;

        /// Stage at which indirect command parameters are read.
        const DRAW_INDIRECT = 0x0000_0002;

        /// Stage at which index buffers are read.
        const INDEX_INPUT = 0x0000_0004;

        /// Stage at which vertex attributes are read.
        const VERTEX_ATTRIBUTE_INPUT = 0x0000_0008;

        /// Stage at which the vertex shader executes.
        const VERTEX_SHADER = 0x0000_0010;

        /// Stage at which the tessellation control shader executes.
        const TESSELLATION_CONTROL_SHADER = 0x0000_0020;

        /// Stage at which the tessellation evaluation shader executes.
        const TESSELLATION_EVALUATION_SHADER = 0x0000_0040;

        /// Stage at which the geometry shader executes.
        const GEOMETRY_SHADER = 0x0000_0080;

        /// Early per-fragment depth and stencil tests.
        const EARLY_FRAGMENT_TESTS = 0x0000_0100;

        /// Stage at which the fragment shader executes.
        const FRAGMENT_SHADER = 0x0000_0200;

        /// Late per-fragment depth and stencil tests.
        const LATE_FRAGMENT_TESTS = 0x0000_0400;

        /// Stage at which color attachment output and resolve happen.
        const COLOR_ATTACHMENT_OUTPUT = 0x0000_0800;

        /// Stage at which the compute shader executes.
        const COMPUTE_SHADER = 0x0000_1000;

        /// Copy commands.
        const COPY = 0x0000_2000;

        /// Blit commands.
        const BLIT = 0x0000_4000;

        /// Clear commands.
        const CLEAR = 0x0000_8000;

        /// Resolve commands.
        const RESOLVE = 0x0001_0000;

        /// Stage at which ray-tracing shaders execute.
        const RAY_TRACING_SHADER = 0x0002_0000;

        /// Stage at which acceleration structures are built.
        const ACCELERATION_STRUCTURE_BUILD = 0x0004_0000;

        /// Stage at which acceleration structures are copied.
        const ACCELERATION_STRUCTURE_COPY = 0x0008_0000;

        /// Pseudo-stage for host accesses to device memory.
        const HOST = 0x0010_0000;

        /// Pseudo-stage for presentation-engine accesses. Internal to the
        /// validator; never accepted as a barrier stage parameter.
        const PRESENT_ENGINE = 0x0020_0000;

        /// Pseudo-stage that follows all other stages.
        const BOTTOM_OF_PIPE = 0x0040_0000;

        /// Meta-stage covering index and vertex attribute input.
        const VERTEX_INPUT = 0x0080_0000;

        /// Meta-stage covering all shader stages before rasterization.
        const PRE_RASTERIZATION_SHADERS = 0x0100_0000;

        /// Meta-stage covering all transfer commands.
        const ALL_TRANSFER = 0x0200_0000;

        /// Meta-stage covering every graphics pipeline stage.
        const ALL_GRAPHICS = 0x0400_0000;

        /// Meta-stage covering every command the queue can execute.
        const ALL_COMMANDS = 0x0800_0000;
    }
}

bitflags::bitflags! {
    /// Capabilities of the queue a scope is created for.
    /// Meta-stage expansion only yields stages the queue supports.
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct QueueFlags: u32 {
        const TRANSFER = 0b001;
        const COMPUTE  = 0b010;
        const GRAPHICS = 0b100;
    }
}

const GRAPHICS_STAGES: PipelineStages = PipelineStages::from_bits_truncate(
    PipelineStages::DRAW_INDIRECT.bits()
        | PipelineStages::INDEX_INPUT.bits()
        | PipelineStages::VERTEX_ATTRIBUTE_INPUT.bits()
        | PipelineStages::VERTEX_SHADER.bits()
        | PipelineStages::TESSELLATION_CONTROL_SHADER.bits()
        | PipelineStages::TESSELLATION_EVALUATION_SHADER.bits()
        | PipelineStages::GEOMETRY_SHADER.bits()
        | PipelineStages::EARLY_FRAGMENT_TESTS.bits()
        | PipelineStages::FRAGMENT_SHADER.bits()
        | PipelineStages::LATE_FRAGMENT_TESTS.bits()
        | PipelineStages::COLOR_ATTACHMENT_OUTPUT.bits(),
);

const TRANSFER_STAGES: PipelineStages = PipelineStages::from_bits_truncate(
    PipelineStages::COPY.bits()
        | PipelineStages::BLIT.bits()
        | PipelineStages::CLEAR.bits()
        | PipelineStages::RESOLVE.bits(),
);

const COMPUTE_STAGES: PipelineStages = PipelineStages::from_bits_truncate(
    PipelineStages::DRAW_INDIRECT.bits() | PipelineStages::COMPUTE_SHADER.bits(),
);

const RAY_TRACING_STAGES: PipelineStages = PipelineStages::from_bits_truncate(
    PipelineStages::RAY_TRACING_SHADER.bits()
        | PipelineStages::ACCELERATION_STRUCTURE_BUILD.bits()
        | PipelineStages::ACCELERATION_STRUCTURE_COPY.bits(),
);

const PRE_RASTER_STAGES: PipelineStages = PipelineStages::from_bits_truncate(
    PipelineStages::VERTEX_SHADER.bits()
        | PipelineStages::TESSELLATION_CONTROL_SHADER.bits()
        | PipelineStages::TESSELLATION_EVALUATION_SHADER.bits()
        | PipelineStages::GEOMETRY_SHADER.bits(),
);

impl PipelineStages {
    /// Stages a queue with the given capabilities can execute.
    /// Host and presentation pseudo-stages are never queue work.
    pub fn supported_by_queue(queue_flags: QueueFlags) -> PipelineStages {
        let mut stages = PipelineStages::TOP_OF_PIPE | PipelineStages::BOTTOM_OF_PIPE;
        if queue_flags.contains(QueueFlags::GRAPHICS) {
            stages |= GRAPHICS_STAGES | TRANSFER_STAGES | COMPUTE_STAGES | RAY_TRACING_STAGES;
        }
        if queue_flags.contains(QueueFlags::COMPUTE) {
            stages |= COMPUTE_STAGES | RAY_TRACING_STAGES | TRANSFER_STAGES;
        }
        if queue_flags.contains(QueueFlags::TRANSFER) {
            stages |= TRANSFER_STAGES;
        }
        stages
    }

    /// Replace meta-stages with the real stages they cover on a queue with
    /// the given capabilities, and drop stages disabled by features.
    pub fn expand(self, queue_flags: QueueFlags, disabled: PipelineStages) -> PipelineStages {
        let supported = PipelineStages::supported_by_queue(queue_flags);
        let mut expanded = self
            & !(PipelineStages::VERTEX_INPUT
                | PipelineStages::PRE_RASTERIZATION_SHADERS
                | PipelineStages::ALL_TRANSFER
                | PipelineStages::ALL_GRAPHICS
                | PipelineStages::ALL_COMMANDS);

        if self.contains(PipelineStages::VERTEX_INPUT) {
            expanded |= PipelineStages::INDEX_INPUT | PipelineStages::VERTEX_ATTRIBUTE_INPUT;
        }
        if self.contains(PipelineStages::PRE_RASTERIZATION_SHADERS) {
            expanded |= PRE_RASTER_STAGES;
        }
        if self.contains(PipelineStages::ALL_TRANSFER) {
            expanded |= TRANSFER_STAGES;
        }
        if self.contains(PipelineStages::ALL_GRAPHICS) {
            expanded |= GRAPHICS_STAGES & supported;
        }
        if self.contains(PipelineStages::ALL_COMMANDS) {
            expanded |= supported;
        }
        expanded - disabled
    }

    /// All stages logically ordered before any stage in `self`, plus `self`.
    pub fn with_earlier(self) -> PipelineStages {
        self | related_stages(self, &EARLIER_STAGES)
    }

    /// All stages logically ordered after any stage in `self`, plus `self`.
    pub fn with_later(self) -> PipelineStages {
        self | related_stages(self, &LATER_STAGES)
    }
}

/// Stages in their logical pipeline orders. Each list is one pipeline; a
/// stage is "earlier" than another iff it precedes it in some list.
/// `TOP_OF_PIPE` and `BOTTOM_OF_PIPE` bound every pipeline.
const PIPELINE_ORDERS: &[&[PipelineStages]] = &[
    &[
        PipelineStages::DRAW_INDIRECT,
        PipelineStages::INDEX_INPUT,
        PipelineStages::VERTEX_ATTRIBUTE_INPUT,
        PipelineStages::VERTEX_SHADER,
        PipelineStages::TESSELLATION_CONTROL_SHADER,
        PipelineStages::TESSELLATION_EVALUATION_SHADER,
        PipelineStages::GEOMETRY_SHADER,
        PipelineStages::EARLY_FRAGMENT_TESTS,
        PipelineStages::FRAGMENT_SHADER,
        PipelineStages::LATE_FRAGMENT_TESTS,
        PipelineStages::COLOR_ATTACHMENT_OUTPUT,
    ],
    &[PipelineStages::DRAW_INDIRECT, PipelineStages::COMPUTE_SHADER],
    &[PipelineStages::DRAW_INDIRECT, PipelineStages::RAY_TRACING_SHADER],
];

/// Stages that take part in no pipeline but are still bounded by the pipe
/// pseudo-stages.
const UNORDERED_STAGES: &[PipelineStages] = &[
    PipelineStages::COPY,
    PipelineStages::BLIT,
    PipelineStages::CLEAR,
    PipelineStages::RESOLVE,
    PipelineStages::ACCELERATION_STRUCTURE_BUILD,
    PipelineStages::ACCELERATION_STRUCTURE_COPY,
    PipelineStages::HOST,
];

struct OrderTable {
    // One entry per real stage bit: (stage, related stages).
    entries: Vec<(PipelineStages, PipelineStages)>,
}

fn all_real_stages() -> PipelineStages {
    GRAPHICS_STAGES
        | TRANSFER_STAGES
        | COMPUTE_STAGES
        | RAY_TRACING_STAGES
        | PipelineStages::TOP_OF_PIPE
        | PipelineStages::BOTTOM_OF_PIPE
        | PipelineStages::HOST
}

fn build_order_table(earlier: bool) -> OrderTable {
    let mut entries: Vec<(PipelineStages, PipelineStages)> = Vec::new();
    let mut add = |stage: PipelineStages, related: PipelineStages| {
        if let Some(entry) = entries.iter_mut().find(|(s, _)| *s == stage) {
            entry.1 |= related;
        } else {
            entries.push((stage, related));
        }
    };

    for order in PIPELINE_ORDERS {
        for (i, &stage) in order.iter().enumerate() {
            let mut related = PipelineStages::empty();
            if earlier {
                for &prior in &order[..i] {
                    related |= prior;
                }
                related |= PipelineStages::TOP_OF_PIPE;
            } else {
                for &later in &order[i + 1..] {
                    related |= later;
                }
                related |= PipelineStages::BOTTOM_OF_PIPE;
            }
            add(stage, related);
        }
    }

    for &stage in UNORDERED_STAGES {
        let related = if earlier {
            PipelineStages::TOP_OF_PIPE
        } else {
            PipelineStages::BOTTOM_OF_PIPE
        };
        add(stage, related);
    }

    if earlier {
        add(
            PipelineStages::BOTTOM_OF_PIPE,
            all_real_stages() - PipelineStages::BOTTOM_OF_PIPE,
        );
    } else {
        add(
            PipelineStages::TOP_OF_PIPE,
            all_real_stages() - PipelineStages::TOP_OF_PIPE,
        );
    }

    OrderTable { entries }
}

static EARLIER_STAGES: Lazy<OrderTable> = Lazy::new(|| build_order_table(true));
static LATER_STAGES: Lazy<OrderTable> = Lazy::new(|| build_order_table(false));

fn related_stages(stages: PipelineStages, table: &OrderTable) -> PipelineStages {
    let mut unscanned = stages;
    let mut related = PipelineStages::empty();
    for &(stage, stage_related) in &table.entries {
        if unscanned.intersects(stage) {
            related |= stage_related;
            unscanned -= stage;
            if unscanned.is_empty() {
                break;
            }
        }
    }
    related
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_expansion_respects_queue() {
        let graphics =
            PipelineStages::ALL_GRAPHICS.expand(QueueFlags::GRAPHICS, PipelineStages::empty());
        assert!(graphics.contains(PipelineStages::FRAGMENT_SHADER));
        assert!(!graphics.contains(PipelineStages::ALL_GRAPHICS));

        let compute_only =
            PipelineStages::ALL_COMMANDS.expand(QueueFlags::COMPUTE, PipelineStages::empty());
        assert!(compute_only.contains(PipelineStages::COMPUTE_SHADER));
        assert!(!compute_only.contains(PipelineStages::FRAGMENT_SHADER));
        assert!(!compute_only.contains(PipelineStages::HOST));
    }

    #[test]
    fn disabled_features_are_dropped() {
        let expanded = PipelineStages::ALL_GRAPHICS.expand(
            QueueFlags::GRAPHICS,
            PipelineStages::GEOMETRY_SHADER | PipelineStages::TESSELLATION_CONTROL_SHADER,
        );
        assert!(!expanded.contains(PipelineStages::GEOMETRY_SHADER));
        assert!(expanded.contains(PipelineStages::VERTEX_SHADER));
    }

    #[test]
    fn earlier_later_are_duals_along_the_graphics_pipe() {
        let earlier = PipelineStages::FRAGMENT_SHADER.with_earlier();
        assert!(earlier.contains(PipelineStages::VERTEX_SHADER));
        assert!(earlier.contains(PipelineStages::TOP_OF_PIPE));
        assert!(!earlier.contains(PipelineStages::COLOR_ATTACHMENT_OUTPUT));

        let later = PipelineStages::FRAGMENT_SHADER.with_later();
        assert!(later.contains(PipelineStages::COLOR_ATTACHMENT_OUTPUT));
        assert!(later.contains(PipelineStages::BOTTOM_OF_PIPE));
        assert!(!later.contains(PipelineStages::VERTEX_SHADER));
    }

    #[test]
    fn compute_is_not_ordered_against_fragment() {
        let later = PipelineStages::COMPUTE_SHADER.with_later();
        assert!(!later.contains(PipelineStages::FRAGMENT_SHADER));
        assert!(later.contains(PipelineStages::BOTTOM_OF_PIPE));
    }
}
