//!
//! Vigil is the synchronization-validation core of a validation layer for
//! Vulkan-style GPU command streams.
//!
//! Given recorded accesses to resource memory ranges and the explicit
//! synchronization between them (pipeline barriers, events, semaphores,
//! queue submissions), it computes whether each new access conflicts with
//! previously recorded ones and reports read-after-write, write-after-read,
//! write-after-write and their asynchronous racing variants, plus the
//! present-related hazards.
//!
//! Vigil does not own GPU memory, does not schedule execution and does not
//! format diagnostics; it consumes `(resource, range, access, ordering,
//! tag)` tuples from a recorder and produces structured hazard descriptors
//! plus updated access state.
//!

#![warn(missing_debug_implementations)]
#![warn(missing_copy_implementations)]

mod access;
mod barrier;
mod context;
mod event;
mod map;
mod queue;
mod range;
mod scope;
mod semaphore;
mod stage;
mod state;

pub use self::{
    access::*,
    barrier::*,
    context::*,
    event::*,
    map::*,
    queue::*,
    range::*,
    scope::*,
    semaphore::{SemaphoreId, SignalInfo},
    stage::*,
    state::*,
};

/// Monotonic submission-order index of a recorded access.
pub type Tag = u64;

/// Reserved tag denoting "no access".
pub const INVALID_TAG: Tag = Tag::MAX;

/// Index of a reporting handle attached to an access.
pub type HandleIndex = u32;

/// Sentinel for "no handle attached".
pub const NO_HANDLE: HandleIndex = HandleIndex::MAX;

/// Tag extended with an optional reporting handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct TagEx {
    pub tag: Tag,
    pub handle_index: HandleIndex,
}

impl TagEx {
    pub const fn new(tag: Tag) -> Self {
        TagEx {
            tag,
            handle_index: NO_HANDLE,
        }
    }

    pub const fn with_handle(tag: Tag, handle_index: HandleIndex) -> Self {
        TagEx { tag, handle_index }
    }
}

impl Default for TagEx {
    fn default() -> Self {
        TagEx {
            tag: 0,
            handle_index: NO_HANDLE,
        }
    }
}

/// Small integer identifying a queue.
pub type QueueId = u32;

/// Unknown or not-yet-assigned queue; accesses carry it while recording,
/// before submission binds them to a queue.
pub const INVALID_QUEUE: QueueId = QueueId::MAX;

/// Configuration of the validation core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct ValidatorConfig {
    /// Run the per-queue coordinator; otherwise only record-time validation
    /// is available.
    pub enable_queue_submit_validation: bool,

    /// Report present-related accesses with the `*Present*` hazard kinds
    /// instead of the plain read/write kinds.
    pub report_present_as_hazard: bool,

    /// Number of map mutations between amortized consolidation sweeps.
    pub consolidation_threshold: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            enable_queue_submit_validation: true,
            report_present_as_hazard: true,
            consolidation_threshold: context::DEFAULT_CONSOLIDATION_THRESHOLD,
        }
    }
}

/// Count denoting "all remaining levels or layers" in a subresource range.
pub const REMAINING: u32 = u32::MAX;

/// Image subresource selection with "to the end" sentinels, as passed by
/// callers; [`SubresourceRange::normalize`] resolves the sentinels so that
/// ownership-transfer release/acquire pairs compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    /// Whole-image selection.
    pub const fn whole() -> Self {
        SubresourceRange {
            base_mip_level: 0,
            level_count: REMAINING,
            base_array_layer: 0,
            layer_count: REMAINING,
        }
    }

    /// Resolve `REMAINING` counts against the image's actual extents,
    /// clamping bases into range.
    pub fn normalize(&self, mip_levels: u32, array_layers: u32) -> SubresourceRange {
        let base_mip_level = self.base_mip_level.min(mip_levels);
        let base_array_layer = self.base_array_layer.min(array_layers);
        let level_count = if self.level_count == REMAINING {
            mip_levels - base_mip_level
        } else {
            self.level_count.min(mip_levels - base_mip_level)
        };
        let layer_count = if self.layer_count == REMAINING {
            array_layers - base_array_layer
        } else {
            self.layer_count.min(array_layers - base_array_layer)
        };
        SubresourceRange {
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subresource_normalization_makes_transfer_pairs_equal() {
        let release = SubresourceRange {
            base_mip_level: 1,
            level_count: REMAINING,
            base_array_layer: 0,
            layer_count: 4,
        };
        let acquire = SubresourceRange {
            base_mip_level: 1,
            level_count: 3,
            base_array_layer: 0,
            layer_count: REMAINING,
        };
        assert_eq!(release.normalize(4, 4), acquire.normalize(4, 4));
    }

    #[test]
    fn config_defaults() {
        let config = ValidatorConfig::default();
        assert!(config.enable_queue_submit_validation);
        assert!(config.report_present_as_hazard);
        assert!(config.consolidation_threshold > 0);
    }
}
