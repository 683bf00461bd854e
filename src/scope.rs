use std::{
    fmt::{self, Debug},
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
};

use crate::{
    access::{AccessFlags, AccessIndex, AccessInfo, ACCESS_INDEX_COUNT, ACCESS_INFOS},
    stage::{PipelineStages, QueueFlags},
};

const WORDS: usize = (ACCESS_INDEX_COUNT + 63) / 64;

/// Fixed-width set of atomic accesses, one bit per [`AccessIndex`].
///
/// Trivially copyable and cheap to compare; the width is the row count of
/// [`ACCESS_INFOS`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct AccessScope([u64; WORDS]);

impl AccessScope {
    pub const fn empty() -> Self {
        AccessScope([0; WORDS])
    }

    pub fn all() -> Self {
        let mut scope = AccessScope([!0u64; WORDS]);
        // Clear the bits past the table width so complement stays closed.
        let tail = ACCESS_INDEX_COUNT % 64;
        if tail != 0 {
            scope.0[WORDS - 1] = (1u64 << tail) - 1;
        }
        scope
    }

    pub const fn single(index: AccessIndex) -> Self {
        let mut words = [0u64; WORDS];
        let bit = index as usize;
        words[bit / 64] = 1u64 << (bit % 64);
        AccessScope(words)
    }

    pub fn set(&mut self, index: AccessIndex) {
        let bit = index as usize;
        self.0[bit / 64] |= 1u64 << (bit % 64);
    }

    pub fn clear(&mut self, index: AccessIndex) {
        let bit = index as usize;
        self.0[bit / 64] &= !(1u64 << (bit % 64));
    }

    pub fn contains(&self, index: AccessIndex) -> bool {
        let bit = index as usize;
        self.0[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|w| *w != 0)
    }

    pub fn none(&self) -> bool {
        !self.any()
    }

    pub fn intersects(&self, other: &AccessScope) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    pub fn reset(&mut self) {
        self.0 = [0; WORDS];
    }

    /// Accesses present in the set, in table order.
    pub fn iter(&self) -> impl Iterator<Item = AccessIndex> + '_ {
        ACCESS_INFOS
            .iter()
            .map(|info| info.access_index)
            .filter(move |index| self.contains(*index))
    }
}

impl BitOr for AccessScope {
    type Output = AccessScope;
    fn bitor(mut self, rhs: AccessScope) -> AccessScope {
        self |= rhs;
        self
    }
}

impl BitOrAssign for AccessScope {
    fn bitor_assign(&mut self, rhs: AccessScope) {
        for (w, r) in self.0.iter_mut().zip(rhs.0.iter()) {
            *w |= r;
        }
    }
}

impl BitAnd for AccessScope {
    type Output = AccessScope;
    fn bitand(mut self, rhs: AccessScope) -> AccessScope {
        self &= rhs;
        self
    }
}

impl BitAndAssign for AccessScope {
    fn bitand_assign(&mut self, rhs: AccessScope) {
        for (w, r) in self.0.iter_mut().zip(rhs.0.iter()) {
            *w &= r;
        }
    }
}

impl Not for AccessScope {
    type Output = AccessScope;
    fn not(mut self) -> AccessScope {
        for w in self.0.iter_mut() {
            *w = !*w;
        }
        self & AccessScope::all()
    }
}

impl Debug for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// One side of a barrier after stage expansion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecScope {
    /// The stage mask as the caller passed it.
    pub mask_param: PipelineStages,
    /// All logically earlier (source side) or later (destination side)
    /// stages affected by a barrier using this scope.
    pub exec_scope: PipelineStages,
    /// All atomic accesses that can happen at the expanded stages.
    pub valid_accesses: AccessScope,
}

impl Default for ExecScope {
    fn default() -> Self {
        ExecScope {
            mask_param: PipelineStages::empty(),
            exec_scope: PipelineStages::empty(),
            valid_accesses: AccessScope::empty(),
        }
    }
}

impl ExecScope {
    /// Source scope: meta-stage expansion, then all logically earlier stages.
    pub fn make_src(
        queue_flags: QueueFlags,
        stage_mask: PipelineStages,
        disabled_features: PipelineStages,
    ) -> ExecScope {
        let expanded = stage_mask.expand(queue_flags, disabled_features);
        let mut valid_accesses = access_scope_by_stage(expanded);
        if stage_mask.contains(PipelineStages::ALL_COMMANDS) {
            // ALL_COMMANDS covers every access the gpu performs, including
            // the writes layout transitions are modelled as.
            valid_accesses.set(AccessIndex::ImageLayoutTransition);
        }
        ExecScope {
            mask_param: stage_mask,
            exec_scope: expanded.with_earlier(),
            valid_accesses,
        }
    }

    /// Destination scope: meta-stage expansion, then all logically later stages.
    pub fn make_dst(queue_flags: QueueFlags, stage_mask: PipelineStages) -> ExecScope {
        let expanded = stage_mask.expand(queue_flags, PipelineStages::empty());
        let mut valid_accesses = access_scope_by_stage(expanded);
        if stage_mask.contains(PipelineStages::ALL_COMMANDS) {
            valid_accesses.set(AccessIndex::ImageLayoutTransition);
        }
        ExecScope {
            mask_param: stage_mask,
            exec_scope: expanded.with_later(),
            valid_accesses,
        }
    }
}

/// Union of the accesses that can happen at any stage in `stages`.
pub fn access_scope_by_stage(stages: PipelineStages) -> AccessScope {
    let mut scope = AccessScope::empty();
    for info in table_entries() {
        if stages.contains(info.stage) {
            scope.set(info.access_index);
        }
    }
    scope
}

/// Union of the accesses selected by an access mask, at any stage.
pub fn access_scope_by_access(access_mask: AccessFlags) -> AccessScope {
    let expanded = access_mask.expand();
    let mut scope = AccessScope::empty();
    for info in table_entries() {
        if expanded.contains(info.access) {
            scope.set(info.access_index);
        }
    }
    // The acceleration-structure build stage uses the SHADER_READ meta access
    // directly; expansion must not narrow it to specific atomic accesses.
    if access_mask.contains(AccessFlags::SHADER_READ) {
        scope.set(AccessIndex::AccelerationStructureBuildShaderRead);
    }
    scope
}

/// Accesses selected by `access_mask` restricted to a stage scope, with the
/// acceleration-structure aliasing rules applied.
pub fn access_scope(stage_scope: &AccessScope, access_mask: AccessFlags) -> AccessScope {
    let mut scope = *stage_scope & access_scope_by_access(access_mask);

    // AS copies may be synchronized through the ACCELERATION_STRUCTURE_BUILD
    // stage even though the accesses are tracked on the copy stage.
    if scope.contains(AccessIndex::AccelerationStructureBuildAccelerationStructureRead) {
        scope.set(AccessIndex::AccelerationStructureCopyAccelerationStructureRead);
    }
    if scope.contains(AccessIndex::AccelerationStructureBuildAccelerationStructureWrite) {
        scope.set(AccessIndex::AccelerationStructureCopyAccelerationStructureWrite);
    }
    scope
}

fn table_entries() -> impl Iterator<Item = &'static AccessInfo> {
    // The placeholder rows have empty stage and access bits; `contains` on an
    // empty set is always true, so they must be skipped explicitly.
    ACCESS_INFOS
        .iter()
        .filter(|info| !info.stage.is_empty() && !info.access.is_empty())
}
