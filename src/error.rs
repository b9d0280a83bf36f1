use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::vulkan::descriptor_set::SlotKind;

/// Every failure in the pipeline is fatal: the process reports the failing
/// stage and exits non-zero. There is no retry tier.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("required capability missing: {0}")]
    CapabilityMissing(&'static str),

    #[error("device allocation of {size} bytes failed")]
    OutOfDeviceMemory { size: u64 },

    #[error("buffer memory is not host-visible and cannot be mapped")]
    InvalidAccess,

    #[error("slot {slot} declared as {declared:?}, bound as {bound:?}")]
    SlotKindMismatch {
        slot: u32,
        declared: Option<SlotKind>,
        bound: SlotKind,
    },

    #[error(
        "instance {instance} references bottom-level structure {blas_index}, \
         but only {blas_count} were built"
    )]
    DanglingInstanceReference {
        instance: usize,
        blas_index: usize,
        blas_count: usize,
    },

    #[error("device rejected submitted commands: {0}")]
    SubmissionFailure(vk::Result),

    #[error("compute program {} not found on the search paths", .0.display())]
    ProgramNotFound(PathBuf),

    #[error("compute program {} is not valid SPIR-V", .0.display())]
    ProgramInvalid(PathBuf),

    #[error(
        "scene must contain exactly one mesh with one primitive \
         (found {meshes} meshes, {primitives} primitives)"
    )]
    UnsupportedSceneLayout { meshes: usize, primitives: usize },

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
}
