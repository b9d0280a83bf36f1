//! The contract shared with the compute program: slot layout, tile size,
//! push constants. `raytrace.comp.glsl` mirrors these values; change them
//! together.

use crate::vulkan::descriptor_set::{BindingLayout, BindingSchema, SlotKind};

pub const WORKGROUP_WIDTH: u32 = 16;
pub const WORKGROUP_HEIGHT: u32 = 8;

/// Output image, 3 floats per pixel, row-major.
pub const IMAGE_DATA_SLOT: u32 = 0;
/// The top-level acceleration structure.
pub const TLAS_SLOT: u32 = 1;
/// Flattened vertex positions.
pub const VERTICES_SLOT: u32 = 2;
/// Triangle vertex indices.
pub const INDICES_SLOT: u32 = 3;

pub const CHANNELS_PER_PIXEL: usize = 3;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PushConstants {
    pub sample_batch: u32,
    /// The compute program bounds-checks threads past the image edge
    /// against these, since the dispatch grid rounds up to whole tiles.
    pub render_width: u32,
    pub render_height: u32,
}

impl PushConstants {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                (self as *const Self).cast::<u8>(),
                std::mem::size_of::<Self>(),
            )
        }
    }
}

/// The slot table the compute program expects. Declared once; the binding
/// table and the pipeline layout are both derived from it.
pub fn binding_layout() -> BindingLayout {
    let mut schema = BindingSchema::new();
    schema
        .declare_slot(IMAGE_DATA_SLOT, SlotKind::StorageBuffer, 1)
        .declare_slot(TLAS_SLOT, SlotKind::AccelerationStructure, 1)
        .declare_slot(VERTICES_SLOT, SlotKind::StorageBuffer, 1)
        .declare_slot(INDICES_SLOT, SlotKind::StorageBuffer, 1);
    schema.finalize()
}

pub fn output_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS_PER_PIXEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_the_compute_program() {
        let layout = binding_layout();
        let slots = layout.slots();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].kind, SlotKind::StorageBuffer);
        assert_eq!(slots[1].kind, SlotKind::AccelerationStructure);
        assert_eq!(slots[2].kind, SlotKind::StorageBuffer);
        assert_eq!(slots[3].kind, SlotKind::StorageBuffer);
        assert_eq!(
            slots.iter().map(|slot| slot.index).collect::<Vec<_>>(),
            [0, 1, 2, 3]
        );
    }

    #[test]
    fn output_buffer_holds_three_floats_per_pixel() {
        assert_eq!(output_len(800, 600), 800 * 600 * 3);
        assert_eq!(output_len(16, 8), 384);
    }

    #[test]
    fn push_constants_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 12);
        let push = PushConstants {
            sample_batch: 1,
            render_width: 16,
            render_height: 8,
        };
        assert_eq!(push.as_bytes(), [1, 0, 0, 0, 16, 0, 0, 0, 8, 0, 0, 0]);
    }
}
