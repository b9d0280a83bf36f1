use ash::vk;

use crate::shader_interface::PushConstants;

use super::{
    command_buffer::CommandContext, descriptor_set::BindingTable, pipeline::ComputePipeline,
};

/// Workgroup grid covering the image; ceiling division, so the compute
/// program bounds-checks threads past the image edge.
pub fn compute_grid(
    image_width: u32,
    image_height: u32,
    tile_width: u32,
    tile_height: u32,
) -> (u32, u32) {
    (
        (image_width + tile_width - 1) / tile_width,
        (image_height + tile_height - 1) / tile_height,
    )
}

/// Records the compute dispatch followed by the shader-write to host-read
/// memory barrier. The two are one operation here: without the barrier the
/// host may map stale or partially-written data, so there is no way to
/// record the dispatch and reach submission without it.
pub fn record_trace_dispatch(
    ctx: &mut CommandContext<'_>,
    pipeline: &ComputePipeline,
    table: &BindingTable,
    push_constants: &PushConstants,
    (groups_x, groups_y, groups_z): (u32, u32, u32),
) {
    let context = ctx.context().clone();
    let device = &context.device;
    let command_buffer = ctx.raw();
    let descriptor_set = table.descriptor_set();

    unsafe {
        device.cmd_bind_pipeline(
            command_buffer,
            vk::PipelineBindPoint::COMPUTE,
            pipeline.raw(),
        );
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::COMPUTE,
            pipeline.layout(),
            0,
            std::slice::from_ref(&descriptor_set),
            &[],
        );
        device.cmd_push_constants(
            command_buffer,
            pipeline.layout(),
            vk::ShaderStageFlags::COMPUTE,
            0,
            push_constants.as_bytes(),
        );
        device.cmd_dispatch(command_buffer, groups_x, groups_y, groups_z);
    }

    let memory_barrier = vk::MemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
        .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::HOST)
        .dst_access_mask(vk::AccessFlags2::HOST_READ)
        .build();
    let dependency_info =
        vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&memory_barrier));

    unsafe {
        context
            .synchronization2
            .cmd_pipeline_barrier2(command_buffer, &dependency_info)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_covers_the_exact_case() {
        assert_eq!(compute_grid(800, 600, 16, 8), (50, 75));
    }

    #[test]
    fn grid_rounds_up_partial_tiles() {
        assert_eq!(compute_grid(801, 600, 16, 8), (51, 75));
        assert_eq!(compute_grid(1, 1, 16, 8), (1, 1));
        assert_eq!(compute_grid(16, 9, 16, 8), (1, 2));
    }
}
