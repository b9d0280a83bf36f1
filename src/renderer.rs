use std::sync::Arc;

use anyhow::Context as _;
use ash::vk;
use log::{debug, info};
use ultraviolet::Mat4;

use crate::config_loader::Config;
use crate::loader::{self, LoadedMesh};
use crate::output;
use crate::shader_interface::{
    self, PushConstants, IMAGE_DATA_SLOT, INDICES_SLOT, TLAS_SLOT, VERTICES_SLOT,
    WORKGROUP_HEIGHT, WORKGROUP_WIDTH,
};
use crate::vulkan::acceleration_structure::{
    BottomLevelStructure, BuildFlags, GeometryDescriptor, Instance, TopLevelStructure,
};
use crate::vulkan::buffer::{Buffer, StagedUploads};
use crate::vulkan::command_buffer::CommandEngine;
use crate::vulkan::context::Context;
use crate::vulkan::descriptor_set::BindingTable;
use crate::vulkan::dispatch;
use crate::vulkan::pipeline::{self, ComputePipeline};

/// Loads the scene, renders it once, writes the image.
pub fn bake(config: &Config) -> anyhow::Result<()> {
    let mesh = loader::load_mesh(&config.scene_path)
        .with_context(|| format!("loading scene {}", config.scene_path))?;
    info!(
        "loaded {}: {} vertices, {} triangles",
        config.scene_path,
        mesh.vertex_count(),
        mesh.triangle_count()
    );

    let pixels = render_mesh(config, &mesh)?;

    output::write_hdr(
        &config.output_path,
        config.render_width,
        config.render_height,
        &pixels,
    )
    .context("writing image")?;
    info!(
        "wrote {} ({}x{})",
        config.output_path, config.render_width, config.render_height
    );
    Ok(())
}

/// The one-shot pipeline: upload, build bottom- and top-level structures,
/// bind, dispatch, read back. Everything below is strictly sequential; the
/// declaration order of the locals gives the reverse-dependency teardown
/// (binding table before structures before buffers before the device).
pub fn render_mesh(config: &Config, mesh: &LoadedMesh) -> anyhow::Result<Vec<f32>> {
    let (width, height) = (config.render_width, config.render_height);

    let context = Arc::new(Context::new().context("initializing device")?);
    let mut engine = CommandEngine::new(context.clone()).context("initializing device")?;

    let output_buffer: Buffer<f32> = Buffer::new(
        context.clone(),
        shader_interface::output_len(width, height),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_CACHED
            | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
    .context("allocating image buffer")?;

    let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

    let mut uploads = StagedUploads::new();
    let (vertex_buffer, index_buffer) = {
        let mut ctx = engine.begin_one_shot().context("uploading geometry")?;
        let vertex_buffer = uploads
            .upload(&mut ctx, &mesh.positions, geometry_usage)
            .context("uploading geometry")?;
        let index_buffer = uploads
            .upload(&mut ctx, &mesh.indices, geometry_usage)
            .context("uploading geometry")?;
        let uploads_complete = ctx.submit_and_wait().context("uploading geometry")?;
        uploads.finish(&uploads_complete);
        (vertex_buffer, index_buffer)
    };
    debug!(
        "geometry resident: {} + {} bytes",
        vertex_buffer.byte_size(),
        index_buffer.byte_size()
    );

    let build_flags = BuildFlags {
        prefer_fast_trace: config.prefer_fast_trace,
        allow_compaction: config.allow_compaction,
    };

    let geometry = GeometryDescriptor {
        vertices: &vertex_buffer,
        vertex_count: mesh.vertex_count(),
        vertex_stride: (3 * std::mem::size_of::<f32>()) as vk::DeviceSize,
        vertex_format: vk::Format::R32G32B32_SFLOAT,
        indices: &index_buffer,
        index_type: vk::IndexType::UINT32,
        triangle_count: mesh.triangle_count(),
        transform: None,
    };

    let bottom_levels = vec![BottomLevelStructure::build(
        &mut engine,
        std::slice::from_ref(&geometry),
        build_flags,
    )
    .context("building bottom-level structure")?];
    info!("bottom-level structure built");

    let instances = [Instance {
        blas_index: 0,
        transform: Mat4::identity(),
        custom_index: 0,
        mask: 0xff,
        shader_offset: 0,
        flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
    }];
    let tlas = TopLevelStructure::build(&mut engine, &bottom_levels, &instances, build_flags)
        .context("building top-level structure")?;
    info!("top-level structure built");

    let mut table = BindingTable::new(context.clone(), shader_interface::binding_layout())
        .context("creating binding table")?;
    table.bind_storage_buffer(IMAGE_DATA_SLOT, &output_buffer)?;
    table.bind_acceleration_structure(TLAS_SLOT, &tlas)?;
    table.bind_storage_buffer(VERTICES_SLOT, &vertex_buffer)?;
    table.bind_storage_buffer(INDICES_SLOT, &index_buffer)?;
    table.commit();

    let code = pipeline::load_program(&config.shader_search_paths, &config.program)
        .context("loading compute program")?;
    let compute_pipeline = ComputePipeline::new(context.clone(), &code, table.set_layout())
        .context("creating compute pipeline")?;

    let (groups_x, groups_y) =
        dispatch::compute_grid(width, height, WORKGROUP_WIDTH, WORKGROUP_HEIGHT);
    let push_constants = PushConstants {
        sample_batch: config.sample_batch,
        render_width: width,
        render_height: height,
    };
    {
        let mut ctx = engine.begin_one_shot().context("dispatching trace")?;
        dispatch::record_trace_dispatch(
            &mut ctx,
            &compute_pipeline,
            &table,
            &push_constants,
            (groups_x, groups_y, 1),
        );
        ctx.submit_and_wait().context("dispatching trace")?;
    }
    info!("trace dispatched over a {groups_x}x{groups_y} grid");

    let pixels = {
        let mapped = output_buffer.map().context("reading back image")?;
        mapped.to_vec()
    };

    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn triangle() -> LoadedMesh {
        LoadedMesh {
            positions: vec![0.0, 1.0, 0.0, -1.0, -1.0, 0.0, 1.0, -1.0, 0.0],
            indices: vec![0, 1, 2],
        }
    }

    fn tile_sized_config() -> Config {
        Config {
            render_width: 16,
            render_height: 8,
            shader_search_paths: vec![PathBuf::from("shaders")],
            ..Config::default()
        }
    }

    #[test]
    #[ignore = "needs a ray-query capable Vulkan device and a compiled raytrace.comp.spv"]
    fn single_triangle_trace_is_finite_and_deterministic() {
        let mesh = triangle();
        let config = tile_sized_config();

        let first = render_mesh(&config, &mesh).unwrap();
        let second = render_mesh(&config, &mesh).unwrap();

        assert_eq!(first.len(), shader_interface::output_len(16, 8));
        assert!(first[..3].iter().all(|value| value.is_finite()));
        assert_eq!(first, second);
    }

    #[test]
    #[ignore = "needs a ray-query capable Vulkan device"]
    fn top_level_structure_keeps_referenced_bottom_levels_alive() {
        let mesh = triangle();
        let context = Arc::new(Context::new().unwrap());
        let mut engine = CommandEngine::new(context.clone()).unwrap();

        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let mut uploads = StagedUploads::new();
        let (vertex_buffer, index_buffer) = {
            let mut ctx = engine.begin_one_shot().unwrap();
            let vertices = uploads
                .upload(&mut ctx, &mesh.positions, geometry_usage)
                .unwrap();
            let indices = uploads
                .upload(&mut ctx, &mesh.indices, geometry_usage)
                .unwrap();
            let done = ctx.submit_and_wait().unwrap();
            uploads.finish(&done);
            (vertices, indices)
        };

        let geometry = GeometryDescriptor {
            vertices: &vertex_buffer,
            vertex_count: mesh.vertex_count(),
            vertex_stride: (3 * std::mem::size_of::<f32>()) as vk::DeviceSize,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            indices: &index_buffer,
            index_type: vk::IndexType::UINT32,
            triangle_count: mesh.triangle_count(),
            transform: None,
        };
        let bottom_levels = vec![BottomLevelStructure::build(
            &mut engine,
            std::slice::from_ref(&geometry),
            BuildFlags::default(),
        )
        .unwrap()];

        let instances = [Instance {
            blas_index: 0,
            transform: Mat4::identity(),
            custom_index: 0,
            mask: 0xff,
            shader_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }];
        let tlas =
            TopLevelStructure::build(&mut engine, &bottom_levels, &instances, BuildFlags::default())
                .unwrap();

        // Dropping the caller's handle must not destroy the structure while
        // the top-level structure still references it.
        let liveness = Arc::downgrade(&bottom_levels[0]);
        drop(bottom_levels);
        assert!(liveness.upgrade().is_some());

        drop(tlas);
        assert!(liveness.upgrade().is_none());
    }
}
