use std::sync::Arc;

use ash::vk;
use ultraviolet::Mat4;

use crate::error::RenderError;

use super::{
    buffer::Buffer,
    command_buffer::CommandEngine,
    context::Context,
};

/// Build-preference flags shared by bottom- and top-level builds.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildFlags {
    /// Bias the builder toward query throughput over build speed.
    pub prefer_fast_trace: bool,
    /// Shrink the structure to its true size with a second build round-trip.
    pub allow_compaction: bool,
}

impl BuildFlags {
    fn to_vk(self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::empty();
        if self.prefer_fast_trace {
            flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        }
        if self.allow_compaction {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        }
        flags
    }
}

/// Immutable description of one mesh's triangle data. The referenced buffers
/// are borrowed, not owned; they must stay alive until the build call
/// returns (which it only does once the device has finished).
pub struct GeometryDescriptor<'a> {
    pub vertices: &'a Buffer<f32>,
    pub vertex_count: u32,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub indices: &'a Buffer<u32>,
    pub index_type: vk::IndexType,
    pub triangle_count: u32,
    /// Per-geometry transform; `None` means identity.
    pub transform: Option<Mat4>,
}

/// One placement of a bottom-level structure in the scene.
pub struct Instance {
    pub blas_index: usize,
    pub transform: Mat4,
    /// Visible to the ray-query stage; truncated to the 24 bits the
    /// traversal hardware carries.
    pub custom_index: u32,
    pub mask: u8,
    pub shader_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

/// Device-resident structure handle plus its backing storage.
struct AccelerationStructure {
    inner: vk::AccelerationStructureKHR,
    context: Arc<Context>,
    _buffer: Buffer<u8>,
    device_address: vk::DeviceAddress,
}

impl AccelerationStructure {
    fn new(
        context: Arc<Context>,
        structure_type: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<Self, RenderError> {
        let buffer: Buffer<u8> = Buffer::new(
            context.clone(),
            size as usize,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.get_vk_buffer())
            .size(size)
            .ty(structure_type);

        let inner = unsafe {
            context
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)
        }?;

        let device_address = {
            let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                .acceleration_structure(inner);

            unsafe {
                context
                    .acceleration_structure
                    .get_acceleration_structure_device_address(&address_info)
            }
        };

        Ok(Self {
            inner,
            context,
            _buffer: buffer,
            device_address,
        })
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.context
                .acceleration_structure
                .destroy_acceleration_structure(self.inner, None);
        }
    }
}

/// Spatial index over one or more geometries' triangles. Immutable after the
/// build returns; shared via `Arc` so instances can pin it alive.
pub struct BottomLevelStructure {
    structure: AccelerationStructure,
}

impl BottomLevelStructure {
    /// Builds the structure and blocks until the device has finished. With
    /// `allow_compaction` set, the compacted-size query and the compact copy
    /// are two further submit/wait round-trips; the structure returned is
    /// already compacted.
    pub fn build(
        engine: &mut CommandEngine,
        geometries: &[GeometryDescriptor<'_>],
        flags: BuildFlags,
    ) -> Result<Arc<Self>, RenderError> {
        assert!(!geometries.is_empty(), "a BLAS needs at least one geometry");
        let context = engine.context().clone();

        // Per-geometry transforms ride in a host-visible buffer addressed by
        // the build; identity geometries pass a null address.
        let transform_buffers: Vec<Option<Buffer<vk::TransformMatrixKHR>>> = geometries
            .iter()
            .map(|geometry| {
                geometry
                    .transform
                    .map(|transform| {
                        let buffer: Buffer<vk::TransformMatrixKHR> = Buffer::new(
                            context.clone(),
                            1,
                            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                            vk::MemoryPropertyFlags::HOST_VISIBLE
                                | vk::MemoryPropertyFlags::HOST_COHERENT,
                        )?;
                        buffer.copy_data(&[vk::TransformMatrixKHR {
                            matrix: transform_rows(&transform),
                        }])?;
                        Ok(buffer)
                    })
                    .transpose()
            })
            .collect::<Result<_, RenderError>>()?;

        let vk_geometries: Vec<vk::AccelerationStructureGeometryKHR> = geometries
            .iter()
            .zip(&transform_buffers)
            .map(|(geometry, transform_buffer)| {
                let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(geometry.vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: geometry.vertices.get_device_address(),
                    })
                    .vertex_stride(geometry.vertex_stride)
                    .max_vertex(geometry.vertex_count.saturating_sub(1))
                    .index_type(geometry.index_type)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: geometry.indices.get_device_address(),
                    });
                if let Some(buffer) = transform_buffer {
                    triangles = triangles.transform_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: buffer.get_device_address(),
                    });
                }

                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        triangles: triangles.build(),
                    })
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .build()
            })
            .collect();

        let primitive_counts: Vec<u32> =
            geometries.iter().map(|geometry| geometry.triangle_count).collect();
        let range_infos: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = primitive_counts
            .iter()
            .map(|count| {
                vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(*count)
                    .build()
            })
            .collect();

        let structure = build_structure(
            engine,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &vk_geometries,
            &primitive_counts,
            &range_infos,
            flags,
        )?;

        let structure = if flags.allow_compaction {
            compact(engine, structure, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)?
        } else {
            structure
        };

        Ok(Arc::new(Self { structure }))
    }

    pub(crate) fn device_address(&self) -> vk::DeviceAddress {
        self.structure.device_address
    }
}

/// The single entry point for all ray queries. Holds an `Arc` to every
/// referenced bottom-level structure, so none of them can be destroyed
/// while this structure is live.
pub struct TopLevelStructure {
    structure: AccelerationStructure,
    _bottom_levels: Vec<Arc<BottomLevelStructure>>,
}

impl TopLevelStructure {
    /// Validates every instance reference, packs the instance records, and
    /// builds the structure, blocking until the device has finished.
    /// A `BottomLevelStructure` only exists once its build completed, so
    /// build order is bottom-before-top by construction.
    pub fn build(
        engine: &mut CommandEngine,
        bottom_levels: &[Arc<BottomLevelStructure>],
        instances: &[Instance],
        flags: BuildFlags,
    ) -> Result<Self, RenderError> {
        validate_instances(instances, bottom_levels.len())?;
        // Compaction is a bottom-level concern; the top level is built once
        // at its queried size.
        let flags = BuildFlags {
            allow_compaction: false,
            ..flags
        };
        let context = engine.context().clone();

        let records: Vec<vk::AccelerationStructureInstanceKHR> = instances
            .iter()
            .map(|instance| vk::AccelerationStructureInstanceKHR {
                transform: vk::TransformMatrixKHR {
                    matrix: transform_rows(&instance.transform),
                },
                instance_custom_index_and_mask: vk::Packed24_8::new(
                    instance.custom_index,
                    instance.mask,
                ),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    instance.shader_offset,
                    instance.flags.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: bottom_levels[instance.blas_index].device_address(),
                },
            })
            .collect();

        let instance_buffer: Buffer<vk::AccelerationStructureInstanceKHR> = Buffer::new(
            context.clone(),
            records.len(),
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        instance_buffer.copy_data(&records)?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.get_device_address(),
            });

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data.build(),
            })
            .build();

        let primitive_counts = [records.len() as u32];
        let range_infos = [vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(records.len() as u32)
            .build()];

        let structure = build_structure(
            engine,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            std::slice::from_ref(&geometry),
            &primitive_counts,
            &range_infos,
            flags,
        )?;

        Ok(Self {
            structure,
            _bottom_levels: bottom_levels.to_vec(),
        })
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.structure.inner
    }
}

/// Size query, storage and scratch allocation, one recorded build, one
/// blocking submit.
fn build_structure(
    engine: &mut CommandEngine,
    structure_type: vk::AccelerationStructureTypeKHR,
    geometries: &[vk::AccelerationStructureGeometryKHR],
    primitive_counts: &[u32],
    range_infos: &[vk::AccelerationStructureBuildRangeInfoKHR],
    flags: BuildFlags,
) -> Result<AccelerationStructure, RenderError> {
    let context = engine.context().clone();

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(structure_type)
        .flags(flags.to_vk())
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
        .build();

    let size_info = unsafe {
        context
            .acceleration_structure
            .get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                primitive_counts,
            )
    };

    let structure = AccelerationStructure::new(
        context.clone(),
        structure_type,
        size_info.acceleration_structure_size,
    )?;

    let scratch_buffer: Buffer<u8> = Buffer::new(
        context.clone(),
        size_info.build_scratch_size as usize,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS | vk::BufferUsageFlags::STORAGE_BUFFER,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    build_info.dst_acceleration_structure = structure.inner;
    build_info.scratch_data = vk::DeviceOrHostAddressKHR {
        device_address: scratch_buffer.get_device_address(),
    };

    let ctx = engine.begin_one_shot()?;
    unsafe {
        context.acceleration_structure.cmd_build_acceleration_structures(
            ctx.raw(),
            std::slice::from_ref(&build_info),
            &[range_infos],
        )
    };
    ctx.submit_and_wait()?;

    Ok(structure)
}

/// Queries the true size of a built structure and copies it into a smaller
/// allocation. The oversized original is destroyed on return.
fn compact(
    engine: &mut CommandEngine,
    structure: AccelerationStructure,
    structure_type: vk::AccelerationStructureTypeKHR,
) -> Result<AccelerationStructure, RenderError> {
    let context = engine.context().clone();
    let device = &context.device;

    let query_pool = {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(1);
        unsafe { device.create_query_pool(&create_info, None) }?
    };

    let result: Result<AccelerationStructure, RenderError> = (|| {
        let ctx = engine.begin_one_shot()?;
        unsafe {
            device.cmd_reset_query_pool(ctx.raw(), query_pool, 0, 1);
            context
                .acceleration_structure
                .cmd_write_acceleration_structures_properties(
                    ctx.raw(),
                    std::slice::from_ref(&structure.inner),
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_pool,
                    0,
                );
        }
        ctx.submit_and_wait()?;

        let mut compacted_size = [vk::DeviceSize::default()];
        unsafe {
            device.get_query_pool_results(
                query_pool,
                0,
                1,
                &mut compacted_size,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }?;

        let compacted =
            AccelerationStructure::new(context.clone(), structure_type, compacted_size[0])?;

        let copy_info = vk::CopyAccelerationStructureInfoKHR::builder()
            .src(structure.inner)
            .dst(compacted.inner)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);

        let ctx = engine.begin_one_shot()?;
        unsafe {
            context
                .acceleration_structure
                .cmd_copy_acceleration_structure(ctx.raw(), &copy_info)
        };
        ctx.submit_and_wait()?;

        Ok(compacted)
    })();

    unsafe { device.destroy_query_pool(query_pool, None) };
    result
}

fn validate_instances(instances: &[Instance], blas_count: usize) -> Result<(), RenderError> {
    for (index, instance) in instances.iter().enumerate() {
        if instance.blas_index >= blas_count {
            return Err(RenderError::DanglingInstanceReference {
                instance: index,
                blas_index: instance.blas_index,
                blas_count,
            });
        }
        debug_assert!(
            instance.custom_index <= 0x00ff_ffff,
            "instance custom index exceeds the 24 bits visible to ray queries"
        );
    }
    Ok(())
}

/// Row-major 3x4 matrix rows as the device consumes them; ultraviolet
/// matrices are column-major.
fn transform_rows(transform: &Mat4) -> [f32; 12] {
    let m = &transform.cols;
    [
        m[0].x, m[1].x, m[2].x, m[3].x, //
        m[0].y, m[1].y, m[2].y, m[3].y, //
        m[0].z, m[1].z, m[2].z, m[3].z,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ultraviolet::Vec3;

    fn instance(blas_index: usize) -> Instance {
        Instance {
            blas_index,
            transform: Mat4::identity(),
            custom_index: 0,
            mask: 0xff,
            shader_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    #[test]
    fn instances_referencing_built_structures_pass() {
        let instances = [instance(0), instance(2), instance(1)];
        assert!(validate_instances(&instances, 3).is_ok());
    }

    #[test]
    fn out_of_range_reference_is_dangling() {
        let instances = [instance(0), instance(3)];
        let err = validate_instances(&instances, 3).unwrap_err();
        match err {
            RenderError::DanglingInstanceReference {
                instance,
                blas_index,
                blas_count,
            } => {
                assert_eq!(instance, 1);
                assert_eq!(blas_index, 3);
                assert_eq!(blas_count, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_instance_list_is_valid() {
        assert!(validate_instances(&[], 0).is_ok());
    }

    #[test]
    fn identity_transform_rows() {
        let rows = transform_rows(&Mat4::identity());
        assert_eq!(
            rows,
            [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ]
        );
    }

    #[test]
    fn translation_lands_in_the_fourth_column() {
        let rows = transform_rows(&Mat4::from_translation(Vec3::new(-1.5, 1.0, 0.5)));
        assert_eq!(rows[3], -1.5);
        assert_eq!(rows[7], 1.0);
        assert_eq!(rows[11], 0.5);
    }
}
