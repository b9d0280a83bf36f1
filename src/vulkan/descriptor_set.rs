use std::sync::Arc;

use ash::vk;

use crate::error::RenderError;
use crate::vulkan::acceleration_structure::TopLevelStructure;
use crate::vulkan::buffer::Buffer;
use crate::vulkan::context::Context;

/// Resource kinds a binding slot can carry. The declared kind must match the
/// bound resource or the bind is rejected.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotKind {
    StorageBuffer,
    UniformBuffer,
    AccelerationStructure,
}

impl SlotKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            SlotKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            SlotKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            SlotKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SlotDeclaration {
    pub index: u32,
    pub kind: SlotKind,
    pub count: u32,
}

/// Slot declarations under construction. `finalize` locks the set; no slot
/// can be added afterwards and duplicates are a programmer error.
#[derive(Default)]
pub struct BindingSchema {
    slots: Vec<SlotDeclaration>,
}

impl BindingSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_slot(&mut self, index: u32, kind: SlotKind, count: u32) -> &mut Self {
        self.slots.push(SlotDeclaration { index, kind, count });
        self
    }

    pub fn finalize(mut self) -> BindingLayout {
        self.slots.sort_by_key(|slot| slot.index);
        for pair in self.slots.windows(2) {
            assert!(
                pair[0].index != pair[1].index,
                "slot {} declared twice",
                pair[0].index
            );
        }
        BindingLayout { slots: self.slots }
    }
}

/// The locked slot table. Purely descriptive: the same value drives the
/// descriptor set layout and the bind-time kind checks, so the compute
/// program's expectation and the binding table cannot drift apart.
pub struct BindingLayout {
    slots: Vec<SlotDeclaration>,
}

impl BindingLayout {
    pub fn slots(&self) -> &[SlotDeclaration] {
        &self.slots
    }

    pub fn check(&self, slot: u32, bound: SlotKind) -> Result<(), RenderError> {
        let declared = self
            .slots
            .iter()
            .find(|declaration| declaration.index == slot)
            .map(|declaration| declaration.kind);
        if declared == Some(bound) {
            Ok(())
        } else {
            Err(RenderError::SlotKindMismatch {
                slot,
                declared,
                bound,
            })
        }
    }

    fn vk_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        self.slots
            .iter()
            .map(|slot| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(slot.index)
                    .descriptor_type(slot.kind.descriptor_type())
                    .descriptor_count(slot.count)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect()
    }

    fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.slots
            .iter()
            .map(|slot| vk::DescriptorPoolSize {
                ty: slot.kind.descriptor_type(),
                descriptor_count: slot.count,
            })
            .collect()
    }
}

enum PendingBind {
    Buffer {
        slot: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
    AccelerationStructure {
        slot: u32,
        structure: vk::AccelerationStructureKHR,
    },
}

/// The device-side binding table: one descriptor set whose layout is derived
/// from a `BindingLayout`. Binds are staged and become visible to dispatches
/// only on `commit`, all at once.
pub struct BindingTable {
    context: Arc<Context>,
    layout: BindingLayout,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    pending: Vec<PendingBind>,
}

impl BindingTable {
    pub fn new(context: Arc<Context>, layout: BindingLayout) -> Result<Self, RenderError> {
        let device = &context.device;

        let bindings = layout.vk_bindings();
        let set_layout = {
            let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            unsafe { device.create_descriptor_set_layout(&create_info, None) }?
        };

        let pool_sizes = layout.pool_sizes();
        let pool = {
            let create_info = vk::DescriptorPoolCreateInfo::builder()
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            match unsafe { device.create_descriptor_pool(&create_info, None) } {
                Ok(pool) => pool,
                Err(err) => {
                    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                    return Err(err.into());
                }
            }
        };

        let set = {
            let allocate_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(std::slice::from_ref(&set_layout));
            match unsafe { device.allocate_descriptor_sets(&allocate_info) } {
                Ok(sets) => sets[0],
                Err(err) => {
                    unsafe { device.destroy_descriptor_pool(pool, None) };
                    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                    return Err(err.into());
                }
            }
        };

        Ok(Self {
            context,
            layout,
            set_layout,
            pool,
            set,
            pending: Vec::new(),
        })
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Stages a storage-buffer bind covering the buffer's exact logical
    /// byte range.
    pub fn bind_storage_buffer<T>(
        &mut self,
        slot: u32,
        buffer: &Buffer<T>,
    ) -> Result<(), RenderError> {
        self.layout.check(slot, SlotKind::StorageBuffer)?;
        self.pending.push(PendingBind::Buffer {
            slot,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            buffer: buffer.get_vk_buffer(),
            range: buffer.byte_size(),
        });
        Ok(())
    }

    pub fn bind_acceleration_structure(
        &mut self,
        slot: u32,
        structure: &TopLevelStructure,
    ) -> Result<(), RenderError> {
        self.layout.check(slot, SlotKind::AccelerationStructure)?;
        self.pending.push(PendingBind::AccelerationStructure {
            slot,
            structure: structure.raw(),
        });
        Ok(())
    }

    /// Applies every staged bind in a single descriptor update; partial
    /// commits are never observable.
    pub fn commit(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let mut buffer_infos = Vec::new();
        let mut structure_handles = Vec::new();
        for bind in &self.pending {
            match bind {
                PendingBind::Buffer { buffer, range, .. } => buffer_infos.push(
                    vk::DescriptorBufferInfo::builder()
                        .buffer(*buffer)
                        .offset(0)
                        .range(*range)
                        .build(),
                ),
                PendingBind::AccelerationStructure { structure, .. } => {
                    structure_handles.push(*structure)
                }
            }
        }

        let mut structure_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> =
            structure_handles
                .iter()
                .map(|handle| {
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(std::slice::from_ref(handle))
                        .build()
                })
                .collect();

        let mut writes = Vec::with_capacity(self.pending.len());
        let mut next_buffer = 0;
        let mut next_structure = 0;
        for bind in &self.pending {
            match bind {
                PendingBind::Buffer {
                    slot,
                    descriptor_type,
                    ..
                } => {
                    writes.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(self.set)
                            .dst_binding(*slot)
                            .descriptor_type(*descriptor_type)
                            .buffer_info(std::slice::from_ref(&buffer_infos[next_buffer]))
                            .build(),
                    );
                    next_buffer += 1;
                }
                PendingBind::AccelerationStructure { slot, .. } => {
                    let mut write = vk::WriteDescriptorSet::builder()
                        .dst_set(self.set)
                        .dst_binding(*slot)
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                        .push_next(&mut structure_infos[next_structure])
                        .build();
                    write.descriptor_count = 1;
                    writes.push(write);
                    next_structure += 1;
                }
            }
        }

        unsafe { self.context.device.update_descriptor_sets(&writes, &[]) };
        self.pending.clear();
    }
}

impl Drop for BindingTable {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
        unsafe { device.destroy_descriptor_set_layout(self.set_layout, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BindingLayout {
        let mut schema = BindingSchema::new();
        schema
            .declare_slot(0, SlotKind::StorageBuffer, 1)
            .declare_slot(1, SlotKind::AccelerationStructure, 1)
            .declare_slot(2, SlotKind::StorageBuffer, 1);
        schema.finalize()
    }

    #[test]
    fn matching_kind_passes() {
        let layout = layout();
        assert!(layout.check(0, SlotKind::StorageBuffer).is_ok());
        assert!(layout.check(1, SlotKind::AccelerationStructure).is_ok());
    }

    #[test]
    fn mismatched_kind_is_rejected() {
        let layout = layout();
        let err = layout.check(1, SlotKind::StorageBuffer).unwrap_err();
        match err {
            RenderError::SlotKindMismatch {
                slot,
                declared,
                bound,
            } => {
                assert_eq!(slot, 1);
                assert_eq!(declared, Some(SlotKind::AccelerationStructure));
                assert_eq!(bound, SlotKind::StorageBuffer);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn undeclared_slot_is_rejected() {
        let layout = layout();
        let err = layout.check(7, SlotKind::StorageBuffer).unwrap_err();
        assert!(matches!(
            err,
            RenderError::SlotKindMismatch { declared: None, .. }
        ));
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_slot_declaration_panics() {
        let mut schema = BindingSchema::new();
        schema
            .declare_slot(0, SlotKind::StorageBuffer, 1)
            .declare_slot(0, SlotKind::UniformBuffer, 1);
        schema.finalize();
    }

    #[test]
    fn slots_are_sorted_after_finalize() {
        let mut schema = BindingSchema::new();
        schema
            .declare_slot(3, SlotKind::StorageBuffer, 1)
            .declare_slot(0, SlotKind::StorageBuffer, 1);
        let layout = schema.finalize();
        let indices: Vec<u32> = layout.slots().iter().map(|slot| slot.index).collect();
        assert_eq!(indices, [0, 3]);
    }
}
