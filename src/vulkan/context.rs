use std::ffi::CStr;

use ash::{
    extensions::khr::{
        AccelerationStructure, BufferDeviceAddress, DeferredHostOperations, Synchronization2,
    },
    vk::{self, ApplicationInfo, DeviceCreateInfo, DeviceQueueCreateInfo, InstanceCreateInfo},
};

use crate::error::RenderError;

/// Owns the headless device state: one instance, one logical device, one
/// compute-capable queue. Passed explicitly (as `Arc<Context>`) to every
/// component so nothing captures device handles implicitly.
pub struct Context {
    _entry: ash::Entry,
    pub instance: ash::Instance,

    pub physical_device: vk::PhysicalDevice,
    pub queue_family_index: u32,

    pub device: ash::Device,
    pub queue: vk::Queue,

    pub acceleration_structure: AccelerationStructure,
    pub buffer_device_address: BufferDeviceAddress,
    pub synchronization2: Synchronization2,
    pub device_memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Context {
    pub fn new() -> Result<Self, RenderError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|_| RenderError::CapabilityMissing("Vulkan runtime"))?;

        let instance = {
            let app_info = ApplicationInfo::builder().api_version(vk::API_VERSION_1_3);
            let create_info = InstanceCreateInfo::builder().application_info(&app_info);
            unsafe { entry.create_instance(&create_info, None) }?
        };

        let (physical_device, queue_family_index) = find_physical_device(&instance)?;

        check_capabilities(&instance, physical_device)?;

        let device = create_logical_device(&instance, physical_device, queue_family_index)?;

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let acceleration_structure = AccelerationStructure::new(&instance, &device);
        let buffer_device_address = BufferDeviceAddress::new(&instance, &device);
        let synchronization2 = Synchronization2::new(&instance, &device);

        let device_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            _entry: entry,
            instance,

            physical_device,
            queue_family_index,

            device,
            queue,

            acceleration_structure,
            buffer_device_address,
            synchronization2,
            device_memory_properties,
        })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };

        unsafe { self.instance.destroy_instance(None) };
    }
}

fn find_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, u32), RenderError> {
    let required_extensions = [
        AccelerationStructure::name(),
        DeferredHostOperations::name(),
        vk::KhrRayQueryFn::name(),
    ];

    let physical_devices = unsafe { instance.enumerate_physical_devices() }?;

    physical_devices
        .into_iter()
        .filter(|pd| {
            let extension_properties =
                match unsafe { instance.enumerate_device_extension_properties(*pd) } {
                    Ok(properties) => properties,
                    Err(_) => return false,
                };
            let supported_extensions: Vec<_> = extension_properties
                .iter()
                .map(|property| {
                    unsafe { CStr::from_ptr(property.extension_name.as_ptr()) }.to_owned()
                })
                .collect();

            required_extensions.iter().all(|required| {
                supported_extensions
                    .iter()
                    .any(|ext| ext.as_c_str() == *required)
            })
        })
        .filter_map(|pd| {
            unsafe { instance.get_physical_device_queue_family_properties(pd) }
                .iter()
                .position(|info| info.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|index| (pd, index as u32))
        })
        .min_by_key(|(pd, _)| {
            let device_type = unsafe { instance.get_physical_device_properties(*pd) }.device_type;

            match device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                vk::PhysicalDeviceType::CPU => 3,
                vk::PhysicalDeviceType::OTHER => 4,
                _ => 5,
            }
        })
        .ok_or(RenderError::CapabilityMissing(
            "no device exposes acceleration structures and ray queries",
        ))
}

/// Aborts before any allocation if the device cannot run hardware ray queries.
fn check_capabilities(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(), RenderError> {
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default();

    let mut features2 = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_query_features)
        .build();

    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

    if acceleration_structure_features.acceleration_structure != vk::TRUE {
        return Err(RenderError::CapabilityMissing("accelerationStructure"));
    }
    if ray_query_features.ray_query != vk::TRUE {
        return Err(RenderError::CapabilityMissing("rayQuery"));
    }

    Ok(())
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<ash::Device, RenderError> {
    let device_extensions = [
        AccelerationStructure::name().as_ptr(),
        DeferredHostOperations::name().as_ptr(),
        vk::KhrRayQueryFn::name().as_ptr(),
        BufferDeviceAddress::name().as_ptr(),
        Synchronization2::name().as_ptr(),
    ];

    let queue_priorities = [1.0];
    let queue_create_info = DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);

    let mut physical_device_vulkan13_features = vk::PhysicalDeviceVulkan13Features {
        synchronization2: vk::TRUE,
        ..vk::PhysicalDeviceVulkan13Features::default()
    };

    let mut enabled_buffer_device_address_features =
        vk::PhysicalDeviceBufferDeviceAddressFeatures {
            buffer_device_address: vk::TRUE,
            ..vk::PhysicalDeviceBufferDeviceAddressFeatures::default()
        };

    let mut enabled_acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            ..vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        };

    let mut enabled_ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR {
        ray_query: vk::TRUE,
        ..vk::PhysicalDeviceRayQueryFeaturesKHR::default()
    };

    let create_info = DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&device_extensions)
        .push_next(&mut physical_device_vulkan13_features)
        .push_next(&mut enabled_buffer_device_address_features)
        .push_next(&mut enabled_acceleration_structure_features)
        .push_next(&mut enabled_ray_query_features)
        .build();

    Ok(unsafe { instance.create_device(physical_device, &create_info, None) }?)
}
