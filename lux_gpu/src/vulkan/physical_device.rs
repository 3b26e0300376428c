use super::VulkanInstance;
use ash::{extensions::khr, vk};
use std::{ffi::CStr, fmt, sync::Arc};

pub struct PhysicalDevice {
    instance: Arc<VulkanInstance>,
    raw: vk::PhysicalDevice,
    name: String,
}

impl PhysicalDevice {
    pub unsafe fn from_raw(raw: vk::PhysicalDevice, instance: Arc<VulkanInstance>) -> PhysicalDevice {
        let props = instance.raw().get_physical_device_properties(raw);
        let name = CStr::from_ptr(props.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        PhysicalDevice {
            instance,
            raw,
            name,
        }
    }

    /// Device extensions needed for acceleration structures and ray tracing
    /// pipelines.
    pub fn required_extensions() -> [&'static CStr; 3] {
        [
            khr::AccelerationStructure::name(),
            khr::DeferredHostOperations::name(),
            khr::RayTracingPipeline::name(),
        ]
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the first queue family that can run compute work, which
    /// includes ray tracing and acceleration structure builds.
    pub fn compute_queue_family(&self) -> Option<u32> {
        unsafe {
            self.instance
                .raw()
                .get_physical_device_queue_family_properties(self.raw)
        }
        .into_iter()
        .position(|properties| properties.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|index| index as u32)
    }

    pub fn supports_extensions(&self, names: &[&CStr]) -> bool {
        let available = match unsafe {
            self.instance
                .raw()
                .enumerate_device_extension_properties(self.raw)
        } {
            Ok(available) => available,
            Err(err) => {
                log::warn!("Could not list extensions of {}: {}", self.name, err);
                return false;
            }
        };

        names.iter().all(|name| {
            available.iter().any(|properties| unsafe {
                CStr::from_ptr(properties.extension_name.as_ptr()) == *name
            })
        })
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.compute_queue_family().is_some()
            && self.supports_extensions(&Self::required_extensions())
    }

    pub fn ray_tracing_pipeline_properties(
        &self,
    ) -> vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut props = vk::PhysicalDeviceProperties2::builder().push_next(&mut rt_props);

        unsafe {
            self.instance
                .raw()
                .get_physical_device_properties2(self.raw, &mut props)
        }

        rt_props
    }

    pub fn acceleration_structure_properties(
        &self,
    ) -> vk::PhysicalDeviceAccelerationStructurePropertiesKHR {
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props = vk::PhysicalDeviceProperties2::builder().push_next(&mut accel_props);

        unsafe {
            self.instance
                .raw()
                .get_physical_device_properties2(self.raw, &mut props)
        }

        accel_props
    }

    pub unsafe fn raw(&self) -> vk::PhysicalDevice {
        self.raw
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }
}

impl fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalDevice({})", self.name)
    }
}
