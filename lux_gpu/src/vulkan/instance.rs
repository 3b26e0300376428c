use super::{debug::DebugMessenger, PhysicalDevice};
use crate::{Error, Result};
use ash::{extensions::ext, vk};
use log::info;
use std::{ffi::CStr, os::raw::c_char, sync::Arc};

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

pub struct VulkanInstance {
    entry: ash::Entry,
    raw: ash::Instance,
    debug: Option<DebugMessenger>,
}

impl VulkanInstance {
    pub fn new(validation: bool) -> Result<Arc<VulkanInstance>> {
        let entry = unsafe { ash::Entry::load() }.map_err(|err| Error::Loading(err.to_string()))?;
        let raw = Self::create_instance(&entry, validation)?;
        let debug = if validation {
            Some(DebugMessenger::new(&entry, &raw)?)
        } else {
            None
        };

        Ok(Arc::new(VulkanInstance { entry, raw, debug }))
    }

    fn create_instance(entry: &ash::Entry, validation: bool) -> Result<ash::Instance> {
        let app_info = vk::ApplicationInfo::builder().api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<&CStr> = vec![];
        let mut layers: Vec<*const c_char> = vec![];
        if validation {
            extensions.push(ext::DebugUtils::name());
            extensions.push(vk::ExtValidationFeaturesFn::name());
            layers.push(VALIDATION_LAYER.as_ptr() as *const c_char);
        }
        info!("Requested instance extensions: {:?}", extensions);
        info!("Validation: {}", validation);

        let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();
        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layers);

        let enable = [
            vk::ValidationFeatureEnableEXT::GPU_ASSISTED,
            vk::ValidationFeatureEnableEXT::GPU_ASSISTED_RESERVE_BINDING_SLOT,
            vk::ValidationFeatureEnableEXT::BEST_PRACTICES,
            vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
        ];
        let mut features_validation =
            vk::ValidationFeaturesEXT::builder().enabled_validation_features(&enable);
        if validation {
            create_info = create_info.push_next(&mut features_validation);
        }

        Ok(unsafe { entry.create_instance(&create_info, None) }?)
    }

    pub unsafe fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub unsafe fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn physical_devices(self: &Arc<VulkanInstance>) -> Result<Vec<PhysicalDevice>> {
        let raw_devices = unsafe { self.raw.enumerate_physical_devices() }?;

        Ok(raw_devices
            .into_iter()
            .map(|physical_device: vk::PhysicalDevice| unsafe {
                PhysicalDevice::from_raw(physical_device, self.clone())
            })
            .collect())
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        // The messenger belongs to the instance
        self.debug.take();
        unsafe { self.raw.destroy_instance(None) };
    }
}
