use crate::Result;
use ash::{extensions::ext, vk};
use log::Level;
use std::{borrow::Cow, ffi::CStr, os::raw::c_void};

/// Log target for validation layer output, so it can be filtered apart from
/// the rest of the crate with `RUST_LOG=lux_gpu::validation=warn`.
pub const TARGET: &str = "lux_gpu::validation";

fn level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Level::Debug
    } else {
        Level::Trace
    }
}

fn kind(types: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

unsafe fn text<'a>(ptr: *const std::os::raw::c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(ptr).to_string_lossy()
    }
}

unsafe extern "system" fn validation_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    let level = level(severity);
    if callback_data.is_null() || !log::log_enabled!(target: TARGET, level) {
        return vk::FALSE;
    }

    let data = &*callback_data;
    log::log!(
        target: TARGET,
        level,
        "[{}] {}: {}",
        kind(types),
        text(data.p_message_id_name),
        text(data.p_message)
    );

    vk::FALSE
}

/// Routes validation layer output into `log` under [`TARGET`].
pub struct DebugMessenger {
    ext: ext::DebugUtils,
    raw: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let ext = ext::DebugUtils::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(validation_callback));

        let raw = unsafe { ext.create_debug_utils_messenger(&create_info, None) }?;

        Ok(Self { ext, raw })
    }
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        unsafe { self.ext.destroy_debug_utils_messenger(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_levels() {
        assert_eq!(
            level(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR),
            Level::Error
        );
        assert_eq!(
            level(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING),
            Level::Warn
        );
        // Layer chatter stays out of the default info output
        assert_eq!(
            level(vk::DebugUtilsMessageSeverityFlagsEXT::INFO),
            Level::Debug
        );
        assert_eq!(
            level(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE),
            Level::Trace
        );
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(
            kind(
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            ),
            "validation"
        );
        assert_eq!(kind(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL), "general");
        assert_eq!(unsafe { text(std::ptr::null()) }, "");
    }
}
