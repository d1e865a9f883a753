//! Vulkan instance creation and validation-layer reporting.

use std::ffi::{c_void, CStr, CString};

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::capabilities::{extension_names, layer_names, negotiate};
use crate::error::{CapabilityKind, GpuError, Result};

/// Validation layers enabled when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance extensions required on top of the platform's surface extensions.
pub fn required_instance_extensions(enable_validation: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);
    extensions
}

/// Owned Vulkan entry and instance. Destroys the instance on drop.
pub struct Instance {
    entry: ash::Entry,
    instance: ash::Instance,
    validation: bool,
}

impl Instance {
    /// Load Vulkan and create an instance targeting Vulkan 1.3.
    ///
    /// Layers and extensions are negotiated before creation. Any unsupported
    /// requirement fails with `CapabilityUnsupported`.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        platform_extensions: &[&CStr],
    ) -> Result<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let layers = if enable_validation {
            validation_layers()
        } else {
            Vec::new()
        };
        // SAFETY: the entry was just loaded.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        negotiate(
            CapabilityKind::InstanceLayer,
            &layers,
            &layer_names(&available_layers),
        )
        .into_result()?;

        let mut extensions = platform_extensions.to_vec();
        for ext in required_instance_extensions(enable_validation) {
            if !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }
        // SAFETY: the entry was just loaded.
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };
        negotiate(
            CapabilityKind::InstanceExtension,
            &extensions,
            &extension_names(&available_extensions),
        )
        .into_result()?;

        let app_name = CString::new(app_name)
            .map_err(|_| GpuError::InvalidArgument("app name contains a NUL byte".into()))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Kestrel")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let layer_ptrs: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();
        let extension_ptrs: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|e| e.as_ptr()).collect();

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs)
            .flags(create_flags);

        // SAFETY: every pointer in create_info outlives this call.
        let instance = unsafe { entry.create_instance(&create_info, None)? };
        info!(
            "Vulkan instance created ({} layers, {} extensions)",
            layers.len(),
            extensions.len()
        );

        Ok(Self {
            entry,
            instance,
            validation: enable_validation,
        })
    }

    pub const fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub const fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub const fn validation_enabled(&self) -> bool {
        self.validation
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        debug!("Destroying Vulkan instance");
        // SAFETY: every child object is owned by a struct that is dropped first.
        unsafe { self.instance.destroy_instance(None) };
    }
}

/// Routes validation-layer messages into `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(instance: &Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(instance.entry(), instance.raw());

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::DEVICE_ADDRESS_BINDING,
            )
            .pfn_user_callback(Some(debug_callback));

        // SAFETY: the debug utils extension was negotiated with the instance.
        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };
        debug!("Debug messenger created");

        Ok(Self { loader, messenger })
    }
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        debug!("Destroying debug messenger");
        // SAFETY: the owning instance is dropped after this messenger.
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

fn message_type_tag(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::DEVICE_ADDRESS_BINDING) {
        "address binding"
    } else {
        "general"
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the driver passes either null or a valid callback struct whose
    // message is a NUL-terminated string.
    let message = unsafe {
        callback_data
            .as_ref()
            .filter(|data| !data.p_message.is_null())
            .map_or_else(
                || "(no message)".into(),
                |data| CStr::from_ptr(data.p_message).to_string_lossy(),
            )
    };
    let tag = message_type_tag(message_type);

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan {tag}] {message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan {tag}] {message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!("[vulkan {tag}] {message}");
    } else {
        debug!("[vulkan {tag}] {message}");
    }

    vk::FALSE
}
