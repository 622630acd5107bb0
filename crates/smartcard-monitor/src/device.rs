//! Device-attach classification.

use tracing::debug;

/// USB interface class for CCID smartcard readers.
pub const CCID_INTERFACE_CLASS: u8 = 0x0B;
/// USB class code for vendor-specific interfaces and devices.
pub const VENDOR_SPECIFIC_CLASS: u8 = 0xFF;

/// A newly attached device, as reported by the OS device layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    /// Device path or name, for logging.
    pub path: String,
    /// USB `bInterfaceClass`, when the device advertises interfaces.
    pub interface_class: Option<u8>,
    /// USB `bDeviceClass`, for non-composite devices.
    pub device_class: Option<u8>,
}

/// How plausibly a device is a smartcard reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSupport {
    /// A CCID reader; always worth launching the helper.
    Definite,
    /// Vendor-specific; launch only under aggressive policy.
    Possible,
    /// Not a smartcard device.
    Impossible,
}

/// Classify a newly attached device.
///
/// The interface class is authoritative when present; a vendor-specific
/// device class is a weaker hint.
pub fn device_support(event: &DeviceEvent) -> DeviceSupport {
    debug!(path = %event.path, "examining attached device");
    if let Some(interface_class) = event.interface_class {
        return match interface_class {
            CCID_INTERFACE_CLASS => {
                debug!("CCID smartcard reader recognized");
                DeviceSupport::Definite
            }
            VENDOR_SPECIFIC_CLASS => {
                debug!("vendor-specific interface; possible match");
                DeviceSupport::Possible
            }
            other => {
                debug!(class = other, "interface class is not a smartcard device");
                DeviceSupport::Impossible
            }
        };
    }
    if event.device_class == Some(VENDOR_SPECIFIC_CLASS) {
        debug!("vendor-specific device; possible match");
        return DeviceSupport::Possible;
    }
    DeviceSupport::Impossible
}
