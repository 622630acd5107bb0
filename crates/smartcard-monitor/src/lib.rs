//! Smartcard reader/token monitoring and helper-daemon supervision.
//!
//! The monitor is the glue between the smartcard layer and the daemon's
//! object web: it translates real-world events (card and device insertions,
//! sleep/wake, helper notifications) into [`Reader`] and [`Token`] objects,
//! and decides when to launch or reap the external helper daemon.

mod device;
mod error;
mod monitor;
mod reader;
mod supervisor;

pub use device::{device_support, DeviceEvent, DeviceSupport, CCID_INTERFACE_CLASS, VENDOR_SPECIFIC_CLASS};
pub use error::{MonitorError, MonitorResult};
pub use monitor::{PcscClient, ReaderSnapshot, SmartcardMonitor};
pub use reader::{Reader, Token};
pub use supervisor::{
    ChildHandle, ChildLauncher, CommandChildLauncher, HelperConfig, HelperState, HelperSupervisor,
};
