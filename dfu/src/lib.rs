//! DfuSe (USB DFU with STM32 extensions) download client based on [`nusb`]
//!
//! Reprograms the external QSPI flash of an audio board through its DfuSe
//! bootloader: the host discovers the DFU interface, parses the memory map
//! advertised in the interface string, erases the sectors covered by the
//! firmware image, writes the image chunk by chunk and finally asks the device
//! to manifest (reset and boot the new firmware).
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! Flash an image to the first device found in programming mode:
//! ```no_run
//! use dfuse::{DownloadConfig, find_dfu_devices};
//!
//! let firmware = std::fs::read("firmware.bin").unwrap();
//! let devices = find_dfu_devices(None, None).unwrap();
//! if let Some(device) = devices.first() {
//!     let config = DownloadConfig::default().with_erase_first(true);
//!     device
//!         .download(&config, &firmware, |p| {
//!             println!("{}: {}/{}", p.stage, p.done, p.total)
//!         })
//!         .unwrap();
//! }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;

/// Delay between two `DFU_GETSTATUS` requests while the device is busy
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum number of status polls while waiting for a data chunk to be written
pub const DEFAULT_MAX_CHUNK_POLLS: u32 = 500;

/// Base address of the board's external flash
pub const FLASH_BASE_ADDRESS: u32 = 0x9000_0000;

/// Memory map used when the bootloader does not advertise a usable one
pub const DEFAULT_MEMORY_DESCRIPTOR: &str = "@Flash /0x90000000/1024*04Kg";

mod connection;
mod descriptor;
mod device;
mod discovery;
mod download;
mod erase;
mod error;
mod interface;
mod memory;
mod poll;
mod protocol;
mod transport;

#[cfg(test)]
mod mock;

use std::time::Duration;

// Re-exports
pub use connection::{DfuConnection, DfuStatus};
pub use descriptor::{DFUSE_VERSION_NUMBER, DfuDescriptor};
pub use device::{DfuDevice, find_dfu_devices};
pub use discovery::{
    AltSettingInfo, DfuAltSetting, DfuMode, discover, find_dfu_alt_settings,
};
pub use download::{DownloadConfig, Progress, Stage, TransferSession, download};
pub use erase::{ErasePlan, EraseStep};
pub use error::DfuError;
pub use interface::{DfuInterface, LayoutSource};
pub use memory::{MemoryMap, MemoryMapError, MemorySegment, parse_memory_map};
pub use poll::PollPolicy;
pub use protocol::{DfuRequest, DfuState, DfuStatusCode, DfuseCommand};
pub use transport::ControlTransport;
