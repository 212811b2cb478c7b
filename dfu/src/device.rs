use std::{num::NonZeroU8, time::Duration};

use log::{debug, info, warn};
use nusb::{self, MaybeFuture};

use crate::{
    AltSettingInfo, DfuConnection, DfuDescriptor, DfuError, DfuInterface,
    DfuMode, DownloadConfig, Progress, descriptor::*, download,
    interface::dfu_interfaces,
    protocol::{DFU_CLASS, DFU_SUBCLASS},
};

/// USB device exposing at least one DFU interface
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    interfaces: Vec<DfuInterface>,
}

impl DfuDevice {
    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.dev
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    pub fn product_string(&self) -> Option<&str> {
        self.dev.product_string()
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &[DfuInterface] {
        &self.interfaces
    }

    /// Whether the bootloader is running (as opposed to the application)
    pub fn in_programming_mode(&self) -> bool {
        self.interfaces.iter().any(|i| i.mode() == DfuMode::Dfu)
    }

    fn open(&self) -> Result<nusb::Device, DfuError> {
        Ok(self.dev.open().wait()?)
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_descriptor().ok().unwrap_or_default().is_dfuse()
    }

    /// Query the DFU functional descriptor. If none can be found,
    /// [DfuDescriptor::default()] is returned.
    pub fn dfu_descriptor(&self) -> Result<DfuDescriptor, DfuError> {
        let open_dev = self.open()?;
        Ok(open_dev
            .configurations()
            .find_map(|config| {
                config.interface_alt_settings().find_map(|alt_setting| {
                    alt_setting
                        .descriptors()
                        .find(is_dfu_descriptor)
                        .and_then(|desc| DfuDescriptor::from_raw(&desc))
                })
            })
            .unwrap_or_default())
    }

    /// Interface able to take an image of `length` bytes at `start_address`
    pub fn flash_interface(
        &self,
        start_address: u32,
        length: u32,
    ) -> Result<&DfuInterface, DfuError> {
        if !self.in_programming_mode() {
            return Err(DfuError::NotInProgrammingMode);
        }
        self.interfaces
            .iter()
            .find(|intf| intf.accepts(start_address, length))
            .ok_or(DfuError::NoMemorySegments)
    }

    /// Claim an interface and select its alternate setting
    pub fn connect(
        &self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<DfuConnection, DfuError> {
        let xfer_size = self.dfu_descriptor()?.transfer_size();
        let dev = self.open()?;
        let interface = dev.claim_interface(interface).wait()?;
        interface.set_alt_setting(alt_setting).wait()?;
        debug!(
            "Claimed interface {} alt {}, transfer size {}",
            interface.interface_number(),
            alt_setting,
            xfer_size
        );
        Ok(DfuConnection::new(interface, xfer_size))
    }

    /// Erase, write and manifest `firmware` as configured.
    ///
    /// Failures to find or claim the flash interface are reported as
    /// [Stage::Preparing](crate::Stage::Preparing) errors.
    pub fn download<F: FnMut(Progress)>(
        &self,
        config: &DownloadConfig,
        firmware: &[u8],
        progress: F,
    ) -> Result<(), DfuError> {
        let (connection, intf) = self
            .open_flash_interface(config.start_address, firmware.len())
            .map_err(DfuError::preparing)?;
        let map = intf
            .layout()
            .ok_or(DfuError::NoMemorySegments)
            .map_err(DfuError::preparing)?;
        download(&connection, map, config, firmware, progress)
    }

    /// Claim the interface able to take `length` bytes at `start_address`.
    pub fn open_flash_interface(
        &self,
        start_address: u32,
        length: usize,
    ) -> Result<(DfuConnection, &DfuInterface), DfuError> {
        let length = u32::try_from(length).map_err(|_| {
            DfuError::InvalidRequest("firmware image exceeds the address space")
        })?;
        let intf = self.flash_interface(start_address, length)?;
        let connection =
            self.connect(intf.interface(), intf.alt_setting())?;
        Ok((connection, intf))
    }

    /// Send `DFU_DETACH` to the run-time interface so the application
    /// restarts into its bootloader.
    pub fn detach(&self) -> Result<(), DfuError> {
        let intf = self
            .interfaces
            .iter()
            .find(|intf| intf.mode() == DfuMode::Runtime)
            .ok_or(DfuError::InvalidRequest("no run-time DFU interface"))?;
        let timeout = match self.dfu_descriptor()?.detach_timeout() {
            0 => 1000,
            t => t,
        };
        let connection = self.connect(intf.interface(), intf.alt_setting())?;
        info!("Detaching (timeout {timeout}ms)");
        connection.detach(timeout)
    }
}

/// Flatten the configuration descriptors into alternate setting records,
/// reading each interface string along the way.
fn read_alt_settings(device: &nusb::Device) -> Vec<AltSettingInfo> {
    device
        .configurations()
        .flat_map(|configuration| {
            let config = configuration.configuration_value();
            configuration
                .interface_alt_settings()
                .map(|alt_setting| AltSettingInfo {
                    config,
                    interface: alt_setting.interface_number(),
                    alt_setting: alt_setting.alternate_setting(),
                    class: alt_setting.class(),
                    subclass: alt_setting.subclass(),
                    protocol: alt_setting.protocol(),
                    name: alt_setting.string_index().and_then(|idx| {
                        get_string_descriptor(
                            device,
                            idx,
                            crate::DEFAULT_TIMEOUT,
                        )
                    }),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}

fn is_dfu_descriptor(desc: &nusb::descriptors::Descriptor) -> bool {
    desc.descriptor_len() == DFU_DESC_LEN
        && desc.descriptor_type() == DFU_DESC_TYPE
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Enumerate DFU devices, optionally filtered by vendor and product ID.
///
/// Devices whose descriptors cannot be used (no DFU alternate setting, or
/// an inconsistent memory map) are skipped with a warning.
pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice>, DfuError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    let mut candidates = Vec::with_capacity(devices.len());
    for device in devices {
        let open_dev: nusb::Device = device.open().wait()?;
        let tree = read_alt_settings(&open_dev);
        candidates.push((device, tree));
    }
    Ok(usable_devices(candidates, |dev| {
        format!(
            "{:04x}:{:04x} (bus {}, address {})",
            dev.vendor_id(),
            dev.product_id(),
            dev.bus_id(),
            dev.device_address()
        )
    })
    .into_iter()
    .map(|(dev, interfaces)| DfuDevice { dev, interfaces })
    .collect())
}

/// Resolve the DFU interfaces of every candidate, keeping the devices
/// that can be used.
fn usable_devices<D>(
    candidates: Vec<(D, Vec<AltSettingInfo>)>,
    describe: impl Fn(&D) -> String,
) -> Vec<(D, Vec<DfuInterface>)> {
    candidates
        .into_iter()
        .filter_map(|(dev, tree)| match dfu_interfaces(&tree) {
            Ok(interfaces) => Some((dev, interfaces)),
            Err(err) => {
                warn!("Skipping device {}: {err}", describe(&dev));
                None
            }
        })
        .collect()
}
