//! C++ bindings for the DfuSe flasher
//!
//! A flash job is driven by the host one step at a time, so that the UI can
//! update its progress display between two USB transfers.

#[cxx::bridge]
mod ffi {

    struct DeviceInfo {
        vendor_id: u16,
        product_id: u16,
        product_string: String,
        in_programming_mode: bool,
    }

    struct MemorySegment {
        start_addr: u32,
        end_addr: u32,
        sector_size: u32,
        readable: bool,
        writable: bool,
        erasable: bool,
    }

    struct DeviceStatus {
        status: u8,
        state: u8,
        poll_timeout_ms: u32,
        description: String,
    }

    enum FlashStage {
        Preparing,
        Erasing,
        Downloading,
        Manifesting,
        Finished,
    }

    struct FlashProgress {
        stage: FlashStage,
        done: u32,
        total: u32,
    }

    extern "Rust" {
        type DfuDeviceFilter;

        #[Self = "DfuDeviceFilter"]
        fn empty_filter() -> Box<DfuDeviceFilter>;

        fn with_vendor_id(&mut self, vid: u16);
        fn with_product_id(&mut self, pid: u16);
        fn find_devices(&self) -> Result<Vec<DfuDevice>>;
    }

    extern "Rust" {
        fn default_start_address() -> u32;
    }

    extern "Rust" {
        type DfuDevice;

        fn device_info(&self) -> DeviceInfo;
        fn interfaces(&self) -> Vec<DfuInterface>;
        fn status(&self) -> Result<DeviceStatus>;
        fn start_flash(
            &self,
            start_address: u32,
            data: &[u8],
            erase_first: bool,
            chunk_size: u16,
        ) -> Result<Box<FlashJob>>;
        fn detach(&self) -> Result<()>;
        fn rediscover(&mut self) -> Result<bool>;
    }

    extern "Rust" {
        type DfuInterface;

        fn name(&self) -> String;
        fn interface(&self) -> u8;
        fn alt_setting(&self) -> u8;
        fn segments(&self) -> Vec<MemorySegment>;
    }

    extern "Rust" {
        type FlashJob;

        fn total(&self) -> u32;
        fn is_finished(&self) -> bool;
        fn step(&mut self) -> Result<FlashProgress>;
    }
}

use dfuse::{DfuMode, DownloadConfig, FLASH_BASE_ADDRESS, Stage};

/// Where images go when the host does not pick an address
fn default_start_address() -> u32 {
    FLASH_BASE_ADDRESS
}

/// `chunk_size` 0 uses the device's transfer size.
fn flash_config(
    start_address: u32,
    erase_first: bool,
    chunk_size: u16,
) -> DownloadConfig {
    let config = DownloadConfig::default()
        .with_start_address(start_address)
        .with_erase_first(erase_first);
    match chunk_size {
        0 => config,
        size => config.with_chunk_size(size),
    }
}

#[derive(Default)]
pub struct DfuDeviceFilter {
    vid: Option<u16>,
    pid: Option<u16>,
}

pub struct DfuDevice {
    inner: dfuse::DfuDevice,
}

pub struct DfuInterface {
    inner: dfuse::DfuInterface,
}

pub struct FlashJob {
    connection: dfuse::DfuConnection,
    layout: dfuse::MemoryMap,
    session: dfuse::TransferSession<'static>,
}

impl DfuDeviceFilter {
    fn empty_filter() -> Box<DfuDeviceFilter> {
        Box::new(DfuDeviceFilter::default())
    }

    fn with_vendor_id(&mut self, vid: u16) {
        self.vid.replace(vid);
    }

    fn with_product_id(&mut self, pid: u16) {
        self.pid.replace(pid);
    }

    fn find_devices(&self) -> Result<Vec<DfuDevice>, dfuse::DfuError> {
        dfuse::find_dfu_devices(self.vid, self.pid)
            .map(|devices| devices.into_iter().map(DfuDevice::new).collect())
    }
}

impl DfuDevice {
    fn new(device: dfuse::DfuDevice) -> Self {
        DfuDevice { inner: device }
    }

    fn device_info(&self) -> ffi::DeviceInfo {
        ffi::DeviceInfo {
            vendor_id: self.inner.vendor_id(),
            product_id: self.inner.product_id(),
            product_string: self.inner.product_string().unwrap_or("").into(),
            in_programming_mode: self.inner.in_programming_mode(),
        }
    }

    fn interfaces(&self) -> Vec<DfuInterface> {
        self.inner
            .interfaces()
            .iter()
            .map(|intf| DfuInterface::new(intf.to_owned()))
            .collect()
    }

    fn status(&self) -> Result<ffi::DeviceStatus, dfuse::DfuError> {
        let intf = self
            .inner
            .interfaces()
            .iter()
            .find(|intf| intf.mode() == DfuMode::Dfu)
            .ok_or(dfuse::DfuError::NotInProgrammingMode)?;
        let connection =
            self.inner.connect(intf.interface(), intf.alt_setting())?;
        let status = connection.get_status()?;
        Ok(ffi::DeviceStatus {
            status: status.status().into(),
            state: status.state().into(),
            poll_timeout_ms: status.poll_timeout().as_millis() as u32,
            description: status.to_string(),
        })
    }

    fn start_flash(
        &self,
        start_address: u32,
        data: &[u8],
        erase_first: bool,
        chunk_size: u16,
    ) -> Result<Box<FlashJob>, dfuse::DfuError> {
        let config = flash_config(start_address, erase_first, chunk_size);
        let session = dfuse::TransferSession::new(config, data.to_vec())
            .map_err(dfuse::DfuError::preparing)?;
        let (connection, intf) = self
            .inner
            .open_flash_interface(start_address, data.len())
            .map_err(dfuse::DfuError::preparing)?;
        let layout = intf
            .layout()
            .cloned()
            .ok_or(dfuse::DfuError::NoMemorySegments)
            .map_err(dfuse::DfuError::preparing)?;
        Ok(Box::new(FlashJob {
            connection,
            layout,
            session,
        }))
    }

    fn detach(&self) -> Result<(), dfuse::DfuError> {
        self.inner.detach()
    }

    fn rediscover(&mut self) -> Result<bool, dfuse::DfuError> {
        let devices = dfuse::find_dfu_devices(
            Some(self.inner.vendor_id()),
            Some(self.inner.product_id()),
        )?;
        Ok(match devices.into_iter().next() {
            Some(device) => {
                self.inner = device;
                true
            }
            None => false,
        })
    }
}

impl DfuInterface {
    fn new(interface: dfuse::DfuInterface) -> Self {
        DfuInterface { inner: interface }
    }

    fn name(&self) -> String {
        match self.inner.layout() {
            Some(layout) => layout.name.clone(),
            None => self.inner.name().unwrap_or_default().into(),
        }
    }

    fn interface(&self) -> u8 {
        self.inner.interface()
    }

    fn alt_setting(&self) -> u8 {
        self.inner.alt_setting()
    }

    fn segments(&self) -> Vec<ffi::MemorySegment> {
        self.inner
            .layout()
            .map(|layout| {
                layout
                    .segments
                    .iter()
                    .map(ffi::MemorySegment::from_dfu_segment)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl FlashJob {
    fn total(&self) -> u32 {
        self.session.total()
    }

    fn is_finished(&self) -> bool {
        self.session.is_finished()
    }

    /// Run one protocol step and report where the job stands afterwards.
    fn step(&mut self) -> Result<ffi::FlashProgress, dfuse::DfuError> {
        let progress = self.session.step(&self.connection, &self.layout)?;
        Ok(match progress {
            Some(p) => ffi::FlashProgress {
                stage: p.stage.into(),
                done: p.done,
                total: p.total,
            },
            None => ffi::FlashProgress {
                stage: self
                    .session
                    .stage()
                    .map_or(ffi::FlashStage::Finished, Into::into),
                done: self.session.sent(),
                total: self.session.total(),
            },
        })
    }
}

impl From<Stage> for ffi::FlashStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Preparing => ffi::FlashStage::Preparing,
            Stage::Erasing => ffi::FlashStage::Erasing,
            Stage::Downloading => ffi::FlashStage::Downloading,
            Stage::Manifesting => ffi::FlashStage::Manifesting,
        }
    }
}

impl ffi::MemorySegment {
    fn from_dfu_segment(segment: &dfuse::MemorySegment) -> Self {
        ffi::MemorySegment {
            start_addr: segment.start(),
            end_addr: segment.end(),
            sector_size: segment.sector_size(),
            readable: segment.readable(),
            writable: segment.writable(),
            erasable: segment.erasable(),
        }
    }
}
