use std::fmt;

pub(crate) const DFU_CLASS: u8 = 0xFE;
pub(crate) const DFU_SUBCLASS: u8 = 0x01;
pub(crate) const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub(crate) const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

pub(crate) const DFU_STATUS_LEN: u16 = 6;
pub(crate) const DFU_STATE_LEN: u16 = 1;

/// Block number used for every firmware chunk. The bootloader tracks the
/// position through `SET_ADDRESS_POINTER` only.
pub(crate) const DFUSE_DATA_BLOCK: u16 = 2;

/// Block number carrying DfuSe vendor commands
pub(crate) const DFUSE_COMMAND_BLOCK: u16 = 0;

/// DFU class-specific requests (DFU 1.1, table 3.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0x00,
    Download = 0x01,
    Upload = 0x02,
    GetStatus = 0x03,
    ClearStatus = 0x04,
    GetState = 0x05,
    Abort = 0x06,
}

impl From<DfuRequest> for u8 {
    fn from(req: DfuRequest) -> Self {
        req as u8
    }
}

/// Device state as reported by `DFU_GETSTATUS` and `DFU_GETSTATE`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    Idle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(code: u8) -> Self {
        match code {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::Idle,
            0x03 => DfuState::DnloadSync,
            0x04 => DfuState::DnBusy,
            0x05 => DfuState::DnloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0a => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

impl From<DfuState> for u8 {
    fn from(state: DfuState) -> Self {
        match state {
            DfuState::AppIdle => 0x00,
            DfuState::AppDetach => 0x01,
            DfuState::Idle => 0x02,
            DfuState::DnloadSync => 0x03,
            DfuState::DnBusy => 0x04,
            DfuState::DnloadIdle => 0x05,
            DfuState::ManifestSync => 0x06,
            DfuState::Manifest => 0x07,
            DfuState::ManifestWaitReset => 0x08,
            DfuState::UploadIdle => 0x09,
            DfuState::Error => 0x0a,
            DfuState::Unknown(other) => other,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::Idle => write!(f, "dfuIDLE"),
            DfuState::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DnBusy => write!(f, "dfuDNBUSY"),
            DfuState::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::Error => write!(f, "dfuERROR"),
            DfuState::Unknown(code) => write!(f, "unknown state {code:#04x}"),
        }
    }
}

/// Status code as reported by `DFU_GETSTATUS` (`bStatus`)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPkt,
    Unknown(u8),
}

impl From<u8> for DfuStatusCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => DfuStatusCode::Ok,
            0x01 => DfuStatusCode::ErrTarget,
            0x02 => DfuStatusCode::ErrFile,
            0x03 => DfuStatusCode::ErrWrite,
            0x04 => DfuStatusCode::ErrErase,
            0x05 => DfuStatusCode::ErrCheckErased,
            0x06 => DfuStatusCode::ErrProg,
            0x07 => DfuStatusCode::ErrVerify,
            0x08 => DfuStatusCode::ErrAddress,
            0x09 => DfuStatusCode::ErrNotDone,
            0x0a => DfuStatusCode::ErrFirmware,
            0x0b => DfuStatusCode::ErrVendor,
            0x0c => DfuStatusCode::ErrUsbReset,
            0x0d => DfuStatusCode::ErrPowerOnReset,
            0x0e => DfuStatusCode::ErrUnknown,
            0x0f => DfuStatusCode::ErrStalledPkt,
            other => DfuStatusCode::Unknown(other),
        }
    }
}

impl From<DfuStatusCode> for u8 {
    fn from(status: DfuStatusCode) -> Self {
        match status {
            DfuStatusCode::Ok => 0x00,
            DfuStatusCode::ErrTarget => 0x01,
            DfuStatusCode::ErrFile => 0x02,
            DfuStatusCode::ErrWrite => 0x03,
            DfuStatusCode::ErrErase => 0x04,
            DfuStatusCode::ErrCheckErased => 0x05,
            DfuStatusCode::ErrProg => 0x06,
            DfuStatusCode::ErrVerify => 0x07,
            DfuStatusCode::ErrAddress => 0x08,
            DfuStatusCode::ErrNotDone => 0x09,
            DfuStatusCode::ErrFirmware => 0x0a,
            DfuStatusCode::ErrVendor => 0x0b,
            DfuStatusCode::ErrUsbReset => 0x0c,
            DfuStatusCode::ErrPowerOnReset => 0x0d,
            DfuStatusCode::ErrUnknown => 0x0e,
            DfuStatusCode::ErrStalledPkt => 0x0f,
            DfuStatusCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuStatusCode::Ok => write!(f, "OK"),
            DfuStatusCode::ErrTarget => write!(f, "errTARGET"),
            DfuStatusCode::ErrFile => write!(f, "errFILE"),
            DfuStatusCode::ErrWrite => write!(f, "errWRITE"),
            DfuStatusCode::ErrErase => write!(f, "errERASE"),
            DfuStatusCode::ErrCheckErased => write!(f, "errCHECK_ERASED"),
            DfuStatusCode::ErrProg => write!(f, "errPROG"),
            DfuStatusCode::ErrVerify => write!(f, "errVERIFY"),
            DfuStatusCode::ErrAddress => write!(f, "errADDRESS"),
            DfuStatusCode::ErrNotDone => write!(f, "errNOTDONE"),
            DfuStatusCode::ErrFirmware => write!(f, "errFIRMWARE"),
            DfuStatusCode::ErrVendor => write!(f, "errVENDOR"),
            DfuStatusCode::ErrUsbReset => write!(f, "errUSBR"),
            DfuStatusCode::ErrPowerOnReset => write!(f, "errPOR"),
            DfuStatusCode::ErrUnknown => write!(f, "errUNKNOWN"),
            DfuStatusCode::ErrStalledPkt => write!(f, "errSTALLEDPKT"),
            DfuStatusCode::Unknown(code) => {
                write!(f, "unknown status {code:#04x}")
            }
        }
    }
}

/// DfuSe vendor commands, sent as the payload of a block 0 `DFU_DNLOAD`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuseCommand {
    SetAddressPointer(u32),
    EraseSector(u32),
    MassErase,
}

impl DfuseCommand {
    pub const SET_ADDRESS_POINTER: u8 = 0x21;
    pub const ERASE: u8 = 0x41;

    /// Wire payload: opcode followed by the little-endian address, if any
    pub fn payload(&self) -> Vec<u8> {
        match self {
            DfuseCommand::SetAddressPointer(addr) => {
                Self::with_address(Self::SET_ADDRESS_POINTER, *addr)
            }
            DfuseCommand::EraseSector(addr) => {
                Self::with_address(Self::ERASE, *addr)
            }
            DfuseCommand::MassErase => vec![Self::ERASE],
        }
    }

    fn with_address(opcode: u8, addr: u32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(5);
        payload.push(opcode);
        payload.extend_from_slice(&addr.to_le_bytes());
        payload
    }
}

impl fmt::Display for DfuseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuseCommand::SetAddressPointer(addr) => {
                write!(f, "SET_ADDRESS_POINTER({addr:#010x})")
            }
            DfuseCommand::EraseSector(addr) => {
                write!(f, "ERASE_SECTOR({addr:#010x})")
            }
            DfuseCommand::MassErase => write!(f, "MASS_ERASE"),
        }
    }
}
