use crate::{
    DfuStatus, DfuseCommand, MemoryMapError, Stage, protocol::DfuState,
};

#[derive(Debug)]
pub enum DfuError {
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    /// Device reported a non-OK status or `dfuERROR`
    Status(DfuStatus),
    /// DfuSe vendor command finished with an error status
    Command {
        command: DfuseCommand,
        status: DfuStatus,
    },
    /// Device did not return to the state required to continue
    UnexpectedState {
        expected: DfuState,
        status: DfuStatus,
    },
    ShortResponse {
        expected: usize,
        got: usize,
    },
    NotInProgrammingMode,
    InvalidMemoryMap(MemoryMapError),
    NoMemorySegments,
    InvalidRequest(&'static str),
    Timeout,
    /// Failure during a download, labelled with the stage it happened in
    Download {
        stage: Stage,
        last_status: Option<DfuStatus>,
        source: Box<DfuError>,
    },
}

impl DfuError {
    /// Stage of the download that failed, if the error comes from one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            DfuError::Download { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Label an error raised before the first download step, such as a
    /// missing flash interface. Errors already labelled are kept as is.
    pub fn preparing(self) -> Self {
        match self {
            err @ DfuError::Download { .. } => err,
            err => DfuError::Download {
                stage: Stage::Preparing,
                last_status: None,
                source: Box::new(err),
            },
        }
    }

    /// Innermost error, with the download context stripped
    pub fn root_cause(&self) -> &DfuError {
        match self {
            DfuError::Download { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl std::error::Error for DfuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DfuError::Usb(err) => Some(err),
            DfuError::Transfer(err) => Some(err),
            DfuError::InvalidMemoryMap(err) => Some(err),
            DfuError::Download { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl std::fmt::Display for DfuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuError::Usb(err) => write!(f, "USB error: {}", err),
            DfuError::Transfer(err) => write!(f, "Transfer error: {}", err),
            DfuError::Status(st) => {
                write!(f, "DFU status error: {}", st)
            }
            DfuError::Command { command, status } => {
                write!(f, "DfuSe command {} failed: {}", command, status)
            }
            DfuError::UnexpectedState { expected, status } => {
                write!(
                    f,
                    "Expected state {}, device reports {}",
                    expected, status
                )
            }
            DfuError::ShortResponse { expected, got } => {
                write!(
                    f,
                    "Short response: expected {} bytes, got {}",
                    expected, got
                )
            }
            DfuError::NotInProgrammingMode => {
                write!(f, "Device not in programming mode")
            }
            DfuError::InvalidMemoryMap(err) => {
                write!(f, "Invalid memory map: {}", err)
            }
            DfuError::NoMemorySegments => {
                write!(f, "No compatible memory segments")
            }
            DfuError::InvalidRequest(reason) => {
                write!(f, "Invalid request: {}", reason)
            }
            DfuError::Timeout => {
                write!(f, "Timeout")
            }
            DfuError::Download {
                stage,
                last_status,
                source,
            } => {
                write!(f, "Download failed while {}: {}", stage, source)?;
                if let Some(st) = last_status {
                    write!(f, " (last {})", st)?;
                }
                Ok(())
            }
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DfuError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DfuError::Transfer(err)
    }
}

impl From<&DfuStatus> for DfuError {
    fn from(st: &DfuStatus) -> Self {
        DfuError::Status(*st)
    }
}
