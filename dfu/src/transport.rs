use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::DEFAULT_TIMEOUT;
use crate::error::*;
use crate::protocol::DfuRequest;

/// Class requests addressed to one claimed DFU interface
///
/// Every call completes (or fails) before returning, so requests issued
/// through one transport never overlap.
pub trait ControlTransport {
    fn control_in(
        &self,
        request: DfuRequest,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError>;

    fn control_out(
        &self,
        request: DfuRequest,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError>;
}

impl ControlTransport for nusb::Interface {
    fn control_in(
        &self,
        request: DfuRequest,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let index = self.interface_number() as u16;
        Ok(nusb::Interface::control_in(
            self,
            ControlIn {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: request.into(),
                value,
                index,
                length,
            },
            DEFAULT_TIMEOUT,
        )
        .wait()?)
    }

    fn control_out(
        &self,
        request: DfuRequest,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let index = self.interface_number() as u16;
        Ok(nusb::Interface::control_out(
            self,
            ControlOut {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: request.into(),
                value,
                index,
                data,
            },
            DEFAULT_TIMEOUT,
        )
        .wait()?)
    }
}
