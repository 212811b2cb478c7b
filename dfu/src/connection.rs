use std::{cell::Cell, fmt, time::Duration};

use log::{debug, trace, warn};

use crate::error::*;
use crate::poll::{PollPolicy, poll_until};
use crate::protocol::*;
use crate::transport::ControlTransport;

/// Claimed DFU interface
///
/// Owns the transport exclusively. Requests are issued one at a time and
/// every operation waits for the device before returning.
pub struct DfuConnection<T = nusb::Interface> {
    transport: T,
    xfer_size: u16,
    poll_interval: Duration,
    last_status: Cell<Option<DfuStatus>>,
}

/// Answer to `DFU_GETSTATUS`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    status: DfuStatusCode,
    poll_timeout: u32,
    state: DfuState,
}

impl DfuStatus {
    pub fn new(
        status: DfuStatusCode,
        state: DfuState,
        poll_timeout: u32,
    ) -> Self {
        DfuStatus {
            status,
            poll_timeout,
            state,
        }
    }

    fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::ShortResponse {
                expected: DFU_STATUS_LEN as usize,
                got: data.len(),
            });
        }
        Ok(DfuStatus {
            status: data[0].into(),
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: data[4].into(),
        })
    }

    pub fn status(&self) -> DfuStatusCode {
        self.status
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Minimum time the device asks the host to wait before the next
    /// `DFU_GETSTATUS` (`bwPollTimeout`)
    #[doc(alias = "bwPollTimeout")]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout as u64)
    }

    pub fn is_error(&self) -> bool {
        self.status != DfuStatusCode::Ok || self.state == DfuState::Error
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        self.ret(())
    }

    pub fn ret<T>(&self, t: T) -> Result<T, DfuError> {
        if self.is_error() {
            Err(DfuError::from(self))
        } else {
            Ok(t)
        }
    }

    /// Device finished executing a DfuSe command
    fn command_settled(&self) -> bool {
        !matches!(self.state, DfuState::DnloadSync | DfuState::DnBusy)
    }

    /// Device stored the last data block, or gave up on it
    fn chunk_settled(&self) -> bool {
        self.state == DfuState::DnloadIdle || self.is_error()
    }

    /// Device reached (or left) the manifestation phase
    fn manifestation_settled(&self) -> bool {
        matches!(
            self.state,
            DfuState::Manifest
                | DfuState::ManifestWaitReset
                | DfuState::Idle
                | DfuState::Error
        )
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}, state {}", self.status, self.state)
    }
}

impl<T: ControlTransport> DfuConnection<T> {
    pub fn new(transport: T, xfer_size: u16) -> Self {
        DfuConnection {
            transport,
            xfer_size: if xfer_size > 0 {
                xfer_size
            } else {
                crate::DEFAULT_TRANSFER_SIZE
            },
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            last_status: Cell::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn transfer_size(&self) -> u16 {
        self.xfer_size
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Last status received from the device, if any
    pub fn last_status(&self) -> Option<DfuStatus> {
        self.last_status.get()
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data = self.transport.control_in(
            DfuRequest::GetStatus,
            0,
            DFU_STATUS_LEN,
        )?;
        let st = DfuStatus::from_raw(&data)?;
        trace!("GETSTATUS: {st}, poll timeout {}ms", st.poll_timeout);
        self.last_status.set(Some(st));
        Ok(st)
    }

    pub fn get_state(&self) -> Result<DfuState, DfuError> {
        let data =
            self.transport
                .control_in(DfuRequest::GetState, 0, DFU_STATE_LEN)?;
        match data.first() {
            Some(state) => Ok(DfuState::from(*state)),
            None => Err(DfuError::ShortResponse {
                expected: DFU_STATE_LEN as usize,
                got: 0,
            }),
        }
    }

    pub fn clear_status(&self) -> Result<(), DfuError> {
        self.transport.control_out(DfuRequest::ClearStatus, 0, &[])
    }

    pub fn abort(&self) -> Result<(), DfuError> {
        self.transport.control_out(DfuRequest::Abort, 0, &[])
    }

    /// Ask a run-time interface to switch to DFU mode within `timeout_ms`
    pub fn detach(&self, timeout_ms: u16) -> Result<(), DfuError> {
        self.transport.control_out(DfuRequest::Detach, timeout_ms, &[])
    }

    /// `DFU_CLRSTATUS` followed by a status check. Fails if the device is
    /// still in `dfuERROR`.
    pub fn clear_error(&self) -> Result<DfuStatus, DfuError> {
        self.clear_status()?;
        let st = self.get_status()?;
        if st.is_error() {
            return Err(DfuError::UnexpectedState {
                expected: DfuState::Idle,
                status: st,
            });
        }
        Ok(st)
    }

    /// Bring the device back to `dfuIDLE` from any state of an interrupted
    /// transfer.
    pub fn abort_to_idle(&self) -> Result<(), DfuError> {
        self.abort()?;
        let mut st = self.get_status()?;
        if st.is_error() {
            self.clear_status()?;
            st = self.get_status()?;
        }
        if st.state != DfuState::Idle {
            return Err(DfuError::UnexpectedState {
                expected: DfuState::Idle,
                status: st,
            });
        }
        Ok(())
    }

    /// Raw `DFU_DNLOAD`, without waiting for the device
    pub fn dnload(&self, block_nr: u16, data: &[u8]) -> Result<(), DfuError> {
        self.transport
            .control_out(DfuRequest::Download, block_nr, data)
    }

    /// Send a DfuSe command and wait until the device has executed it.
    pub fn dfuse_command(
        &self,
        command: DfuseCommand,
    ) -> Result<DfuStatus, DfuError> {
        debug!("{command}");
        self.dnload(DFUSE_COMMAND_BLOCK, &command.payload())?;
        let st = poll_until(
            &PollPolicy::unbounded(self.poll_interval),
            || self.get_status(),
            DfuStatus::command_settled,
        )?;
        if st.is_error() {
            return Err(DfuError::Command {
                command,
                status: st,
            });
        }
        Ok(st)
    }

    pub fn set_address_pointer(&self, addr: u32) -> Result<(), DfuError> {
        self.dfuse_command(DfuseCommand::SetAddressPointer(addr))
            .map(|_| ())
    }

    pub fn erase_sector(&self, addr: u32) -> Result<(), DfuError> {
        self.dfuse_command(DfuseCommand::EraseSector(addr))
            .map(|_| ())
    }

    pub fn mass_erase(&self) -> Result<(), DfuError> {
        self.dfuse_command(DfuseCommand::MassErase).map(|_| ())
    }

    /// Write one data block at the current address pointer and wait until
    /// the device is ready for the next one.
    pub fn write_chunk(
        &self,
        data: &[u8],
        max_polls: u32,
    ) -> Result<DfuStatus, DfuError> {
        self.dnload(DFUSE_DATA_BLOCK, data)?;
        let st = poll_until(
            &PollPolicy::bounded(self.poll_interval, max_polls),
            || self.get_status(),
            DfuStatus::chunk_settled,
        )?;
        st.ret(st)
    }

    /// Zero-length `DFU_DNLOAD`: the device leaves DFU mode and runs the
    /// firmware found at the current address pointer.
    pub fn request_manifestation(&self) -> Result<(), DfuError> {
        self.dnload(DFUSE_COMMAND_BLOCK, &[])
    }

    pub fn poll_manifestation(&self) -> Result<DfuStatus, DfuError> {
        let st = poll_until(
            &PollPolicy::unbounded(self.poll_interval),
            || self.get_status(),
            DfuStatus::manifestation_settled,
        )?;
        if st.state == DfuState::Idle {
            warn!("Device returned to {} instead of manifesting", st.state);
        }
        Ok(st)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, Recorded};

    fn connect(device: MockDevice) -> DfuConnection<MockDevice> {
        DfuConnection::new(device, 0).with_poll_interval(Duration::ZERO)
    }

    #[test]
    fn test_status_from_raw() {
        let st = DfuStatus::from_raw(&[0x00, 0x10, 0x27, 0x00, 0x05, 0x00])
            .unwrap();
        assert_eq!(st.status(), DfuStatusCode::Ok);
        assert_eq!(st.state(), DfuState::DnloadIdle);
        assert_eq!(st.poll_timeout(), Duration::from_millis(10_000));

        let st = DfuStatus::from_raw(&[0x03, 0x01, 0x02, 0x03, 0x0a, 0x00])
            .unwrap();
        assert_eq!(st.poll_timeout, 0x030201);
        assert!(st.is_error());
        assert!(st.ok().is_err());

        assert!(matches!(
            DfuStatus::from_raw(&[0x00, 0x00]),
            Err(DfuError::ShortResponse {
                expected: 6,
                got: 2
            })
        ));
    }

    #[test]
    fn test_default_transfer_size() {
        let conn = DfuConnection::new(MockDevice::new(), 0);
        assert_eq!(conn.transfer_size(), crate::DEFAULT_TRANSFER_SIZE);
        let conn = DfuConnection::new(MockDevice::new(), 4096);
        assert_eq!(conn.transfer_size(), 4096);
    }

    #[test]
    fn test_set_address_waits_for_busy() {
        let conn = connect(MockDevice::new().with_busy_polls(3));
        conn.set_address_pointer(0x9000_0000).unwrap();

        let log = conn.transport().log();
        assert_eq!(log[0], Recorded::SetAddress(0x9000_0000));
        assert_eq!(
            log.iter().filter(|r| **r == Recorded::GetStatus).count(),
            4
        );
        assert_eq!(conn.last_status().unwrap().state(), DfuState::DnloadIdle);
    }

    #[test]
    fn test_failed_erase_names_command() {
        let conn = connect(MockDevice::new().failing_erase_at(0x9000_1000));
        conn.erase_sector(0x9000_0000).unwrap();
        let err = conn.erase_sector(0x9000_1000).unwrap_err();
        assert!(err.to_string().contains("ERASE_SECTOR(0x90001000)"));
        match err {
            DfuError::Command { command, status } => {
                assert_eq!(command, DfuseCommand::EraseSector(0x9000_1000));
                assert_eq!(status.state(), DfuState::Error);
            }
            other => panic!("unexpected error: {other}"),
        }

        // a device in dfuERROR stalls further downloads
        assert!(matches!(
            conn.erase_sector(0x9000_2000),
            Err(DfuError::Transfer(_))
        ));
    }

    #[test]
    fn test_mass_erase_payload() {
        let conn = connect(MockDevice::new());
        conn.mass_erase().unwrap();
        assert_eq!(conn.transport().commands(), vec![Recorded::MassErase]);
    }

    #[test]
    fn test_clear_error() {
        let conn = connect(MockDevice::in_error(DfuStatusCode::ErrWrite));
        let st = conn.clear_error().unwrap();
        assert_eq!(st.state(), DfuState::Idle);
        assert_eq!(conn.transport().commands(), vec![Recorded::ClearStatus]);
    }

    #[test]
    fn test_abort_to_idle() {
        let conn = connect(MockDevice::in_state(DfuState::DnloadIdle));
        conn.abort_to_idle().unwrap();
        assert_eq!(conn.transport().commands(), vec![Recorded::Abort]);

        // ABORT is ignored in dfuERROR, CLRSTATUS recovers
        let conn = connect(MockDevice::in_error(DfuStatusCode::ErrProg));
        conn.abort_to_idle().unwrap();
        assert_eq!(
            conn.transport().commands(),
            vec![Recorded::Abort, Recorded::ClearStatus]
        );
    }

    #[test]
    fn test_abort_to_idle_stuck() {
        let conn = connect(
            MockDevice::in_state(DfuState::UploadIdle).ignoring_abort(),
        );
        assert!(matches!(
            conn.abort_to_idle(),
            Err(DfuError::UnexpectedState {
                expected: DfuState::Idle,
                ..
            })
        ));
    }

    #[test]
    fn test_write_chunk_error() {
        let conn = connect(MockDevice::new().failing_write_at(0));
        conn.set_address_pointer(0x9000_0000).unwrap();
        let err = conn.write_chunk(&[0u8; 64], 10).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Status(st) if st.status() == DfuStatusCode::ErrWrite
        ));
    }

    #[test]
    fn test_write_chunk_timeout() {
        let conn = connect(MockDevice::new().with_busy_polls(20));
        assert!(matches!(
            conn.write_chunk(&[0u8; 64], 5),
            Err(DfuError::Timeout)
        ));
    }

    #[test]
    fn test_get_state_and_detach() {
        let conn = connect(MockDevice::in_state(DfuState::AppIdle));
        assert_eq!(conn.get_state().unwrap(), DfuState::AppIdle);
        conn.detach(1000).unwrap();
        assert_eq!(
            conn.transport().commands(),
            vec![Recorded::GetState, Recorded::Detach(1000)]
        );
    }
}
