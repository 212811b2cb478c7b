//! Simulated DfuSe bootloader for unit tests

use std::cell::RefCell;

use nusb::transfer::TransferError;

use crate::error::DfuError;
use crate::protocol::*;
use crate::transport::ControlTransport;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Recorded {
    SetAddress(u32),
    Erase(u32),
    MassErase,
    Data { block: u16, len: usize },
    Manifest { block: u16 },
    GetStatus,
    GetState,
    ClearStatus,
    Abort,
    Detach(u16),
}

struct MockState {
    state: DfuState,
    status: DfuStatusCode,
    busy_polls: u32,
    pending_busy: u32,
    pending_fault: Option<DfuStatusCode>,
    fail_erase_at: Option<u32>,
    fail_write_at: Option<usize>,
    chunks: usize,
    ignore_abort: bool,
    vanish_on_manifest: bool,
    manifest_outcome: DfuState,
    gone: bool,
    log: Vec<Recorded>,
}

pub(crate) struct MockDevice {
    inner: RefCell<MockState>,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self::in_state(DfuState::Idle)
    }

    pub(crate) fn in_state(state: DfuState) -> Self {
        MockDevice {
            inner: RefCell::new(MockState {
                state,
                status: DfuStatusCode::Ok,
                busy_polls: 0,
                pending_busy: 0,
                pending_fault: None,
                fail_erase_at: None,
                fail_write_at: None,
                chunks: 0,
                ignore_abort: false,
                vanish_on_manifest: false,
                manifest_outcome: DfuState::Manifest,
                gone: false,
                log: Vec::new(),
            }),
        }
    }

    pub(crate) fn in_error(status: DfuStatusCode) -> Self {
        let dev = Self::in_state(DfuState::Error);
        dev.inner.borrow_mut().status = status;
        dev
    }

    /// Report `dfuDNBUSY` this many times after every download request
    pub(crate) fn with_busy_polls(self, polls: u32) -> Self {
        self.inner.borrow_mut().busy_polls = polls;
        self
    }

    pub(crate) fn failing_erase_at(self, addr: u32) -> Self {
        self.inner.borrow_mut().fail_erase_at = Some(addr);
        self
    }

    /// Fail the n-th (0-based) data chunk with `errWRITE`
    pub(crate) fn failing_write_at(self, chunk: usize) -> Self {
        self.inner.borrow_mut().fail_write_at = Some(chunk);
        self
    }

    pub(crate) fn ignoring_abort(self) -> Self {
        self.inner.borrow_mut().ignore_abort = true;
        self
    }

    /// Drop off the bus as soon as manifestation starts
    pub(crate) fn vanishing_on_manifest(self) -> Self {
        self.inner.borrow_mut().vanish_on_manifest = true;
        self
    }

    /// State reported once manifestation starts; `dfuERROR` comes with
    /// `errFIRMWARE`
    pub(crate) fn with_manifest_outcome(self, state: DfuState) -> Self {
        self.inner.borrow_mut().manifest_outcome = state;
        self
    }

    pub(crate) fn log(&self) -> Vec<Recorded> {
        self.inner.borrow().log.clone()
    }

    /// Everything but the status polls
    pub(crate) fn commands(&self) -> Vec<Recorded> {
        self.inner
            .borrow()
            .log
            .iter()
            .filter(|r| **r != Recorded::GetStatus)
            .cloned()
            .collect()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Recorded) -> bool) -> usize {
        self.inner.borrow().log.iter().filter(|r| pred(r)).count()
    }
}

impl MockState {
    fn start_busy(&mut self) {
        self.state = DfuState::DnloadSync;
        self.pending_busy = self.busy_polls;
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        if !matches!(self.state, DfuState::Idle | DfuState::DnloadIdle) {
            return Err(TransferError::Stall.into());
        }

        if data.is_empty() {
            self.log.push(Recorded::Manifest { block });
            self.state = DfuState::ManifestSync;
            return Ok(());
        }

        if block == DFUSE_COMMAND_BLOCK {
            let addr = (data.len() == 5).then(|| {
                u32::from_le_bytes([data[1], data[2], data[3], data[4]])
            });
            match (data[0], addr) {
                (DfuseCommand::SET_ADDRESS_POINTER, Some(addr)) => {
                    self.log.push(Recorded::SetAddress(addr));
                }
                (DfuseCommand::ERASE, Some(addr)) => {
                    self.log.push(Recorded::Erase(addr));
                    self.pending_fault = (self.fail_erase_at == Some(addr))
                        .then_some(DfuStatusCode::ErrErase);
                }
                (DfuseCommand::ERASE, None) => {
                    self.log.push(Recorded::MassErase);
                }
                _ => return Err(TransferError::Stall.into()),
            }
        } else {
            self.log.push(Recorded::Data {
                block,
                len: data.len(),
            });
            self.pending_fault = (self.fail_write_at == Some(self.chunks))
                .then_some(DfuStatusCode::ErrWrite);
            self.chunks += 1;
        }
        self.start_busy();
        Ok(())
    }

    fn status(&mut self) -> Result<Vec<u8>, DfuError> {
        self.log.push(Recorded::GetStatus);
        if self.gone {
            return Err(TransferError::Disconnected.into());
        }
        match self.state {
            DfuState::DnloadSync | DfuState::DnBusy => {
                if self.pending_busy > 0 {
                    self.pending_busy -= 1;
                    self.state = DfuState::DnBusy;
                } else if let Some(status) = self.pending_fault.take() {
                    self.state = DfuState::Error;
                    self.status = status;
                } else {
                    self.state = DfuState::DnloadIdle;
                }
            }
            DfuState::ManifestSync => {
                if self.vanish_on_manifest {
                    self.gone = true;
                    return Err(TransferError::Disconnected.into());
                }
                self.state = self.manifest_outcome;
                if self.state == DfuState::Error {
                    self.status = DfuStatusCode::ErrFirmware;
                }
            }
            _ => {}
        }
        Ok(vec![self.status.into(), 0, 0, 0, self.state.into(), 0])
    }
}

impl ControlTransport for MockDevice {
    fn control_in(
        &self,
        request: DfuRequest,
        _value: u16,
        _length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let mut dev = self.inner.borrow_mut();
        match request {
            DfuRequest::GetStatus => dev.status(),
            DfuRequest::GetState => {
                dev.log.push(Recorded::GetState);
                Ok(vec![dev.state.into()])
            }
            _ => Err(TransferError::Stall.into()),
        }
    }

    fn control_out(
        &self,
        request: DfuRequest,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let mut dev = self.inner.borrow_mut();
        if dev.gone {
            return Err(TransferError::Disconnected.into());
        }
        match request {
            DfuRequest::Download => dev.download(value, data),
            DfuRequest::ClearStatus => {
                dev.log.push(Recorded::ClearStatus);
                dev.state = DfuState::Idle;
                dev.status = DfuStatusCode::Ok;
                Ok(())
            }
            DfuRequest::Abort => {
                dev.log.push(Recorded::Abort);
                if !dev.ignore_abort && dev.state != DfuState::Error {
                    dev.state = DfuState::Idle;
                }
                Ok(())
            }
            DfuRequest::Detach => {
                dev.log.push(Recorded::Detach(value));
                Ok(())
            }
            _ => Err(TransferError::Stall.into()),
        }
    }
}
