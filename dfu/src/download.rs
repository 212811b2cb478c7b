use std::{borrow::Cow, fmt, mem};

use log::{debug, info, warn};

use crate::{
    DEFAULT_MAX_CHUNK_POLLS, DfuConnection, DfuError, ErasePlan, EraseStep,
    FLASH_BASE_ADDRESS, MemoryMap, protocol::DfuState,
    transport::ControlTransport,
};

/// Phase of a download, used to label progress and errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    Erasing,
    Downloading,
    Manifesting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Preparing => write!(f, "preparing"),
            Stage::Erasing => write!(f, "erasing"),
            Stage::Downloading => write!(f, "downloading"),
            Stage::Manifesting => write!(f, "manifesting"),
        }
    }
}

/// Bytes accounted for so far in the current stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub done: u32,
    pub total: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Flash address of the first byte of the image
    pub start_address: u32,
    /// Bytes per `DFU_DNLOAD`; `None` uses the device's `wTransferSize`
    pub chunk_size: Option<u16>,
    pub erase_first: bool,
    /// Status polls allowed per chunk before giving up
    pub max_chunk_polls: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            start_address: FLASH_BASE_ADDRESS,
            chunk_size: None,
            erase_first: true,
            max_chunk_polls: DEFAULT_MAX_CHUNK_POLLS,
        }
    }
}

impl DownloadConfig {
    pub fn with_start_address(mut self, addr: u32) -> Self {
        self.start_address = addr;
        self
    }

    pub fn with_chunk_size(mut self, size: u16) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn with_erase_first(mut self, erase: bool) -> Self {
        self.erase_first = erase;
        self
    }

    pub fn with_max_chunk_polls(mut self, polls: u32) -> Self {
        self.max_chunk_polls = polls;
        self
    }
}

enum Phase {
    Prepare,
    Erase { plan: ErasePlan, next: usize, done: u32 },
    Write,
    Manifest,
    Finished,
    Failed,
}

/// One firmware download, advanced one protocol step at a time
///
/// A step is one of: status check and recovery, one erase sector, one data
/// chunk, or the manifestation request. After a failed step the session is
/// dead; a new download has to start over, erase included.
pub struct TransferSession<'a> {
    config: DownloadConfig,
    firmware: Cow<'a, [u8]>,
    chunk_size: usize,
    sent: usize,
    phase: Phase,
}

impl<'a> TransferSession<'a> {
    pub fn new(
        config: DownloadConfig,
        firmware: impl Into<Cow<'a, [u8]>>,
    ) -> Result<Self, DfuError> {
        let firmware = firmware.into();
        if firmware.is_empty() {
            return Err(DfuError::InvalidRequest("empty firmware image"));
        }
        if config.chunk_size == Some(0) {
            return Err(DfuError::InvalidRequest("chunk size must not be zero"));
        }
        let fits = u32::try_from(firmware.len())
            .ok()
            .and_then(|len| config.start_address.checked_add(len))
            .is_some();
        if !fits {
            return Err(DfuError::InvalidRequest(
                "firmware image exceeds the address space",
            ));
        }
        Ok(Self {
            chunk_size: config.chunk_size.unwrap_or(0) as usize,
            config,
            firmware,
            sent: 0,
            phase: Phase::Prepare,
        })
    }

    pub fn total(&self) -> u32 {
        self.firmware.len() as u32
    }

    pub fn sent(&self) -> u32 {
        self.sent as u32
    }

    /// Stage the next step belongs to, `None` once finished or failed
    pub fn stage(&self) -> Option<Stage> {
        match self.phase {
            Phase::Prepare => Some(Stage::Preparing),
            Phase::Erase { .. } => Some(Stage::Erasing),
            Phase::Write => Some(Stage::Downloading),
            Phase::Manifest => Some(Stage::Manifesting),
            Phase::Finished | Phase::Failed => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Failed)
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.phase, Phase::Failed)
    }

    /// Perform the next step.
    ///
    /// Returns the progress of erase and chunk steps, `None` for the others.
    /// Errors carry the stage and the last status read from the device.
    pub fn step<T: ControlTransport>(
        &mut self,
        conn: &DfuConnection<T>,
        map: &MemoryMap,
    ) -> Result<Option<Progress>, DfuError> {
        let Some(stage) = self.stage() else {
            return Ok(None);
        };
        let phase = mem::replace(&mut self.phase, Phase::Failed);
        let (next, progress) = match phase {
            Phase::Prepare => {
                self.prepare(conn, map).map(|phase| (phase, None))
            }
            Phase::Erase { plan, next, done } => self
                .erase_step(conn, plan, next, done)
                .map(|(phase, p)| (phase, Some(p))),
            Phase::Write => {
                self.write_step(conn).map(|(phase, p)| (phase, Some(p)))
            }
            Phase::Manifest => self.manifest(conn).map(|phase| (phase, None)),
            ended @ (Phase::Finished | Phase::Failed) => Ok((ended, None)),
        }
        .map_err(|source| DfuError::Download {
            stage,
            last_status: conn.last_status(),
            source: Box::new(source),
        })?;
        self.phase = next;
        Ok(progress)
    }

    fn prepare<T: ControlTransport>(
        &mut self,
        conn: &DfuConnection<T>,
        map: &MemoryMap,
    ) -> Result<Phase, DfuError> {
        let start = self.config.start_address;
        if !map.is_writable(start, start + self.total()) {
            return Err(DfuError::NoMemorySegments);
        }
        self.chunk_size = self
            .config
            .chunk_size
            .unwrap_or(conn.transfer_size())
            .into();

        let mut st = conn.get_status()?;
        if st.state() == DfuState::Error {
            info!("Clearing latent device error ({st})");
            st = conn.clear_error()?;
        }
        if st.state() != DfuState::Idle {
            info!("Device in {}, aborting to idle", st.state());
            conn.abort_to_idle()?;
        }

        if self.config.erase_first {
            let plan = ErasePlan::new(map, start, self.total())?;
            info!(
                "Erasing {} sector(s) in {:#010x}..{:#010x}",
                plan.sectors().count(),
                plan.start(),
                plan.end()
            );
            Ok(Phase::Erase {
                plan,
                next: 0,
                done: 0,
            })
        } else {
            info!("Writing {} bytes at {:#010x}", self.total(), start);
            Ok(Phase::Write)
        }
    }

    fn erase_step<T: ControlTransport>(
        &mut self,
        conn: &DfuConnection<T>,
        plan: ErasePlan,
        next: usize,
        done: u32,
    ) -> Result<(Phase, Progress), DfuError> {
        let total = plan.total();
        let mut done = done;
        if let Some(step) = plan.steps().get(next) {
            match step {
                EraseStep::Erase { address, .. } => {
                    conn.erase_sector(*address)?
                }
                EraseStep::Skip { address, size } => {
                    debug!("Skipping {size} bytes at {address:#010x}")
                }
            }
            done = (done + step.size()).min(total);
        }
        let progress = Progress {
            stage: Stage::Erasing,
            done,
            total,
        };

        let phase = if next + 1 < plan.steps().len() {
            Phase::Erase {
                plan,
                next: next + 1,
                done,
            }
        } else {
            info!(
                "Writing {} bytes at {:#010x}",
                self.total(),
                self.config.start_address
            );
            Phase::Write
        };
        Ok((phase, progress))
    }

    fn write_step<T: ControlTransport>(
        &mut self,
        conn: &DfuConnection<T>,
    ) -> Result<(Phase, Progress), DfuError> {
        let end = (self.sent + self.chunk_size).min(self.firmware.len());
        let addr = self.config.start_address + self.sent as u32;

        // The bootloader drops data sent without a fresh address pointer
        conn.set_address_pointer(addr)?;
        conn.write_chunk(
            &self.firmware[self.sent..end],
            self.config.max_chunk_polls,
        )?;
        debug!("Wrote {} bytes at {addr:#010x}", end - self.sent);
        self.sent = end;

        let progress = Progress {
            stage: Stage::Downloading,
            done: self.sent(),
            total: self.total(),
        };
        let phase = if self.sent < self.firmware.len() {
            Phase::Write
        } else {
            Phase::Manifest
        };
        Ok((phase, progress))
    }

    fn manifest<T: ControlTransport>(
        &mut self,
        conn: &DfuConnection<T>,
    ) -> Result<Phase, DfuError> {
        conn.set_address_pointer(self.config.start_address)?;
        info!("Leaving DFU mode");

        // The device may reset before answering; the image is written
        // either way.
        match conn
            .request_manifestation()
            .and_then(|_| conn.poll_manifestation())
        {
            Ok(st) if st.is_error() => {
                warn!("Manifestation reported {st}, image was written")
            }
            Ok(st) => debug!("Manifestation: {st}"),
            Err(err) => warn!("Lost device during manifestation: {err}"),
        }
        Ok(Phase::Finished)
    }
}

/// Download `firmware` and hand control over to it.
///
/// `progress` is called after every erase step and every chunk. Returns once
/// manifestation has been requested; the device boots on its own.
pub fn download<T, F>(
    conn: &DfuConnection<T>,
    map: &MemoryMap,
    config: &DownloadConfig,
    firmware: &[u8],
    mut progress: F,
) -> Result<(), DfuError>
where
    T: ControlTransport,
    F: FnMut(Progress),
{
    let mut session = TransferSession::new(config.clone(), firmware)
        .map_err(DfuError::preparing)?;
    while !session.is_finished() {
        if let Some(p) = session.step(conn, map)? {
            progress(p);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockDevice, Recorded};
    use crate::{DfuStatusCode, parse_memory_map};

    const BASE: u32 = FLASH_BASE_ADDRESS;

    fn connect(device: MockDevice) -> DfuConnection<MockDevice> {
        DfuConnection::new(device, 2048).with_poll_interval(Duration::ZERO)
    }

    fn run(
        conn: &DfuConnection<MockDevice>,
        config: &DownloadConfig,
        firmware: &[u8],
    ) -> (Result<(), DfuError>, Vec<Progress>) {
        let mut seen = Vec::new();
        let res = download(conn, &MemoryMap::builtin(), config, firmware, |p| {
            seen.push(p)
        });
        (res, seen)
    }

    fn data_lens(conn: &DfuConnection<MockDevice>) -> Vec<usize> {
        conn.transport()
            .log()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Data { len, .. } => Some(len),
                _ => None,
            })
            .collect()
    }

    fn assert_monotonic(progress: &[Progress], stage: Stage, total: u32) {
        let values: Vec<u32> = progress
            .iter()
            .filter(|p| p.stage == stage)
            .map(|p| {
                assert_eq!(p.total, total);
                p.done
            })
            .collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.last(), Some(&total));
    }

    #[test]
    fn test_chunk_sizes() {
        let conn = connect(MockDevice::new());
        let config = DownloadConfig::default()
            .with_erase_first(false)
            .with_chunk_size(4096);
        let (res, progress) = run(&conn, &config, &[0xa5; 10_000]);
        res.unwrap();

        assert_eq!(data_lens(&conn), vec![4096, 4096, 1808]);
        assert_eq!(data_lens(&conn).iter().sum::<usize>(), 10_000);
        assert_monotonic(&progress, Stage::Downloading, 10_000);
    }

    #[test]
    fn test_last_chunk_full() {
        let conn = connect(MockDevice::new());
        let config = DownloadConfig::default().with_erase_first(false);
        run(&conn, &config, &[0; 3 * 2048]).0.unwrap();
        assert_eq!(data_lens(&conn), vec![2048, 2048, 2048]);
    }

    #[test]
    fn test_address_pointer_before_each_chunk() {
        let conn = connect(MockDevice::new());
        let config = DownloadConfig::default()
            .with_erase_first(false)
            .with_chunk_size(1024);
        run(&conn, &config, &[0; 2500]).0.unwrap();

        assert_eq!(
            conn.transport().commands(),
            vec![
                Recorded::SetAddress(BASE),
                Recorded::Data { block: 2, len: 1024 },
                Recorded::SetAddress(BASE + 1024),
                Recorded::Data { block: 2, len: 1024 },
                Recorded::SetAddress(BASE + 2048),
                Recorded::Data { block: 2, len: 452 },
                Recorded::SetAddress(BASE),
                Recorded::Manifest { block: 0 },
            ]
        );
    }

    #[test]
    fn test_end_to_end_64k() {
        let conn = connect(MockDevice::new().with_busy_polls(2));
        let config = DownloadConfig::default().with_chunk_size(4096);
        let (res, progress) = run(&conn, &config, &vec![0x5a; 64 * 1024]);
        res.unwrap();

        let dev = conn.transport();
        assert_eq!(dev.count(|r| matches!(r, Recorded::Erase(_))), 16);
        assert_eq!(dev.count(|r| matches!(r, Recorded::Data { .. })), 16);
        assert_eq!(dev.count(|r| matches!(r, Recorded::Manifest { .. })), 1);
        assert_eq!(
            progress.last(),
            Some(&Progress {
                stage: Stage::Downloading,
                done: 65536,
                total: 65536
            })
        );
        assert_monotonic(&progress, Stage::Erasing, 65536);
        assert_monotonic(&progress, Stage::Downloading, 65536);

        // all erases happen before the first chunk
        let commands = dev.commands();
        let last_erase = commands
            .iter()
            .rposition(|r| matches!(r, Recorded::Erase(_)))
            .unwrap();
        let first_data = commands
            .iter()
            .position(|r| matches!(r, Recorded::Data { .. }))
            .unwrap();
        assert!(last_erase < first_data);
    }

    #[test]
    fn test_unaligned_erase() {
        let conn = connect(MockDevice::new());
        let config = DownloadConfig::default().with_start_address(BASE + 0x10);
        run(&conn, &config, &[1; 10]).0.unwrap();

        let erases: Vec<Recorded> = conn
            .transport()
            .commands()
            .into_iter()
            .filter(|r| matches!(r, Recorded::Erase(_)))
            .collect();
        assert_eq!(erases, vec![Recorded::Erase(BASE)]);
    }

    #[test]
    fn test_erase_progress_with_skips() {
        // first two sectors are writable but not erasable
        let map = parse_memory_map("@Flash /0x90000000/2*4Ke,6*4Kg").unwrap();
        let conn = connect(MockDevice::new());
        let mut progress = Vec::new();
        download(
            &conn,
            &map,
            &DownloadConfig::default(),
            &[0; 0x4000],
            |p| progress.push(p),
        )
        .unwrap();

        let erases: Vec<Recorded> = conn
            .transport()
            .commands()
            .into_iter()
            .filter(|r| matches!(r, Recorded::Erase(_)))
            .collect();
        assert_eq!(
            erases,
            vec![Recorded::Erase(BASE + 0x2000), Recorded::Erase(BASE + 0x3000)]
        );
        assert_eq!(
            progress[0],
            Progress {
                stage: Stage::Erasing,
                done: 0x2000,
                total: 0x4000
            }
        );
        assert_monotonic(&progress, Stage::Erasing, 0x4000);
        assert_monotonic(&progress, Stage::Downloading, 0x4000);
    }

    #[test]
    fn test_read_only_range_rejected() {
        let map = parse_memory_map("@Flash /0x90000000/2*4Ka,6*4Kg").unwrap();
        let conn = connect(MockDevice::new());
        let mut progress = Vec::new();
        let err = download(
            &conn,
            &map,
            &DownloadConfig::default().with_start_address(BASE + 0x1000),
            &[0; 0x2000],
            |p| progress.push(p),
        )
        .unwrap_err();

        assert!(matches!(err.root_cause(), DfuError::NoMemorySegments));
        assert!(progress.is_empty());
        assert!(conn.transport().log().is_empty());
    }

    #[test]
    fn test_clears_latent_error_once() {
        let conn = connect(MockDevice::in_error(DfuStatusCode::ErrWrite));
        let config = DownloadConfig::default().with_erase_first(false);
        run(&conn, &config, &[0; 100]).0.unwrap();

        let commands = conn.transport().commands();
        assert_eq!(
            commands
                .iter()
                .filter(|r| **r == Recorded::ClearStatus)
                .count(),
            1
        );
        assert_eq!(commands[0], Recorded::ClearStatus);
        assert_eq!(commands[1], Recorded::SetAddress(BASE));
    }

    #[test]
    fn test_aborts_leftover_transfer() {
        let conn = connect(MockDevice::in_state(DfuState::DnloadIdle));
        let config = DownloadConfig::default().with_erase_first(false);
        run(&conn, &config, &[0; 100]).0.unwrap();
        assert_eq!(conn.transport().commands()[0], Recorded::Abort);
    }

    #[test]
    fn test_no_erase() {
        let conn = connect(MockDevice::new());
        let config = DownloadConfig::default().with_erase_first(false);
        let (res, progress) = run(&conn, &config, &[0; 5000]);
        res.unwrap();
        assert_eq!(
            conn.transport().count(|r| matches!(r, Recorded::Erase(_))),
            0
        );
        assert!(progress.iter().all(|p| p.stage == Stage::Downloading));
    }

    #[test]
    fn test_write_error_aborts() {
        let conn = connect(MockDevice::new().failing_write_at(1));
        let config = DownloadConfig::default().with_chunk_size(1024);
        let (res, progress) = run(&conn, &config, &[0; 4096]);

        match res.unwrap_err() {
            DfuError::Download {
                stage,
                last_status,
                source,
            } => {
                assert_eq!(stage, Stage::Downloading);
                let st = last_status.unwrap();
                assert_eq!(st.state(), DfuState::Error);
                assert_eq!(st.status(), DfuStatusCode::ErrWrite);
                assert!(matches!(*source, DfuError::Status(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            progress.last().map(|p| (p.stage, p.done)),
            Some((Stage::Downloading, 1024))
        );
        assert_eq!(
            conn.transport()
                .count(|r| matches!(r, Recorded::Manifest { .. })),
            0
        );
    }

    #[test]
    fn test_erase_error_labelled() {
        let conn = connect(MockDevice::new().failing_erase_at(BASE + 0x1000));
        let config = DownloadConfig::default();
        let (res, _) = run(&conn, &config, &[0; 0x3000]);
        let err = res.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Erasing));
        assert!(matches!(err.root_cause(), DfuError::Command { .. }));
        assert_eq!(
            conn.transport()
                .count(|r| matches!(r, Recorded::Data { .. })),
            0
        );
    }

    #[test]
    fn test_stuck_busy_times_out() {
        let conn = connect(MockDevice::new().with_busy_polls(50));
        let config = DownloadConfig::default()
            .with_erase_first(false)
            .with_max_chunk_polls(10);
        let err = run(&conn, &config, &[0; 16]).0.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Downloading));
        assert!(matches!(err.root_cause(), DfuError::Timeout));
    }

    #[test]
    fn test_reset_during_manifestation_is_success() {
        let conn = connect(MockDevice::new().vanishing_on_manifest());
        let config = DownloadConfig::default().with_erase_first(false);
        run(&conn, &config, &[0; 64]).0.unwrap();
        assert_eq!(
            conn.transport()
                .count(|r| matches!(r, Recorded::Manifest { .. })),
            1
        );
    }

    #[test]
    fn test_manifestation_outcomes_are_success() {
        for outcome in [DfuState::Error, DfuState::Idle] {
            let conn =
                connect(MockDevice::new().with_manifest_outcome(outcome));
            let config = DownloadConfig::default().with_erase_first(false);
            let (res, progress) = run(&conn, &config, &[0; 64]);
            res.unwrap();
            assert_eq!(
                conn.transport()
                    .count(|r| matches!(r, Recorded::Manifest { .. })),
                1
            );
            assert_eq!(conn.last_status().map(|st| st.state()), Some(outcome));
            assert_monotonic(&progress, Stage::Downloading, 64);
        }
    }

    #[test]
    fn test_invalid_image_labelled_preparing() {
        let conn = connect(MockDevice::new());
        let err = run(&conn, &DownloadConfig::default(), &[]).0.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Preparing));
        assert!(matches!(err.root_cause(), DfuError::InvalidRequest(_)));
        assert!(conn.transport().log().is_empty());
    }

    #[test]
    fn test_out_of_range_rejected_before_erase() {
        let conn = connect(MockDevice::new());
        let config =
            DownloadConfig::default().with_start_address(BASE + 0x3F_F000);
        let err = run(&conn, &config, &[0; 0x2000]).0.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Preparing));
        assert!(matches!(err.root_cause(), DfuError::NoMemorySegments));
        assert!(conn.transport().log().is_empty());
    }

    #[test]
    fn test_invalid_sessions() {
        let config = DownloadConfig::default();
        assert!(matches!(
            TransferSession::new(config.clone(), &[0u8; 0][..]),
            Err(DfuError::InvalidRequest(_))
        ));
        assert!(matches!(
            TransferSession::new(
                config.clone().with_chunk_size(0),
                &[0u8; 4][..]
            ),
            Err(DfuError::InvalidRequest(_))
        ));
        assert!(matches!(
            TransferSession::new(
                config.with_start_address(0xFFFF_FFF0),
                vec![0u8; 32]
            ),
            Err(DfuError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_session_stages() {
        let conn = connect(MockDevice::new());
        let map = MemoryMap::builtin();
        let config = DownloadConfig::default().with_chunk_size(4096);
        let mut session =
            TransferSession::new(config, vec![0u8; 8192]).unwrap();

        let mut stages = Vec::new();
        while let Some(stage) = session.stage() {
            stages.push(stage);
            session.step(&conn, &map).unwrap();
        }
        assert_eq!(
            stages,
            vec![
                Stage::Preparing,
                Stage::Erasing,
                Stage::Erasing,
                Stage::Downloading,
                Stage::Downloading,
                Stage::Manifesting,
            ]
        );
        assert!(session.is_finished());
        assert!(!session.has_failed());
        assert_eq!(session.sent(), 8192);
        assert_eq!(session.step(&conn, &map).unwrap(), None);
    }

    #[test]
    fn test_failed_session_is_dead() {
        let conn = connect(MockDevice::new().failing_write_at(0));
        let map = MemoryMap::builtin();
        let config = DownloadConfig::default().with_erase_first(false);
        let mut session = TransferSession::new(config, vec![0u8; 100]).unwrap();
        session.step(&conn, &map).unwrap();
        assert!(session.step(&conn, &map).is_err());
        assert!(session.has_failed());
        assert_eq!(session.stage(), None);
    }
}
