use crate::{DfuError, MemoryMap};

/// One step of an erase run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseStep {
    /// Erase the sector starting at `address`
    Erase { address: u32, size: u32 },
    /// Region that cannot (or need not) be erased
    Skip { address: u32, size: u32 },
}

impl EraseStep {
    pub fn address(&self) -> u32 {
        match self {
            EraseStep::Erase { address, .. }
            | EraseStep::Skip { address, .. } => *address,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            EraseStep::Erase { size, .. }
            | EraseStep::Skip { size, .. } => *size,
        }
    }
}

/// Sector-aligned erase of an address range
///
/// The range is widened to whole sectors at both ends. Regions that are not
/// erasable, or not mapped at all, show up as [EraseStep::Skip] so that
/// progress still accounts for them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErasePlan {
    start: u32,
    end: u32,
    steps: Vec<EraseStep>,
}

impl ErasePlan {
    pub fn new(
        map: &MemoryMap,
        start_address: u32,
        length: u32,
    ) -> Result<Self, DfuError> {
        if length == 0 {
            return Ok(ErasePlan {
                start: start_address,
                end: start_address,
                steps: Vec::new(),
            });
        }
        let last = start_address
            .checked_add(length - 1)
            .ok_or(DfuError::InvalidRequest(
                "erase range exceeds the address space",
            ))?;

        let start = map
            .segment_at(start_address)
            .map_or(start_address, |s| s.sector_start(start_address));
        let end = match map.segment_at(last) {
            Some(seg) => seg.sector_end(last),
            None => last.checked_add(1).ok_or(DfuError::InvalidRequest(
                "erase range exceeds the address space",
            ))?,
        };

        let mut steps = Vec::new();
        let mut addr = start;
        while addr < end {
            let step = match map.segment_at(addr) {
                Some(seg) if seg.erasable() => EraseStep::Erase {
                    address: addr,
                    size: seg.sector_size(),
                },
                Some(seg) => EraseStep::Skip {
                    address: addr,
                    size: seg.end().min(end) - addr,
                },
                None => {
                    let next = map
                        .next_segment_after(addr)
                        .map_or(end, |s| s.start().min(end));
                    EraseStep::Skip {
                        address: addr,
                        size: next - addr,
                    }
                }
            };
            addr += step.size();
            steps.push(step);
        }

        Ok(ErasePlan { start, end, steps })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of bytes the plan accounts for, skipped regions included
    pub fn total(&self) -> u32 {
        self.end - self.start
    }

    pub fn steps(&self) -> &[EraseStep] {
        &self.steps
    }

    /// Addresses of the sectors that will actually be erased
    pub fn sectors(&self) -> impl Iterator<Item = u32> + '_ {
        self.steps.iter().filter_map(|step| match step {
            EraseStep::Erase { address, .. } => Some(*address),
            EraseStep::Skip { .. } => None,
        })
    }
}
