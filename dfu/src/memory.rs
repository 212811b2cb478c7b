use std::{fmt, str::FromStr, sync::LazyLock};

use nonempty::NonEmpty;
use regex::Regex;

// Terminals of the DfuSe memory descriptor, e.g.
// "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg"
static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^0[xX]([\da-fA-F]{1,8})U?").expect("valid address regex")
});
static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\*(\d+)([KMB ])([a-g])").expect("valid segment regex")
});

/// Memory map advertised by a DfuSe alternate setting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMap {
    pub name: String,
    pub segments: NonEmpty<MemorySegment>,
}

/// Contiguous run of equally sized sectors, covering `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemorySegment {
    start: u32,
    end: u32,
    sector_size: u32,
    mem_type: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryMapError {
    Syntax {
        position: usize,
        expected: &'static str,
    },
    Overflow {
        position: usize,
    },
    /// Segments out of order or overlapping
    Overlap {
        previous: (u32, u32),
        next: (u32, u32),
    },
}

impl std::error::Error for MemoryMapError {}

impl fmt::Display for MemoryMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMapError::Syntax { position, expected } => {
                write!(f, "expected {} at offset {}", expected, position)
            }
            MemoryMapError::Overflow { position } => {
                write!(
                    f,
                    "segment at offset {} exceeds the address space",
                    position
                )
            }
            MemoryMapError::Overlap { previous, next } => write!(
                f,
                "segment {:#010x}..{:#010x} overlaps or precedes \
                 {:#010x}..{:#010x}",
                next.0,
                next.1,
                previous.0,
                previous.1
            ),
        }
    }
}

impl MemorySegment {
    const READABLE: u8 = 1 << 0;
    const ERASABLE: u8 = 1 << 1;
    const WRITABLE: u8 = 1 << 2;

    pub fn start(&self) -> u32 {
        self.start
    }
    pub fn end(&self) -> u32 {
        self.end
    }
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
    pub fn sectors(&self) -> u32 {
        (self.end - self.start) / self.sector_size
    }
    pub fn readable(&self) -> bool {
        self.mem_type & Self::READABLE != 0
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & Self::ERASABLE != 0
    }
    pub fn writable(&self) -> bool {
        self.mem_type & Self::WRITABLE != 0
    }
    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Start of the sector holding `addr`
    pub fn sector_start(&self, addr: u32) -> u32 {
        addr - (addr - self.start) % self.sector_size
    }

    /// End (exclusive) of the sector holding `addr`
    pub fn sector_end(&self, addr: u32) -> u32 {
        self.sector_start(addr) + self.sector_size
    }
}

impl MemoryMap {
    /// Single-segment map of the board's external flash, used when the
    /// bootloader does not describe its memory
    ///
    /// Same layout as [crate::DEFAULT_MEMORY_DESCRIPTOR].
    pub fn builtin() -> Self {
        MemoryMap {
            name: "Flash".into(),
            segments: NonEmpty::new(MemorySegment {
                start: crate::FLASH_BASE_ADDRESS,
                end: crate::FLASH_BASE_ADDRESS + 1024 * 4096,
                sector_size: 4096,
                mem_type: b'g' & 7,
            }),
        }
    }

    pub fn start(&self) -> u32 {
        self.segments.first().start
    }

    pub fn end(&self) -> u32 {
        self.segments.last().end
    }

    pub fn segment_at(&self, addr: u32) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// First segment starting above `addr`
    pub fn next_segment_after(&self, addr: u32) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.start > addr)
    }

    /// Whether every byte of `[start, end)` is mapped and writable
    pub fn is_writable(&self, start: u32, end: u32) -> bool {
        let mut addr = start;
        while addr < end {
            match self.segment_at(addr) {
                Some(seg) if seg.writable() => addr = seg.end,
                _ => return false,
            }
        }
        true
    }
}

impl FromStr for MemoryMap {
    type Err = MemoryMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_memory_map(s)
    }
}

/// Parse a DfuSe memory descriptor string
///
/// Grammar: `@name/addr/count*size<unit><type>[,...][/addr/...]`.
/// Segments must be in ascending order and must not overlap.
pub fn parse_memory_map(descriptor: &str) -> Result<MemoryMap, MemoryMapError> {
    Parser {
        input: descriptor.trim_end_matches(['\0', ' ', '\r', '\n']),
        pos: 0,
    }
    .memory_map()
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(
        &mut self,
        c: char,
        expected: &'static str,
    ) -> Result<(), MemoryMapError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.syntax(expected))
        }
    }

    fn syntax(&self, expected: &'static str) -> MemoryMapError {
        MemoryMapError::Syntax {
            position: self.pos,
            expected,
        }
    }

    // memory_map := '@'? name block ('/' block)*
    fn memory_map(mut self) -> Result<MemoryMap, MemoryMapError> {
        self.eat('@');
        let name = self.name();
        let mut segments = Vec::new();

        self.expect('/', "'/'")?;
        self.block(&mut segments)?;
        while self.eat('/') {
            if self.at_end() {
                break;
            }
            self.block(&mut segments)?;
        }
        if !self.at_end() {
            return Err(self.syntax("',' or '/'"));
        }

        validate(&segments)?;
        let segments =
            NonEmpty::from_vec(segments).ok_or(self.syntax("segment"))?;
        Ok(MemoryMap { name, segments })
    }

    // name := [^/]*
    fn name(&mut self) -> String {
        let len = self.rest().find('/').unwrap_or(self.rest().len());
        let name = self.rest()[..len].trim().to_string();
        self.pos += len;
        name
    }

    // block := address '/' segment (',' segment)*
    fn block(
        &mut self,
        out: &mut Vec<MemorySegment>,
    ) -> Result<(), MemoryMapError> {
        let mut addr = self.address()?;
        self.expect('/', "'/'")?;
        loop {
            let segment = self.segment(addr)?;
            addr = segment.end;
            out.push(segment);
            if !self.eat(',') {
                return Ok(());
            }
        }
    }

    fn address(&mut self) -> Result<u32, MemoryMapError> {
        let caps = ADDRESS
            .captures(self.rest())
            .ok_or(self.syntax("hexadecimal address"))?;
        let addr = u32::from_str_radix(&caps[1], 16)
            .map_err(|_| self.syntax("hexadecimal address"))?;
        self.pos += caps[0].len();
        Ok(addr)
    }

    // segment := count '*' size unit type
    fn segment(&mut self, start: u32) -> Result<MemorySegment, MemoryMapError> {
        let caps = SEGMENT
            .captures(self.rest())
            .ok_or(self.syntax("segment (count*size<unit><type>)"))?;
        let overflow = MemoryMapError::Overflow { position: self.pos };

        let count: u32 = caps[1].parse().map_err(|_| overflow.clone())?;
        let size: u32 = caps[2].parse().map_err(|_| overflow.clone())?;
        let multiplier: u32 = match &caps[3] {
            "K" => 1024,
            "M" => 1024 * 1024,
            _ => 1,
        };
        let mem_type = caps[4].as_bytes()[0] & 7;

        if count == 0 || size == 0 {
            return Err(self.syntax("non-zero sector count and size"));
        }
        let sector_size = size.checked_mul(multiplier).ok_or(overflow.clone())?;
        let end = count
            .checked_mul(sector_size)
            .and_then(|len| start.checked_add(len))
            .ok_or(overflow)?;

        self.pos += caps[0].len();
        Ok(MemorySegment {
            start,
            end,
            sector_size,
            mem_type,
        })
    }
}

fn validate(segments: &[MemorySegment]) -> Result<(), MemoryMapError> {
    for pair in segments.windows(2) {
        if pair[1].start < pair[0].end {
            return Err(MemoryMapError::Overlap {
                previous: (pair[0].start, pair[0].end),
                next: (pair[1].start, pair[1].end),
            });
        }
    }
    Ok(())
}
