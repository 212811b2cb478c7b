use log::{debug, warn};

use crate::{
    AltSettingInfo, DfuAltSetting, DfuError, DfuMode, MemoryMap,
    MemoryMapError, discover, parse_memory_map,
};

/// Where the memory map of an interface comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutSource {
    /// Parsed from the interface string
    Descriptor,
    /// Interface string missing or unparsable, [MemoryMap::builtin] is used
    BuiltIn,
}

#[derive(Clone, Debug)]
pub struct DfuInterface {
    config: u8,
    interface: u8,
    alt_setting: u8,
    mode: DfuMode,
    name: Option<String>,
    layout: Option<(MemoryMap, LayoutSource)>,
}

impl DfuInterface {
    /// Resolve the memory map of a discovered alternate setting.
    ///
    /// Only interfaces in DFU mode carry a memory map. A map that parses but
    /// has overlapping segments is rejected.
    pub fn new(alt: DfuAltSetting) -> Result<Self, DfuError> {
        let layout = match alt.mode {
            DfuMode::Dfu => Some(resolve_layout(alt.name.as_deref())?),
            DfuMode::Runtime => None,
        };
        Ok(Self {
            config: alt.config,
            interface: alt.interface,
            alt_setting: alt.alt_setting,
            mode: alt.mode,
            name: alt.name,
            layout,
        })
    }

    pub fn config(&self) -> u8 {
        self.config
    }
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    pub fn mode(&self) -> DfuMode {
        self.mode
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn layout(&self) -> Option<&MemoryMap> {
        self.layout.as_ref().map(|(map, _)| map)
    }
    pub fn layout_source(&self) -> Option<LayoutSource> {
        self.layout.as_ref().map(|(_, source)| *source)
    }

    /// Whether `[start, start + length)` can be written through this interface
    pub fn accepts(&self, start: u32, length: u32) -> bool {
        let Some(map) = self.layout() else {
            return false;
        };
        match start.checked_add(length) {
            Some(end) => map.is_writable(start, end),
            None => false,
        }
    }
}

/// DFU interfaces of one device, from its flattened descriptor tree
///
/// Fails when no alternate setting is DFU-capable, or when one of them
/// advertises an inconsistent memory map.
pub(crate) fn dfu_interfaces(
    tree: &[AltSettingInfo],
) -> Result<Vec<DfuInterface>, DfuError> {
    discover(tree)?.into_iter().map(DfuInterface::new).collect()
}

pub(crate) fn resolve_layout(
    descriptor: Option<&str>,
) -> Result<(MemoryMap, LayoutSource), DfuError> {
    match descriptor.map(parse_memory_map) {
        Some(Ok(map)) => {
            debug!(
                "Memory map \"{}\": {} segment(s)",
                map.name,
                map.segments.len()
            );
            Ok((map, LayoutSource::Descriptor))
        }
        Some(Err(err @ MemoryMapError::Overlap { .. })) => {
            Err(DfuError::InvalidMemoryMap(err))
        }
        Some(Err(err)) => {
            warn!("Unparsable memory descriptor ({err}), using built-in map");
            Ok((MemoryMap::builtin(), LayoutSource::BuiltIn))
        }
        None => {
            warn!("No memory descriptor, using built-in map");
            Ok((MemoryMap::builtin(), LayoutSource::BuiltIn))
        }
    }
}
