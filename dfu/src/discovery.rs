use crate::DfuError;
use crate::protocol::*;

/// One alternate setting from a device's configuration descriptors
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AltSettingInfo {
    pub config: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Interface string (`iInterface`), if the device provides one
    pub name: Option<String>,
}

/// Which side of the detach/attach cycle a DFU interface belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuMode {
    /// Application firmware exposing `DFU_DETACH` only
    Runtime,
    /// Bootloader accepting downloads
    Dfu,
}

/// DFU-capable alternate setting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuAltSetting {
    pub config: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub mode: DfuMode,
    pub name: Option<String>,
}

impl AltSettingInfo {
    pub fn dfu_mode(&self) -> Option<DfuMode> {
        if self.class != DFU_CLASS || self.subclass != DFU_SUBCLASS {
            return None;
        }
        match self.protocol {
            DFU_PROTOCOL_RUNTIME => Some(DfuMode::Runtime),
            DFU_PROTOCOL_DFU_MODE => Some(DfuMode::Dfu),
            _ => None,
        }
    }
}

/// Keep the DFU-capable alternate settings, in descriptor order.
pub fn find_dfu_alt_settings(tree: &[AltSettingInfo]) -> Vec<DfuAltSetting> {
    tree.iter()
        .filter_map(|alt| {
            Some(DfuAltSetting {
                config: alt.config,
                interface: alt.interface,
                alt_setting: alt.alt_setting,
                mode: alt.dfu_mode()?,
                name: alt.name.clone(),
            })
        })
        .collect()
}

/// Like [find_dfu_alt_settings], failing when nothing matches.
pub fn discover(
    tree: &[AltSettingInfo],
) -> Result<Vec<DfuAltSetting>, DfuError> {
    let found = find_dfu_alt_settings(tree);
    if found.is_empty() {
        Err(DfuError::NotInProgrammingMode)
    } else {
        Ok(found)
    }
}
