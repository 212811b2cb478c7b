use dfuse::{DfuDevice, DfuError, DfuMode};

use crate::CliError;

pub(crate) fn show_status(device: &DfuDevice) -> Result<(), CliError> {
    let intf = device
        .interfaces()
        .iter()
        .find(|intf| intf.mode() == DfuMode::Dfu)
        .ok_or(DfuError::NotInProgrammingMode)?;
    let connection = device.connect(intf.interface(), intf.alt_setting())?;
    let status = connection.get_status()?;
    println!(
        "Interface {} alt {}: {} (poll timeout {:?})",
        intf.interface(),
        intf.alt_setting(),
        status,
        status.poll_timeout(),
    );
    Ok(())
}
