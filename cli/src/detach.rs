use dfuse::DfuDevice;

use crate::CliError;

pub(crate) fn detach(device: &DfuDevice) -> Result<(), CliError> {
    if device.in_programming_mode() {
        println!("Device is already in programming mode");
        return Ok(());
    }
    println!("Detaching...");
    device.detach()?;
    println!("Done, the device should re-enumerate in programming mode");
    Ok(())
}
