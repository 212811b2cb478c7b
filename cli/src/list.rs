use dfuse::{
    DfuDevice, DfuInterface, DfuMode, LayoutSource, MemorySegment,
    find_dfu_devices,
};

use crate::CliError;

pub(crate) fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(&devices);
    }
    Ok(())
}

fn print_segment(prefix: &str, segment: &MemorySegment) {
    let mut sector_size = segment.sector_size();
    let size_char = if sector_size >= 1024 * 1024 {
        sector_size /= 1024 * 1024;
        "M"
    } else if sector_size >= 1024 {
        sector_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:4} sectors of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start(),
        segment.sectors(),
        sector_size,
        size_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}

fn print_interface(interface: &DfuInterface) {
    let mode = match interface.mode() {
        DfuMode::Runtime => "run-time",
        DfuMode::Dfu => "dfu",
    };
    println!(
        "  {} (intf={}, alt={}, mode={}):",
        interface.name().unwrap_or("<unnamed>"),
        interface.interface(),
        interface.alt_setting(),
        mode,
    );
    let Some(layout) = interface.layout() else {
        return;
    };
    if interface.layout_source() == Some(LayoutSource::BuiltIn) {
        println!("    {} (built-in map)", layout.name);
    }
    for segment in &layout.segments {
        print_segment("    ", segment);
    }
}

fn print_devices(devices: &[DfuDevice]) {
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} {} (dfuse={})",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            device.product_string().unwrap_or_default(),
            device.is_dfuse(),
        );

        for interface in device.interfaces() {
            print_interface(interface);
        }
    }
}
