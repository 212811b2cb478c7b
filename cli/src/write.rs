use std::io::{self, Write};

use dfuse::{DfuDevice, DfuError, DfuStatus, DownloadConfig, Progress, Stage};

use crate::CliError;

const BAR_WIDTH: u64 = 60;

pub(crate) fn download(
    data: &[u8],
    device: &DfuDevice,
    config: &DownloadConfig,
) -> Result<(), CliError> {
    println!(
        "Writing {} bytes @ 0x{:08x}{}",
        data.len(),
        config.start_address,
        if config.erase_first { "" } else { " (no erase)" }
    );

    let mut current: Option<Stage> = None;
    let res = device.download(config, data, |progress| {
        if current != Some(progress.stage) {
            if current.is_some() {
                println!();
            }
            current = Some(progress.stage);
        }
        print_progress(&progress);
    });
    if current.is_some() {
        println!();
    }

    match res {
        Ok(()) => {
            println!("Done, the device is booting the new firmware");
            Ok(())
        }
        Err(err) => {
            if let Some(status) = err_status(&err) {
                eprintln!("Last device status: {status}");
            }
            Err(err.into())
        }
    }
}

fn err_status(err: &DfuError) -> Option<DfuStatus> {
    match err {
        DfuError::Download { last_status, .. } => *last_status,
        _ => None,
    }
}

fn print_progress(progress: &Progress) {
    let done = progress.done as u64;
    let total = (progress.total as u64).max(1);
    let percentage = (100 * done) / total;
    let filled = ((BAR_WIDTH * done) / total) as usize;
    let label = match progress.stage {
        Stage::Erasing => "Erasing ",
        _ => "Flashing",
    };
    print!(
        "\r  {} {:3}% [{}]",
        label,
        percentage,
        "#".repeat(filled) + &" ".repeat(BAR_WIDTH as usize - filled)
    );
    let _ = io::stdout().flush();
}
