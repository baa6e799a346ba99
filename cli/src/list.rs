use udfu::{DfuDevice, MemorySegment, find_dfu_devices, nice_size};

use crate::CliError;

pub(crate) async fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(vid, pid).await?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(&devices);
    }
    Ok(())
}

fn print_segment(prefix: &str, segment: &MemorySegment) {
    let mut page_size = segment.page_size();
    let page_char = if page_size >= 1024 {
        page_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:2} pages of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start_addr(),
        segment.pages(),
        page_size,
        page_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}

fn print_devices(devices: &[DfuDevice]) {
    for device in devices {
        let descriptor = device.descriptor();
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} {}",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            descriptor.manufacturer.as_deref().unwrap_or_default(),
        );
        if let Some(version) = descriptor.firmware_version() {
            println!("  firmware {version}");
        }

        for interface in device.interfaces() {
            println!("  {}", descriptor.summary(interface));
            if let Some(map) = interface.memory_map() {
                println!(
                    "    {} ({}):",
                    map.name,
                    nice_size(map.total_size())
                );
                for segment in map.segments.iter() {
                    print_segment("      ", segment);
                }
            }
        }
    }
}
