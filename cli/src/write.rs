use std::thread;

use dfufile::{DfuFile, ElementRangeIterator, Payload, verify_crc};
use futures::{StreamExt, executor::block_on};
use log::{debug, warn};
use nusb::hotplug::HotplugEvent;
use udfu::{
    DfuDevice, DfuMode, DfuSession, FirmwareImage, ImageElement,
    InterfaceSelector, Liveness, SessionConfig,
};

use crate::CliError;
use crate::progress::ConsoleObserver;

pub(crate) struct WriteOptions {
    pub selector: InterfaceSelector,
    pub start_address: Option<u32>,
    pub transfer_size: Option<u16>,
    pub retries: u32,
    pub reset: bool,
    pub force: bool,
}

pub(crate) async fn download(
    data: &[u8],
    device: &DfuDevice,
    options: &WriteOptions,
) -> Result<(), CliError> {
    let file = DfuFile::decode(data)?;
    if let Some(suffix) = &file.suffix {
        if !options.force
            && !suffix.matches(device.vendor_id(), device.product_id())
        {
            return Err(CliError::WrongDevice {
                vid: suffix.vendor_id,
                pid: suffix.product_id,
            });
        }
        if let Err(err) = verify_crc(data) {
            warn!("{err}");
            println!("Warning: {err}");
        }
    }
    let (selector, image) = prepare_image(device, &file, &options.selector)?;

    let config = SessionConfig {
        max_retries: options.retries,
        transfer_size: options.transfer_size,
        reset_after_update: options.reset,
        dfuse_address: options.start_address,
        ..SessionConfig::default()
    };
    let mut session =
        DfuSession::connect(device.transport(), &selector, config).await?;
    println!("{}", session.summary());
    if let Some(map) = session.memory_map() {
        println!("{map}");
    }
    watch_disconnect(device, session.liveness());

    let observer = ConsoleObserver::default();
    let result = session.perform_update(&image, &observer).await;
    observer.finish();
    session.close().await;

    let report = result?;
    println!(
        "Wrote {} bytes ({} attempt{})",
        report.bytes,
        report.attempts,
        if report.attempts == 1 { "" } else { "s" }
    );
    Ok(())
}

/// Pick the image to download and, for DfuSe files, the alternate setting
/// it belongs to.
fn prepare_image(
    device: &DfuDevice,
    file: &DfuFile,
    selector: &InterfaceSelector,
) -> Result<(InterfaceSelector, FirmwareImage), CliError> {
    let targets = match &file.payload {
        Payload::Raw(data) => {
            return Ok((selector.clone(), FirmwareImage::Raw(data.clone())));
        }
        Payload::Dfuse(targets) => targets,
    };

    let alt = match selector {
        InterfaceSelector::Setting { alt_setting, .. } => Some(*alt_setting),
        _ => None,
    };
    let target = file.target(alt).ok_or(CliError::NoTarget(alt))?;
    if targets.len() > 1 {
        println!(
            "Using target alt={} of {}",
            target.alt_setting,
            targets.len()
        );
    }
    let elements = ElementRangeIterator::new(&target.elements)
        .map(|e| ImageElement {
            address: e.address,
            data: e.data,
        })
        .collect();

    let selector = if *selector == InterfaceSelector::First {
        device
            .interfaces()
            .iter()
            .find(|i| {
                i.alt_setting == target.alt_setting && i.mode() == DfuMode::Dfu
            })
            .map(|i| InterfaceSelector::Setting {
                interface: i.interface,
                alt_setting: i.alt_setting,
            })
            .unwrap_or_default()
    } else {
        selector.clone()
    };
    Ok((selector, FirmwareImage::Elements(elements)))
}

/// Flag the session as disconnected as soon as the device leaves the bus,
/// so it stops issuing requests.
fn watch_disconnect(device: &DfuDevice, liveness: Liveness) {
    let id = device.id();
    let mut watch = match nusb::watch_devices() {
        Ok(watch) => watch,
        Err(err) => {
            warn!("cannot watch for hotplug events: {err}");
            return;
        }
    };
    thread::spawn(move || {
        block_on(async {
            while let Some(event) = watch.next().await {
                if let HotplugEvent::Disconnected(dev) = event
                    && dev == id
                {
                    debug!("device {id:?} left the bus");
                    liveness.mark_disconnected();
                    break;
                }
            }
        })
    });
}
