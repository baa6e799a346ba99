use std::time::{Duration, Instant};

use udfu::{
    DfuMode, DfuSession, InterfaceSelector, SessionConfig, find_dfu_devices,
    wait_for_device,
};

use crate::CliError;

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn detach_cmd(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(vid, pid).await?;
    let Some((device, index)) = devices.iter().find_map(|d| {
        d.interfaces()
            .iter()
            .position(|i| i.mode() == DfuMode::Runtime)
            .map(|index| (d, index))
    }) else {
        if devices.is_empty() {
            return Err(CliError::NoDFUDevice);
        }
        println!("Device is already in DFU mode");
        return Ok(());
    };

    let mut session = DfuSession::connect(
        device.transport(),
        &InterfaceSelector::Index(index),
        SessionConfig::default(),
    )
    .await?;
    println!("{}", session.summary());

    println!("Detaching...");
    let result = session.detach().await;
    session.close().await;
    result?;

    println!("Waiting for device to reconnect...");
    let start = Instant::now();
    let vid = vid.or(Some(device.vendor_id()));
    let device = wait_for_device(vid, pid, RECONNECT_TIMEOUT).await?;
    println!("Reconnected in {:?}", start.elapsed());
    for intf in device.interfaces() {
        println!("{}", device.descriptor().summary(intf));
    }
    Ok(())
}
