use udfu::{
    DfuDevice, DfuError, DfuSession, InterfaceSelector, MemoryMap,
    SessionConfig, nice_size,
};

use crate::CliError;
use crate::progress::ConsoleObserver;

pub(crate) struct ReadOptions {
    pub selector: InterfaceSelector,
    pub start_address: Option<u32>,
    pub length: Option<u32>,
}

pub(crate) async fn upload(
    device: &DfuDevice,
    options: &ReadOptions,
) -> Result<Vec<u8>, CliError> {
    let config = SessionConfig {
        dfuse_address: options.start_address,
        ..SessionConfig::default()
    };
    let mut session =
        DfuSession::connect(device.transport(), &options.selector, config)
            .await?;
    println!("{}", session.summary());

    let length = match options.length {
        Some(length) => Some(length as usize),
        None => match session.memory_map() {
            Some(map) => readable_length(
                map,
                options.start_address.unwrap_or(map.start_address()),
            ),
            // plain DFU: read until the device sends a short block
            None => Some(usize::MAX),
        },
    };
    let Some(length) = length else {
        session.close().await;
        return Err(DfuError::NoMemorySegments.into());
    };
    if length != usize::MAX {
        println!("Reading {}", nice_size(length as u64));
    }

    let observer = ConsoleObserver::default();
    let result = session.upload(length, &observer).await;
    observer.finish();
    session.close().await;
    Ok(result?)
}

/// Bytes from `start` to the end of the readable segments following it.
fn readable_length(map: &MemoryMap, start: u32) -> Option<usize> {
    let segments = map.find_segments(start, u32::MAX);
    let mut end = start;
    for segment in segments.iter() {
        if segment.start_addr() > end || !segment.readable() {
            break;
        }
        end = segment.end_addr();
    }
    (end > start).then(|| (end - start) as usize)
}
