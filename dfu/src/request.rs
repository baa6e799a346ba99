//! Class specific request codes (DFU 1.1 table 3.2) and DfuSe commands
//! (AN3156 section 6).

pub const DFU_DETACH: u8 = 0;
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_UPLOAD: u8 = 2;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;
pub const DFU_ABORT: u8 = 6;

/// Sent as the payload of a block 0 DNLOAD
pub const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;
pub const DFUSE_CMD_ERASE: u8 = 0x41;

pub(crate) fn dfuse_command(cmd: u8, address: u32) -> [u8; 5] {
    let a = address.to_le_bytes();
    [cmd, a[0], a[1], a[2], a[3]]
}
