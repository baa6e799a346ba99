//! STM32 DfuSe extension (AN3156).
//!
//! Addresses are set with a SET_ADDRESS_POINTER command sent as block 0.
//! Data blocks start at block 2 and land at
//! `pointer + (block - 2) * transfer_size`.

use log::{debug, info};

use crate::connection::{Completion, DfuConnection};
use crate::error::DfuError;
use crate::memory::{MemoryMap, RegionOperation};
use crate::request::{DFUSE_CMD_ERASE, DFUSE_CMD_SET_ADDRESS, dfuse_command};
use crate::status::DfuState;
use crate::transport::DfuTransport;

const FIRST_DATA_BLOCK: u16 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Erase { page: usize, pages: usize, address: u32 },
    Write { done: usize, total: usize },
    Read { done: usize, total: usize },
}

/// Element of a DfuSe image: a payload and the address it is written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageElement {
    pub address: u32,
    pub data: Vec<u8>,
}

pub struct DfuseConnection<T: DfuTransport> {
    inner: DfuConnection<T>,
    memory: MemoryMap,
}

impl<T: DfuTransport> DfuseConnection<T> {
    pub fn new(inner: DfuConnection<T>, memory: MemoryMap) -> Self {
        Self { inner, memory }
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.memory
    }

    pub fn connection(&self) -> &DfuConnection<T> {
        &self.inner
    }

    pub fn connection_mut(&mut self) -> &mut DfuConnection<T> {
        &mut self.inner
    }

    pub fn into_inner(self) -> DfuConnection<T> {
        self.inner
    }

    pub async fn set_address_pointer(
        &mut self,
        address: u32,
    ) -> Result<(), DfuError> {
        debug!("set address pointer {address:#010x}");
        self.command(DFUSE_CMD_SET_ADDRESS, address).await
    }

    pub async fn erase_page(&mut self, address: u32) -> Result<(), DfuError> {
        self.memory.check(address, 1, RegionOperation::Erase)?;
        debug!("erase page {address:#010x}");
        self.command(DFUSE_CMD_ERASE, address).await
    }

    async fn command(&mut self, cmd: u8, address: u32) -> Result<(), DfuError> {
        if self.inner.state() == DfuState::DfuUploadIdle {
            self.inner.abort_to_idle().await?;
        }
        self.inner
            .dnload_block(0, &dfuse_command(cmd, address))
            .await?;
        Ok(())
    }

    /// Erase every page touched by `[start, start + len)`, lowest first.
    pub async fn erase_range(
        &mut self,
        start: u32,
        len: usize,
        progress: impl FnMut(Progress),
    ) -> Result<(), DfuError> {
        let pages = self.memory.erase_pages(start, len)?;
        self.erase_all(&pages, progress).await
    }

    async fn erase_all(
        &mut self,
        pages: &[u32],
        mut progress: impl FnMut(Progress),
    ) -> Result<(), DfuError> {
        for (i, address) in pages.iter().copied().enumerate() {
            self.inner.check_cancelled().await?;
            self.erase_page(address).await?;
            progress(Progress::Erase {
                page: i + 1,
                pages: pages.len(),
                address,
            });
        }
        Ok(())
    }

    /// Write `data` at `start`. The range must be writable; it is not
    /// erased first.
    pub async fn write_range(
        &mut self,
        start: u32,
        data: &[u8],
        mut progress: impl FnMut(Progress),
    ) -> Result<(), DfuError> {
        let parts = self.memory.split(start, data)?;
        let xfer = usize::from(self.inner.transfer_size());
        let mut done = 0;
        for (address, part) in parts {
            self.set_address_pointer(address).await?;
            let mut block = FIRST_DATA_BLOCK;
            let mut block_addr = address;
            for chunk in part.chunks(xfer) {
                self.inner.check_cancelled().await?;
                if block == u16::MAX {
                    self.set_address_pointer(block_addr).await?;
                    block = FIRST_DATA_BLOCK;
                }
                self.inner.dnload_block(block, chunk).await?;
                block += 1;
                block_addr += chunk.len() as u32;
                done += chunk.len();
                progress(Progress::Write {
                    done,
                    total: data.len(),
                });
            }
        }
        Ok(())
    }

    /// Read `len` bytes starting at `start`.
    pub async fn upload_range(
        &mut self,
        start: u32,
        len: usize,
        mut progress: impl FnMut(Progress),
    ) -> Result<Vec<u8>, DfuError> {
        self.memory.check(start, len, RegionOperation::Read)?;
        self.set_address_pointer(start).await?;
        // UPLOAD is only accepted from dfuIDLE
        self.inner.abort_to_idle().await?;
        self.inner
            .upload_blocks(FIRST_DATA_BLOCK, len, |done| {
                progress(Progress::Read { done, total: len })
            })
            .await
    }

    /// Jump to `address` and leave DFU mode.
    ///
    /// The device starts the application instead of returning to
    /// `dfuIDLE`, so only one GETSTATUS is issued whatever the functional
    /// descriptor says about manifestation tolerance. A device that is
    /// already gone by then counts as having left.
    pub async fn leave(
        &mut self,
        address: u32,
    ) -> Result<Completion, DfuError> {
        self.set_address_pointer(address).await?;
        info!("leaving DFU mode at {address:#010x}");
        self.inner.finish_download(0, false).await
    }

    /// Erase, write and leave for a single contiguous image.
    pub async fn download_image(
        &mut self,
        start: u32,
        data: &[u8],
        progress: impl FnMut(Progress),
    ) -> Result<Completion, DfuError> {
        let element = ImageElement {
            address: start,
            data: data.to_vec(),
        };
        self.download_elements(std::slice::from_ref(&element), progress)
            .await
    }

    /// Program every element, then leave at the first element's address.
    ///
    /// All ranges are checked for write access before the first transfer.
    /// Pages of every element are erased up front in ascending order, each
    /// page once. Segments that cannot be erased are written without an
    /// erase.
    pub async fn download_elements(
        &mut self,
        elements: &[ImageElement],
        mut progress: impl FnMut(Progress),
    ) -> Result<Completion, DfuError> {
        let first = elements
            .iter()
            .find(|e| !e.data.is_empty())
            .ok_or_else(|| DfuError::UnsupportedImage("empty image".into()))?;
        let mut pages = Vec::new();
        for element in elements {
            self.memory.check(
                element.address,
                element.data.len(),
                RegionOperation::Write,
            )?;
            pages.extend(
                self.memory
                    .erasable_pages(element.address, element.data.len()),
            );
        }
        pages.sort_unstable();
        pages.dedup();

        self.erase_all(&pages, &mut progress).await?;
        let total: usize = elements.iter().map(|e| e.data.len()).sum();
        let mut written = 0;
        for element in elements {
            self.write_range(element.address, &element.data, |p| {
                if let Progress::Write { done, .. } = p {
                    progress(Progress::Write {
                        done: written + done,
                        total,
                    });
                }
            })
            .await?;
            written += element.data.len();
        }
        self.leave(first.address).await
    }
}
