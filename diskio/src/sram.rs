//! 片上RAM模拟的磁盘
//!
//! 掉电后数据丢失，适合做临时文件系统。可以使用堆上分配的内存，
//! 也可以直接使用链接脚本划出的一段静态内存。

use crate::config::{BLOCK_SIZE, SRAM_DISK_SIZE};
use crate::disk_io::{
    transfer_len, DiskError, DiskIo, DiskResult, DiskStatus, IoctlCmd, IoctlData,
};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use spin::Mutex;

pub struct RamDisk<M = Vec<u8>> {
    mem: Mutex<M>,
}

impl RamDisk<Vec<u8>> {
    pub fn new(size: usize) -> Self {
        Self::from_region(vec![0; size])
    }
}

impl Default for RamDisk<Vec<u8>> {
    fn default() -> Self {
        Self::new(SRAM_DISK_SIZE)
    }
}

impl<M> RamDisk<M>
where
    M: AsRef<[u8]> + AsMut<[u8]> + Send,
{
    // 使用一段现成的内存，比如`&'static mut [u8]`
    pub fn from_region(region: M) -> Self {
        Self {
            mem: Mutex::new(region),
        }
    }

    pub fn size(&self) -> usize {
        self.mem.lock().as_ref().len()
    }

    // 要访问的字节范围。超出磁盘大小时返回参数错误
    fn range(&self, sector: u64, len: usize) -> DiskResult<Range<usize>> {
        let start = usize::try_from(sector)
            .ok()
            .and_then(|sector| sector.checked_mul(BLOCK_SIZE))
            .ok_or(DiskError::ParameterError)?;
        let end = start.checked_add(len).ok_or(DiskError::ParameterError)?;
        if end > self.size() {
            return Err(DiskError::ParameterError);
        }
        Ok(start..end)
    }
}

impl<M> DiskIo for RamDisk<M>
where
    M: AsRef<[u8]> + AsMut<[u8]> + Send,
{
    // 清零整个磁盘
    fn initialize(&self, _lun: u8) -> DiskStatus {
        self.mem.lock().as_mut().fill(0);
        DiskStatus::empty()
    }

    fn status(&self, _lun: u8) -> DiskStatus {
        DiskStatus::empty()
    }

    fn read(&self, _lun: u8, buf: &mut [u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        let range = self.range(sector, len)?;
        buf[..len].copy_from_slice(&self.mem.lock().as_ref()[range]);
        Ok(())
    }

    fn write(&self, _lun: u8, buf: &[u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        let range = self.range(sector, len)?;
        self.mem.lock().as_mut()[range].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn ioctl(&self, _lun: u8, cmd: IoctlCmd) -> DiskResult<IoctlData> {
        match cmd {
            IoctlCmd::Sync => Ok(IoctlData::Done),
            IoctlCmd::SectorCount => Ok(IoctlData::SectorCount((self.size() / BLOCK_SIZE) as u64)),
            IoctlCmd::SectorSize => Ok(IoctlData::SectorSize(BLOCK_SIZE as u16)),
            IoctlCmd::BlockSize => Ok(IoctlData::BlockSize(1)),
            IoctlCmd::Unknown(_) => Err(DiskError::ParameterError),
        }
    }
}
