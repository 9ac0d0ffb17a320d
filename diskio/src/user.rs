//! 空的驱动模板
//!
//! 移植到新的存储介质时，从这里开始填写。所有操作都直接成功，不访问任何硬件。

use crate::disk_io::{DiskError, DiskIo, DiskResult, DiskStatus, IoctlCmd, IoctlData};

#[derive(Debug, Default)]
pub struct UserDisk;

impl UserDisk {
    pub const fn new() -> Self {
        Self
    }
}

impl DiskIo for UserDisk {
    fn initialize(&self, _lun: u8) -> DiskStatus {
        DiskStatus::empty()
    }

    fn status(&self, _lun: u8) -> DiskStatus {
        DiskStatus::empty()
    }

    fn read(&self, _lun: u8, _buf: &mut [u8], _sector: u64, _count: u32) -> DiskResult<()> {
        Ok(())
    }

    fn write(&self, _lun: u8, _buf: &[u8], _sector: u64, _count: u32) -> DiskResult<()> {
        Ok(())
    }

    fn ioctl(&self, _lun: u8, cmd: IoctlCmd) -> DiskResult<IoctlData> {
        match cmd {
            IoctlCmd::Unknown(_) => Err(DiskError::ParameterError),
            _ => Ok(IoctlData::Done),
        }
    }
}
