//! 容量查询

use super::SdHost;
use crate::config::BLOCK_SIZE;
use crate::disk_io::{DiskError, DiskResult, IoctlCmd, IoctlData};

// 回答ioctl的几个容量查询。卡的信息每次都重新读取，不做缓存
pub fn query_geometry<H: SdHost + ?Sized>(host: &H, cmd: IoctlCmd) -> DiskResult<IoctlData> {
    match cmd {
        IoctlCmd::Sync => Ok(IoctlData::Done),
        IoctlCmd::SectorCount => Ok(IoctlData::SectorCount(host.card_info().block_count)),
        IoctlCmd::SectorSize => u16::try_from(host.card_info().block_size)
            .map(IoctlData::SectorSize)
            .map_err(|_| DiskError::HardwareError),
        // 擦除块大小按名义扇区大小换算成扇区数
        IoctlCmd::BlockSize => Ok(IoctlData::BlockSize(
            host.card_info().erase_block_size / BLOCK_SIZE as u32,
        )),
        IoctlCmd::Unknown(_) => Err(DiskError::ParameterError),
    }
}
