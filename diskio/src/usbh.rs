//! USB大容量存储设备（U盘）
//!
//! USB主机协议栈由应用程序初始化，这里只通过[`MscHost`]读写逻辑单元。
//! 传输失败时，根据设备返回的SCSI sense数据判断是未就绪、写保护还是其他错误。

use crate::config::{BLOCK_SIZE, USB_BLOCK_SIZE, USB_DMA_ALIGNMENT};
use crate::disk_io::{
    transfer_len, DiskError, DiskIo, DiskResult, DiskStatus, IoctlCmd, IoctlData,
};
use crate::scratch::{is_aligned, ScratchBuffer};
use spin::Mutex;

// SCSI附加sense码（ASC）
pub const SCSI_ASC_LOGICAL_UNIT_NOT_READY: u8 = 0x04;
pub const SCSI_ASC_WRITE_PROTECTED: u8 = 0x27;
pub const SCSI_ASC_NOT_READY_TO_READY_CHANGE: u8 = 0x28;
pub const SCSI_ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

// 逻辑单元的信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LunInfo {
    pub block_count: u64,
    pub block_size: u32,
    // 最近一次失败的命令留下的sense数据
    pub sense: SenseData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbhError {
    Fail,
    Busy,
    NotSupported,
    Unrecovered,
}

// USB主机协议栈中大容量存储类（MSC）提供的能力
pub trait MscHost: Send + Sync {
    fn unit_is_ready(&self, lun: u8) -> bool;
    // 主机控制器是否使用DMA
    fn uses_dma(&self) -> bool;
    fn read(&self, lun: u8, sector: u64, buf: &mut [u8], count: u32) -> Result<(), UsbhError>;
    fn write(&self, lun: u8, sector: u64, buf: &[u8], count: u32) -> Result<(), UsbhError>;
    fn lun_info(&self, lun: u8) -> Result<LunInfo, UsbhError>;
}

pub struct UsbDisk<H> {
    host: H,
    scratch: Mutex<ScratchBuffer>,
}

impl<H: MscHost> UsbDisk<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            scratch: Mutex::new(ScratchBuffer::new()),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    // 主机使用DMA时，缓冲区要按4字节对齐，否则经过暂存区逐个扇区传输
    fn needs_staging(&self, buf: &[u8]) -> bool {
        self.host.uses_dma() && !is_aligned(buf.as_ptr(), USB_DMA_ALIGNMENT)
    }

    // 根据sense数据解释失败的原因
    fn failure(&self, lun: u8, writing: bool) -> DiskError {
        let info = match self.host.lun_info(lun) {
            Ok(info) => info,
            Err(_) => return DiskError::HardwareError,
        };
        match info.sense.asc {
            SCSI_ASC_WRITE_PROTECTED if writing => {
                warn!("usb: disk is write protected");
                DiskError::WriteProtected
            }
            SCSI_ASC_LOGICAL_UNIT_NOT_READY
            | SCSI_ASC_MEDIUM_NOT_PRESENT
            | SCSI_ASC_NOT_READY_TO_READY_CHANGE => {
                warn!("usb: disk is not ready");
                DiskError::NotReady
            }
            _ => DiskError::HardwareError,
        }
    }
}

impl<H: MscHost> DiskIo for UsbDisk<H> {
    // USB主机协议栈由应用程序初始化
    fn initialize(&self, _lun: u8) -> DiskStatus {
        DiskStatus::empty()
    }

    fn status(&self, lun: u8) -> DiskStatus {
        if self.host.unit_is_ready(lun) {
            DiskStatus::empty()
        } else {
            DiskStatus::NOINIT
        }
    }

    fn read(&self, lun: u8, buf: &mut [u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        let buf = &mut buf[..len];
        let result = if self.needs_staging(buf) {
            let mut scratch = self.scratch.lock();
            buf.chunks_exact_mut(BLOCK_SIZE)
                .enumerate()
                .try_for_each(|(i, chunk)| {
                    // transfer_len已经排除了回绕的扇区范围
                    self.host.read(lun, sector + i as u64, scratch.as_mut_slice(), 1)?;
                    chunk.copy_from_slice(scratch.as_slice());
                    Ok::<(), UsbhError>(())
                })
        } else {
            self.host.read(lun, sector, buf, count)
        };
        result.map_err(|_| self.failure(lun, false))
    }

    fn write(&self, lun: u8, buf: &[u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        let buf = &buf[..len];
        let result = if self.needs_staging(buf) {
            let mut scratch = self.scratch.lock();
            buf.chunks_exact(BLOCK_SIZE)
                .enumerate()
                .try_for_each(|(i, chunk)| {
                    scratch.as_mut_slice().copy_from_slice(chunk);
                    self.host.write(lun, sector + i as u64, scratch.as_slice(), 1)
                })
        } else {
            self.host.write(lun, sector, buf, count)
        };
        result.map_err(|_| self.failure(lun, true))
    }

    fn ioctl(&self, lun: u8, cmd: IoctlCmd) -> DiskResult<IoctlData> {
        let info = || self.host.lun_info(lun).map_err(|_| DiskError::HardwareError);
        match cmd {
            IoctlCmd::Sync => Ok(IoctlData::Done),
            IoctlCmd::SectorCount => Ok(IoctlData::SectorCount(info()?.block_count)),
            IoctlCmd::SectorSize => u16::try_from(info()?.block_size)
                .map(IoctlData::SectorSize)
                .map_err(|_| DiskError::HardwareError),
            IoctlCmd::BlockSize => Ok(IoctlData::BlockSize(
                info()?.block_size / USB_BLOCK_SIZE as u32,
            )),
            IoctlCmd::Unknown(_) => Err(DiskError::ParameterError),
        }
    }
}
