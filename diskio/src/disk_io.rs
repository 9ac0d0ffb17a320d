//! 块设备的抽象接口

use crate::config::BLOCK_SIZE;
use core::fmt;

bitflags! {
    // 磁盘状态。为空时表示设备可用
    pub struct DiskStatus: u8 {
        const NOINIT = 0x01;  // 设备未初始化，或者尚未就绪
        const NODISK = 0x02;  // 没有插入介质
        const PROTECT = 0x04; // 介质写保护
    }
}

impl DiskStatus {
    pub fn is_ready(&self) -> bool {
        !self.contains(DiskStatus::NOINIT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// 设备未初始化或未就绪，操作没有触碰硬件
    NotReady,
    /// 等待完成事件或轮询卡状态超时
    Timeout,
    /// 底层驱动报告失败
    HardwareError,
    /// 无法识别的控制码，或者参数不合法
    ParameterError,
    /// 介质写保护
    WriteProtected,
}

impl DiskError {
    /// FatFs风格的`DRESULT`编号，给C语言一侧的胶水代码使用
    pub fn code(&self) -> u8 {
        match self {
            DiskError::HardwareError | DiskError::Timeout => 1,
            DiskError::WriteProtected => 2,
            DiskError::NotReady => 3,
            DiskError::ParameterError => 4,
        }
    }
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DiskError::NotReady => "disk not ready",
            DiskError::Timeout => "disk operation timed out",
            DiskError::HardwareError => "disk hardware error",
            DiskError::ParameterError => "invalid parameter",
            DiskError::WriteProtected => "disk is write protected",
        };
        f.write_str(msg)
    }
}

pub type DiskResult<T> = Result<T, DiskError>;

// ioctl控制码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    // 确保没有挂起的写操作。本层之下没有写缓冲，所以直接成功
    Sync,
    // 扇区总数
    SectorCount,
    // 每个扇区的字节数
    SectorSize,
    // 擦除块的大小（以扇区为单位）
    BlockSize,
    Unknown(u8),
}

impl From<u8> for IoctlCmd {
    fn from(code: u8) -> Self {
        match code {
            0 => IoctlCmd::Sync,
            1 => IoctlCmd::SectorCount,
            2 => IoctlCmd::SectorSize,
            3 => IoctlCmd::BlockSize,
            code => IoctlCmd::Unknown(code),
        }
    }
}

// ioctl的返回数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlData {
    Done,
    SectorCount(u64),
    SectorSize(u16),
    BlockSize(u32),
}

impl IoctlData {
    pub fn value(&self) -> Option<u64> {
        match *self {
            IoctlData::Done => None,
            IoctlData::SectorCount(n) => Some(n),
            IoctlData::SectorSize(n) => Some(n as u64),
            IoctlData::BlockSize(n) => Some(n as u64),
        }
    }
}

/// 每种存储介质的驱动都要实现这个接口。
///
/// `lun`是逻辑单元号，只对USB这样有多个逻辑单元的设备有意义。
/// 同一个设备上同一时刻只能有一个传输在进行，由调用者（文件系统）保证。
pub trait DiskIo: Send + Sync {
    /// 准备好设备，返回设备状态
    fn initialize(&self, lun: u8) -> DiskStatus;
    /// 重新探测设备，返回设备状态
    fn status(&self, lun: u8) -> DiskStatus;
    /// 从`sector`开始读`count`个扇区到`buf`中
    fn read(&self, lun: u8, buf: &mut [u8], sector: u64, count: u32) -> DiskResult<()>;
    /// 把`buf`中的`count`个扇区写到`sector`开始的位置
    fn write(&self, lun: u8, buf: &[u8], sector: u64, count: u32) -> DiskResult<()>;
    fn ioctl(&self, lun: u8, cmd: IoctlCmd) -> DiskResult<IoctlData>;
}

// 检查一次传输的参数，返回要传输的字节数。
// 扇区范围的终点不能溢出，之后逐个扇区计算编号时就不会回绕
pub(crate) fn transfer_len(buf_len: usize, sector: u64, count: u32) -> DiskResult<usize> {
    let len = (count as usize)
        .checked_mul(BLOCK_SIZE)
        .ok_or(DiskError::ParameterError)?;
    if count == 0 || buf_len < len {
        return Err(DiskError::ParameterError);
    }
    sector
        .checked_add(count as u64)
        .ok_or(DiskError::ParameterError)?;
    Ok(len)
}
