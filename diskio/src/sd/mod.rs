//! SD卡后端
//!
//! 卡控制器驱动（HAL）通过[`SdHost`]接口接入。有两种传输方式：
//! - [`SdDmaDisk`]：DMA传输，任务挂起等待中断发来的完成事件
//! - [`SdDisk`]：阻塞传输，由控制器驱动自己等待

mod dma;
mod geometry;
mod polling;

pub use dma::{SdDmaDisk, TransferStats};
pub use geometry::query_geometry;
pub use polling::SdDisk;

use crate::config::SD_TIMEOUT;
use crate::disk_io::DiskError;

// 卡的状态机（SD规范中的card state）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Ready,
    Identification,
    Standby,
    // 传输状态：卡空闲，可以接收新的读写命令
    Transfer,
    Sending,
    Receiving,
    Programming,
    Disconnected,
    Error,
}

// 卡的容量信息，每次都从控制器驱动实时读取
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    // 逻辑块（扇区）数量
    pub block_count: u64,
    // 逻辑块大小（字节）
    pub block_size: u32,
    // 擦除块大小（字节）
    pub erase_block_size: u32,
}

// 控制器驱动返回的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    Error,
    Busy,
    Timeout,
}

impl From<HalError> for DiskError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::Timeout => DiskError::Timeout,
            HalError::Error | HalError::Busy => DiskError::HardwareError,
        }
    }
}

/// SD卡控制器驱动需要提供的能力。
///
/// DMA传输到达终止状态（完成或出错）时，控制器驱动要在中断中调用一次
/// 驱动的[`CompletionPort`](crate::completion::CompletionPort)。
/// 被[`SdHost::abort`]中止的传输不再发送完成事件。
pub trait SdHost: Send + Sync {
    // 初始化控制器和卡
    fn init(&self) -> Result<(), HalError>;
    fn card_state(&self) -> CardState;
    fn card_info(&self) -> CardInfo;

    // 阻塞读写，最多等待timeout毫秒
    fn read_blocks(&self, buf: &mut [u8], sector: u64, count: u32, timeout: u64)
        -> Result<(), HalError>;
    fn write_blocks(&self, buf: &[u8], sector: u64, count: u32, timeout: u64)
        -> Result<(), HalError>;

    /// 启动一次DMA读，立即返回。
    ///
    /// # Safety
    ///
    /// 函数返回后DMA仍在写`buf`。调用者必须保证在收到这次传输的完成事件，
    /// 或者[`SdHost::abort`]返回之前，`buf`一直有效且不被其他代码访问。
    /// 只是不再等待并不会让DMA停下来。
    unsafe fn read_blocks_dma(&self, buf: &mut [u8], sector: u64, count: u32)
        -> Result<(), HalError>;

    /// 启动一次DMA写，立即返回。
    ///
    /// # Safety
    ///
    /// 与[`SdHost::read_blocks_dma`]相同，`buf`要保持有效，
    /// 直到收到完成事件或者[`SdHost::abort`]返回。
    unsafe fn write_blocks_dma(&self, buf: &[u8], sector: u64, count: u32)
        -> Result<(), HalError>;

    /// 中止正在进行的DMA传输，没有传输时什么也不做。
    ///
    /// 必须等传输真正停下来才能返回：返回之后，控制器不再访问这次传输的缓冲区，
    /// 也不会再为它发送完成事件。驱动放弃一次传输之前总是先调用它。
    fn abort(&self);
}

// 部署时的配置
#[derive(Debug, Clone, Copy)]
pub struct SdConfig {
    // 等待完成事件、轮询卡状态的超时（毫秒）
    pub timeout: u64,
    // 是否在initialize中初始化控制器。为false时由应用程序负责
    pub init_card: bool,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            timeout: SD_TIMEOUT,
            init_card: false,
        }
    }
}
