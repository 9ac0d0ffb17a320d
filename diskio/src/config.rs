//! 一些配置
//!
//! 这些常量在部署时确定，对应板级工程里的各个`*_config.h`。

// 扇区的名义大小（字节）。
// 慢速路径的暂存区按它分配；把擦除块大小换算成扇区数时，也用它做除数
pub const BLOCK_SIZE: usize = 512;

// 等待一次操作的最长时间（毫秒）。
// 完成事件的等待、卡状态的轮询都使用这个值
pub const SD_TIMEOUT: u64 = 30 * 1000;

// 完成事件队列的容量。
// 中断可能连续发来几个事件，而任务还来不及取走，所以要留一些余量
pub const QUEUE_SIZE: usize = 10;

// SD卡的DMA要求缓冲区地址按32字节对齐，否则只能走暂存区
pub const DMA_ALIGNMENT: usize = 32;

// 数据缓存的缓存行大小（Cortex-M7为32字节）
pub const CACHE_LINE_SIZE: usize = 32;

// USB主机的DMA要求缓冲区按4字节对齐
pub const USB_DMA_ALIGNMENT: usize = 4;
pub const USB_BLOCK_SIZE: usize = 512;

// 最多可以注册的驱动器数量
pub const MAX_DRIVES: usize = 10;

// SRAM磁盘的默认大小（字节）
pub const SRAM_DISK_SIZE: usize = 32 * 1024;
