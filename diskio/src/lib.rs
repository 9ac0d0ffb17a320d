//! 块设备抽象层
//!
//! 文件系统通过统一的[`DiskIo`]接口读写扇区，而不关心底层介质：
//! - [`sd::SdDmaDisk`]：SD卡，DMA传输，在RTOS中等待中断发来的完成事件
//! - [`sd::SdDisk`]：SD卡，阻塞（轮询）传输
//! - [`sram::RamDisk`]：片上RAM模拟的磁盘
//! - [`usbh::UsbDisk`]：USB大容量存储设备
//! - [`user::UserDisk`]：空的模板驱动
//!
//! 驱动通过[`registry`]注册，得到一个[`DiskHandle`]，文件系统再通过句柄访问它。
#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod cache;
pub mod completion;
pub mod config;
mod disk_io;
pub mod poller;
pub mod registry;
pub mod rtos;
pub mod scratch;
pub mod sd;
pub mod sram;
pub mod usbh;
pub mod user;

#[cfg(test)]
mod sim;

pub use config::BLOCK_SIZE;
pub use disk_io::{DiskError, DiskIo, DiskResult, DiskStatus, IoctlCmd, IoctlData};
pub use registry::{DiskHandle, DiskRegistry, Drive};
pub use rtos::Kernel;
