//! 驱动注册表
//!
//! 文件系统用驱动器号访问磁盘。每个驱动注册后得到一个[`DiskHandle`]，
//! 之后的所有操作都通过句柄分发到对应的驱动。

use crate::config::MAX_DRIVES;
use crate::disk_io::{DiskError, DiskIo, DiskResult, DiskStatus, IoctlCmd, IoctlData};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use lazy_static::*;
use spin::Mutex;

// 驱动器号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskHandle(u8);

impl DiskHandle {
    pub fn drive(&self) -> u8 {
        self.0
    }
}

// 注册到表中的一个驱动，以及它的逻辑单元号
#[derive(Clone)]
pub struct Drive {
    driver: Arc<dyn DiskIo>,
    lun: u8,
    // 初始化成功之后不再重复初始化
    initialized: Arc<AtomicBool>,
}

impl Drive {
    fn new(driver: Arc<dyn DiskIo>, lun: u8) -> Self {
        Self {
            driver,
            lun,
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn initialize(&self) -> DiskStatus {
        if self.is_initialized() {
            return DiskStatus::empty();
        }
        let stat = self.driver.initialize(self.lun);
        if stat.is_ready() {
            self.initialized.store(true, Ordering::Release);
        }
        stat
    }

    pub fn status(&self) -> DiskStatus {
        self.driver.status(self.lun)
    }

    pub fn read(&self, buf: &mut [u8], sector: u64, count: u32) -> DiskResult<()> {
        self.driver.read(self.lun, buf, sector, count)
    }

    pub fn write(&self, buf: &[u8], sector: u64, count: u32) -> DiskResult<()> {
        self.driver.write(self.lun, buf, sector, count)
    }

    pub fn ioctl(&self, cmd: IoctlCmd) -> DiskResult<IoctlData> {
        self.driver.ioctl(self.lun, cmd)
    }
}

pub struct DiskRegistry {
    drives: [Option<Drive>; MAX_DRIVES],
}

impl DiskRegistry {
    pub fn new() -> Self {
        const EMPTY: Option<Drive> = None;
        Self {
            drives: [EMPTY; MAX_DRIVES],
        }
    }

    // 注册一个驱动，占用编号最小的空闲驱动器号。表已满时返回参数错误
    pub fn link(&mut self, driver: Arc<dyn DiskIo>, lun: u8) -> DiskResult<DiskHandle> {
        let (id, slot) = self
            .drives
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(DiskError::ParameterError)?;
        *slot = Some(Drive::new(driver, lun));
        info!("diskio: drive {} linked (lun {})", id, lun);
        Ok(DiskHandle(id as u8))
    }

    pub fn unlink(&mut self, handle: DiskHandle) -> DiskResult<()> {
        let slot = self
            .drives
            .get_mut(handle.0 as usize)
            .ok_or(DiskError::ParameterError)?;
        match slot.take() {
            Some(_) => {
                info!("diskio: drive {} unlinked", handle.0);
                Ok(())
            }
            None => Err(DiskError::ParameterError),
        }
    }

    // 已注册的驱动数
    pub fn attached(&self) -> usize {
        self.drives.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn get(&self, handle: DiskHandle) -> DiskResult<Drive> {
        self.drives
            .get(handle.0 as usize)
            .and_then(|slot| slot.clone())
            .ok_or(DiskError::ParameterError)
    }

    pub fn disk_initialize(&self, handle: DiskHandle) -> DiskStatus {
        self.get(handle)
            .map_or(DiskStatus::NOINIT, |drive| drive.initialize())
    }

    pub fn disk_status(&self, handle: DiskHandle) -> DiskStatus {
        self.get(handle)
            .map_or(DiskStatus::NOINIT, |drive| drive.status())
    }

    pub fn disk_read(
        &self,
        handle: DiskHandle,
        buf: &mut [u8],
        sector: u64,
        count: u32,
    ) -> DiskResult<()> {
        self.get(handle)?.read(buf, sector, count)
    }

    pub fn disk_write(
        &self,
        handle: DiskHandle,
        buf: &[u8],
        sector: u64,
        count: u32,
    ) -> DiskResult<()> {
        self.get(handle)?.write(buf, sector, count)
    }

    pub fn disk_ioctl(&self, handle: DiskHandle, cmd: IoctlCmd) -> DiskResult<IoctlData> {
        self.get(handle)?.ioctl(cmd)
    }
}

impl Default for DiskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    // 全局的驱动注册表，给固件使用
    pub static ref DISK_REGISTRY: Mutex<DiskRegistry> = Mutex::new(DiskRegistry::new());
}

pub fn link_driver(driver: Arc<dyn DiskIo>, lun: u8) -> DiskResult<DiskHandle> {
    DISK_REGISTRY.lock().link(driver, lun)
}

pub fn unlink_driver(handle: DiskHandle) -> DiskResult<()> {
    DISK_REGISTRY.lock().unlink(handle)
}

// 取出驱动后立即释放锁，传输期间不持有全局锁
pub fn get_drive(handle: DiskHandle) -> DiskResult<Drive> {
    DISK_REGISTRY.lock().get(handle)
}
