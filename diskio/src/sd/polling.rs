//! SD卡的阻塞传输
//!
//! 不使用DMA和中断，由控制器驱动自己等待传输结束。
//! 适合没有RTOS、或者不方便使用DMA的场合。

use super::{query_geometry, CardState, SdConfig, SdHost};
use crate::disk_io::{
    transfer_len, DiskError, DiskIo, DiskResult, DiskStatus, IoctlCmd, IoctlData,
};
use crate::poller;
use crate::rtos::Kernel;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

pub struct SdDisk<H> {
    host: H,
    kernel: Arc<dyn Kernel>,
    config: SdConfig,
    stat: AtomicU8,
}

impl<H: SdHost> SdDisk<H> {
    pub fn new(host: H, kernel: Arc<dyn Kernel>, config: SdConfig) -> Self {
        Self {
            host,
            kernel,
            config,
            stat: AtomicU8::new(DiskStatus::NOINIT.bits()),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn check_status(&self) -> DiskStatus {
        let mut stat = DiskStatus::NOINIT;
        if self.host.card_state() == CardState::Transfer {
            stat.remove(DiskStatus::NOINIT);
        }
        self.stat.store(stat.bits(), Ordering::Release);
        stat
    }

    fn ensure_ready(&self) -> DiskResult<()> {
        let stat = DiskStatus::from_bits_truncate(self.stat.load(Ordering::Acquire));
        if stat.is_ready() {
            Ok(())
        } else {
            Err(DiskError::NotReady)
        }
    }

    // 传输结束后，卡可能还在编程，等它回到传输状态
    fn settle(&self, sector: u64) -> DiskResult<()> {
        if poller::wait_ready(&*self.kernel, &self.host, self.config.timeout) {
            Ok(())
        } else {
            warn!("sd: card stuck after transfer at sector {}", sector);
            Err(DiskError::Timeout)
        }
    }
}

impl<H: SdHost> DiskIo for SdDisk<H> {
    fn initialize(&self, _lun: u8) -> DiskStatus {
        self.stat.store(DiskStatus::NOINIT.bits(), Ordering::Release);
        if self.config.init_card {
            if let Err(err) = self.host.init() {
                warn!("sd: card initialization failed: {:?}", err);
                return DiskStatus::NOINIT;
            }
        }
        self.check_status()
    }

    fn status(&self, _lun: u8) -> DiskStatus {
        self.check_status()
    }

    fn read(&self, _lun: u8, buf: &mut [u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        self.ensure_ready()?;
        self.host
            .read_blocks(&mut buf[..len], sector, count, self.config.timeout)
            .map_err(|err| {
                warn!("sd: read of sector {} failed: {:?}", sector, err);
                DiskError::from(err)
            })?;
        self.settle(sector)
    }

    fn write(&self, _lun: u8, buf: &[u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        self.ensure_ready()?;
        self.host
            .write_blocks(&buf[..len], sector, count, self.config.timeout)
            .map_err(|err| {
                warn!("sd: write of sector {} failed: {:?}", sector, err);
                DiskError::from(err)
            })?;
        self.settle(sector)
    }

    fn ioctl(&self, _lun: u8, cmd: IoctlCmd) -> DiskResult<IoctlData> {
        if let IoctlCmd::Unknown(_) = cmd {
            return Err(DiskError::ParameterError);
        }
        self.ensure_ready()?;
        query_geometry(&self.host, cmd)
    }
}
