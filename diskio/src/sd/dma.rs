//! SD卡的DMA传输，运行在RTOS中
//!
//! 一次读写的流程：
//! 1. 忙等待卡进入传输状态，超时则不启动DMA
//! 2. 缓冲区按32字节对齐时走快速路径，一次DMA传输全部扇区；
//!    否则走慢速路径，逐个扇区经过暂存区中转
//! 3. 启动DMA后挂起任务，等待中断通过完成事件队列发来的消息
//! 4. 收到消息后，再次等待卡回到传输状态
//! 5. 写之前clean、读之后invalidate数据缓存
//!
//! 完成事件只按种类（读/写）匹配，不带请求编号。
//! 这要求同一时刻只有一个DMA请求在进行，由调用者串行地访问设备来保证。

use super::{query_geometry, CardState, SdConfig, SdHost};
use crate::cache::{CacheMaintenance, CacheRange, NoCache};
use crate::completion::{CompletionEvent, CompletionPort, CompletionQueue};
use crate::config::{BLOCK_SIZE, DMA_ALIGNMENT, QUEUE_SIZE};
use crate::disk_io::{
    transfer_len, DiskError, DiskIo, DiskResult, DiskStatus, IoctlCmd, IoctlData,
};
use crate::poller;
use crate::rtos::Kernel;
use crate::scratch::{is_aligned, ScratchBuffer};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use spin::{Mutex, Once};

// 传输统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    // 走快速路径的传输数
    pub direct: usize,
    // 走慢速路径的传输数
    pub staged: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    direct: AtomicUsize,
    staged: AtomicUsize,
    failed: AtomicUsize,
}

pub struct SdDmaDisk<H, C = NoCache> {
    host: H,
    kernel: Arc<dyn Kernel>,
    cache: C,
    config: SdConfig,
    // 缓存的设备状态（DiskStatus的位）
    stat: AtomicU8,
    // 完成事件队列，在initialize中分配且只分配一次
    queue: Arc<Once<CompletionQueue>>,
    scratch: Mutex<ScratchBuffer>,
    counters: Counters,
}

impl<H: SdHost> SdDmaDisk<H> {
    pub fn new(host: H, kernel: Arc<dyn Kernel>, config: SdConfig) -> Self {
        Self::with_cache(host, kernel, config, NoCache)
    }
}

impl<H: SdHost, C: CacheMaintenance> SdDmaDisk<H, C> {
    pub fn with_cache(host: H, kernel: Arc<dyn Kernel>, config: SdConfig, cache: C) -> Self {
        Self {
            host,
            kernel,
            cache,
            config,
            stat: AtomicU8::new(DiskStatus::NOINIT.bits()),
            queue: Arc::new(Once::new()),
            scratch: Mutex::new(ScratchBuffer::new()),
            counters: Counters::default(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// 交给控制器驱动的中断处理函数，用来发送完成事件
    pub fn completion_port(&self) -> CompletionPort {
        CompletionPort::new(self.queue.clone())
    }

    // 因队列满而丢失的完成事件数
    pub fn dropped_events(&self) -> usize {
        self.queue.get().map_or(0, |queue| queue.dropped())
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            direct: self.counters.direct.load(Ordering::Relaxed),
            staged: self.counters.staged.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn cached_status(&self) -> DiskStatus {
        DiskStatus::from_bits_truncate(self.stat.load(Ordering::Acquire))
    }

    fn set_status(&self, stat: DiskStatus) -> DiskStatus {
        self.stat.store(stat.bits(), Ordering::Release);
        stat
    }

    // 探测卡的状态。完成事件队列还没有分配的设备无法传输，也视为未初始化
    fn check_status(&self) -> DiskStatus {
        let mut stat = DiskStatus::NOINIT;
        if self.queue.get().is_some() && self.host.card_state() == CardState::Transfer {
            stat.remove(DiskStatus::NOINIT);
        }
        self.set_status(stat)
    }

    fn wait_ready(&self) -> bool {
        poller::wait_ready(&*self.kernel, &self.host, self.config.timeout)
    }

    // 只有初始化成功的设备才能传输
    fn ready_queue(&self) -> DiskResult<&CompletionQueue> {
        if !self.cached_status().is_ready() {
            return Err(DiskError::NotReady);
        }
        self.queue.get().ok_or(DiskError::NotReady)
    }

    // 启动DMA之前，清掉被放弃的传输迟到的事件
    fn discard_stale(&self, queue: &CompletionQueue) {
        let stale = queue.drain();
        if stale > 0 {
            debug!("sd: discarded {} stale completion event(s)", stale);
        }
    }

    fn issued(&self, result: Result<(), super::HalError>, sector: u64) -> DiskResult<()> {
        result.map_err(|err| {
            warn!("sd: failed to start DMA at sector {}: {:?}", sector, err);
            DiskError::HardwareError
        })
    }

    // 放弃这次传输。abort返回后DMA不再访问缓冲区，之后才能把缓冲区还给调用者
    fn abandon(&self, queue: &CompletionQueue, err: DiskError) -> DiskError {
        self.host.abort();
        self.discard_stale(queue);
        err
    }

    // 等待一次DMA请求结束，然后等待卡回到传输状态
    fn finish(&self, queue: &CompletionQueue, expected: CompletionEvent) -> DiskResult<()> {
        match queue.recv_timeout(&*self.kernel, self.config.timeout) {
            Some(event) if event == expected => {}
            Some(event) => {
                warn!("sd: expected {:?}, got {:?}", expected, event);
                return Err(self.abandon(queue, DiskError::HardwareError));
            }
            None => {
                warn!("sd: no completion within {} ms", self.config.timeout);
                return Err(self.abandon(queue, DiskError::Timeout));
            }
        }
        if !self.wait_ready() {
            warn!("sd: card did not return to transfer state");
            return Err(DiskError::Timeout);
        }
        Ok(())
    }

    // 快速路径：DMA直接写入调用者的缓冲区
    fn read_direct(
        &self,
        queue: &CompletionQueue,
        buf: &mut [u8],
        sector: u64,
        count: u32,
    ) -> DiskResult<()> {
        self.discard_stale(queue);
        let result = unsafe { self.host.read_blocks_dma(buf, sector, count) };
        self.issued(result, sector)?;
        self.finish(queue, CompletionEvent::ReadComplete)?;
        // CPU接下来要读DMA写入的数据，不能读到缓存里的旧数据
        self.cache.invalidate(CacheRange::of(buf));
        Ok(())
    }

    // 慢速路径：每个扇区先读到暂存区，再复制到调用者的缓冲区
    fn read_staged(&self, queue: &CompletionQueue, buf: &mut [u8], sector: u64) -> DiskResult<()> {
        let mut scratch = self.scratch.lock();
        for (i, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            // transfer_len已经保证sector + count不会溢出
            let lba = sector + i as u64;
            trace!("sd: staged read of sector {}", lba);
            self.discard_stale(queue);
            let result = unsafe { self.host.read_blocks_dma(scratch.as_mut_slice(), lba, 1) };
            self.issued(result, lba)?;
            self.finish(queue, CompletionEvent::ReadComplete)?;
            self.cache.invalidate(CacheRange::of(scratch.as_slice()));
            chunk.copy_from_slice(scratch.as_slice());
        }
        Ok(())
    }

    fn write_direct(
        &self,
        queue: &CompletionQueue,
        buf: &[u8],
        sector: u64,
        count: u32,
    ) -> DiskResult<()> {
        // DMA从内存读取数据，先把CPU缓存中最新的数据写回内存
        self.cache.clean(CacheRange::of(buf));
        self.discard_stale(queue);
        let result = unsafe { self.host.write_blocks_dma(buf, sector, count) };
        self.issued(result, sector)?;
        self.finish(queue, CompletionEvent::WriteComplete)
    }

    fn write_staged(&self, queue: &CompletionQueue, buf: &[u8], sector: u64) -> DiskResult<()> {
        let mut scratch = self.scratch.lock();
        for (i, chunk) in buf.chunks_exact(BLOCK_SIZE).enumerate() {
            let lba = sector + i as u64;
            trace!("sd: staged write of sector {}", lba);
            scratch.as_mut_slice().copy_from_slice(chunk);
            self.cache.clean(CacheRange::of(scratch.as_slice()));
            self.discard_stale(queue);
            let result = unsafe { self.host.write_blocks_dma(scratch.as_slice(), lba, 1) };
            self.issued(result, lba)?;
            self.finish(queue, CompletionEvent::WriteComplete)?;
        }
        Ok(())
    }

    // 记录走了哪条路径，以及是否失败
    fn account(&self, direct: bool, result: DiskResult<()>) -> DiskResult<()> {
        let counter = if direct {
            &self.counters.direct
        } else {
            &self.counters.staged
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl<H: SdHost, C: CacheMaintenance> DiskIo for SdDmaDisk<H, C> {
    fn initialize(&self, _lun: u8) -> DiskStatus {
        self.set_status(DiskStatus::NOINIT);
        // 调度器启动之前，无法挂起任务等待完成事件
        if !self.kernel.is_running() {
            warn!("sd: kernel is not running, cannot initialize");
            return DiskStatus::NOINIT;
        }
        if self.config.init_card {
            if let Err(err) = self.host.init() {
                warn!("sd: card initialization failed: {:?}", err);
                return DiskStatus::NOINIT;
            }
        }
        if self.host.card_state() != CardState::Transfer {
            debug!("sd: card is not in transfer state");
            return DiskStatus::NOINIT;
        }
        if self.queue.get().is_none() {
            match CompletionQueue::try_new(QUEUE_SIZE) {
                Ok(queue) => {
                    self.queue.call_once(|| queue);
                }
                Err(_) => {
                    warn!("sd: cannot allocate the completion queue");
                    return DiskStatus::NOINIT;
                }
            }
        }
        debug!("sd: initialized, {:?}", self.host.card_info());
        self.set_status(DiskStatus::empty())
    }

    fn status(&self, _lun: u8) -> DiskStatus {
        self.check_status()
    }

    fn read(&self, _lun: u8, buf: &mut [u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        let queue = self.ready_queue()?;
        if !self.wait_ready() {
            warn!("sd: card not ready before reading sector {}", sector);
            return Err(DiskError::Timeout);
        }
        let buf = &mut buf[..len];
        if is_aligned(buf.as_ptr(), DMA_ALIGNMENT) {
            let result = self.read_direct(queue, buf, sector, count);
            self.account(true, result)
        } else {
            debug!("sd: misaligned read buffer, staging {} sector(s)", count);
            let result = self.read_staged(queue, buf, sector);
            self.account(false, result)
        }
    }

    fn write(&self, _lun: u8, buf: &[u8], sector: u64, count: u32) -> DiskResult<()> {
        let len = transfer_len(buf.len(), sector, count)?;
        let queue = self.ready_queue()?;
        if !self.wait_ready() {
            warn!("sd: card not ready before writing sector {}", sector);
            return Err(DiskError::Timeout);
        }
        let buf = &buf[..len];
        if is_aligned(buf.as_ptr(), DMA_ALIGNMENT) {
            let result = self.write_direct(queue, buf, sector, count);
            self.account(true, result)
        } else {
            debug!("sd: misaligned write buffer, staging {} sector(s)", count);
            let result = self.write_staged(queue, buf, sector);
            self.account(false, result)
        }
    }

    fn ioctl(&self, _lun: u8, cmd: IoctlCmd) -> DiskResult<IoctlData> {
        if let IoctlCmd::Unknown(code) = cmd {
            debug!("sd: unsupported ioctl {}", code);
            return Err(DiskError::ParameterError);
        }
        if !self.cached_status().is_ready() {
            return Err(DiskError::NotReady);
        }
        query_geometry(&self.host, cmd)
    }
}
