//! 测试用的模拟内核、SD卡和缓存

use crate::cache::{CacheMaintenance, CacheRange};
use crate::completion::CompletionPort;
use crate::config::BLOCK_SIZE;
use crate::rtos::Kernel;
use crate::sd::{CardInfo, CardState, HalError, SdHost};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// 模拟的节拍源：每读一次节拍数，时间前进一个节拍；每次挂起也前进一个节拍
pub struct SimKernel {
    now: AtomicU64,
    running: AtomicBool,
    yields: AtomicUsize,
}

impl SimKernel {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(1000),
            running: AtomicBool::new(true),
            yields: AtomicUsize::new(0),
        }
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl Kernel for SimKernel {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
    fn tick_count(&self) -> u64 {
        self.now.fetch_add(1, Ordering::SeqCst)
    }
    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
        self.now.fetch_add(1, Ordering::SeqCst);
    }
}

// 真实时间的节拍源，用于多线程的测试
pub struct StdKernel {
    start: Instant,
}

impl StdKernel {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Kernel for StdKernel {
    fn is_running(&self) -> bool {
        true
    }
    fn tick_count(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
    fn yield_now(&self) {
        std::thread::sleep(Duration::from_micros(200));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaMode {
    // 传输完成后发送对应的完成事件
    Complete,
    // 传输永远不结束
    Silent,
    // 启动DMA时就失败
    FailIssue,
    // 中断报告传输中止
    Abort,
    // 发送相反方向的完成事件
    WrongEvent,
    // 传输很慢，直到调用complete_late才结束
    Late,
}

// 还没有结束的慢速DMA传输
struct PendingDma {
    write: bool,
    addr: usize,
    range: std::ops::Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRequest {
    pub write: bool,
    pub addr: usize,
    pub sector: u64,
    pub count: u32,
}

pub struct SimCard {
    medium: Mutex<Vec<u8>>,
    info: Mutex<CardInfo>,
    ready: AtomicBool,
    // 每次传输之后，卡要忙这么多次采样才回到传输状态
    busy_after_io: AtomicUsize,
    busy_left: AtomicUsize,
    mode: Mutex<DmaMode>,
    // 第n次（从0开始计数）启动DMA时失败
    fail_at: Mutex<Option<usize>>,
    fail_init: AtomicBool,
    port: spin::Once<CompletionPort>,
    pending: Mutex<Option<PendingDma>>,
    aborts: AtomicUsize,
    requests: Mutex<Vec<DmaRequest>>,
    issues: AtomicUsize,
    events: AtomicUsize,
    state_queries: AtomicUsize,
    inits: AtomicUsize,
}

impl SimCard {
    pub fn new(sectors: u64) -> Self {
        Self {
            medium: Mutex::new(vec![0; sectors as usize * BLOCK_SIZE]),
            info: Mutex::new(CardInfo {
                block_count: sectors,
                block_size: BLOCK_SIZE as u32,
                erase_block_size: BLOCK_SIZE as u32,
            }),
            ready: AtomicBool::new(true),
            busy_after_io: AtomicUsize::new(0),
            busy_left: AtomicUsize::new(0),
            mode: Mutex::new(DmaMode::Complete),
            fail_at: Mutex::new(None),
            fail_init: AtomicBool::new(false),
            port: spin::Once::new(),
            pending: Mutex::new(None),
            aborts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            issues: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
            state_queries: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
        }
    }

    // 连接驱动的中断入口
    pub fn attach(&self, port: CompletionPort) {
        self.port.call_once(|| port);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_mode(&self, mode: DmaMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_busy_after_io(&self, samples: usize) {
        self.busy_after_io.store(samples, Ordering::SeqCst);
    }

    pub fn fail_issue_at(&self, nth: usize) {
        *self.fail_at.lock().unwrap() = Some(nth);
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn resize(&self, sectors: u64) {
        self.medium
            .lock()
            .unwrap()
            .resize(sectors as usize * BLOCK_SIZE, 0);
        self.info.lock().unwrap().block_count = sectors;
    }

    pub fn set_erase_block_size(&self, bytes: u32) {
        self.info.lock().unwrap().erase_block_size = bytes;
    }

    pub fn fill(&self, sector: u64, data: &[u8]) {
        let start = sector as usize * BLOCK_SIZE;
        self.medium.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
    }

    pub fn sector(&self, sector: u64) -> Vec<u8> {
        let start = sector as usize * BLOCK_SIZE;
        self.medium.lock().unwrap()[start..start + BLOCK_SIZE].to_vec()
    }

    pub fn dma_issues(&self) -> usize {
        self.issues.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    // 让慢速传输结束：搬运数据并发送完成事件。没有未结束的传输时返回false
    pub fn complete_late(&self) -> bool {
        let pending = match self.pending.lock().unwrap().take() {
            Some(pending) => pending,
            None => return false,
        };
        let len = pending.range.len();
        let mut medium = self.medium.lock().unwrap();
        if pending.write {
            let buf = unsafe { std::slice::from_raw_parts(pending.addr as *const u8, len) };
            medium[pending.range].copy_from_slice(buf);
        } else {
            let buf = unsafe { std::slice::from_raw_parts_mut(pending.addr as *mut u8, len) };
            buf.copy_from_slice(&medium[pending.range]);
        }
        drop(medium);
        self.interrupt(DmaMode::Complete, pending.write);
        true
    }

    // (启动的DMA数, 发出的完成事件数, 卡状态的采样数)
    pub fn counters(&self) -> (usize, usize, usize) {
        (
            self.issues.load(Ordering::SeqCst),
            self.events.load(Ordering::SeqCst),
            self.state_queries.load(Ordering::SeqCst),
        )
    }

    pub fn requests(&self) -> Vec<DmaRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn range(&self, sector: u64, count: u32) -> Result<std::ops::Range<usize>, HalError> {
        let start = usize::try_from(sector)
            .ok()
            .and_then(|sector| sector.checked_mul(BLOCK_SIZE))
            .ok_or(HalError::Error)?;
        let end = start
            .checked_add(count as usize * BLOCK_SIZE)
            .ok_or(HalError::Error)?;
        if end > self.medium.lock().unwrap().len() {
            return Err(HalError::Error);
        }
        Ok(start..end)
    }

    // 记录一次DMA请求，并决定是否失败
    fn start(&self, request: DmaRequest) -> Result<DmaMode, HalError> {
        let nth = self.issues.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let mode = *self.mode.lock().unwrap();
        if mode == DmaMode::FailIssue || *self.fail_at.lock().unwrap() == Some(nth) {
            return Err(HalError::Error);
        }
        self.busy_left
            .store(self.busy_after_io.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(mode)
    }

    // 模拟中断
    fn interrupt(&self, mode: DmaMode, write: bool) {
        let port = match self.port.get() {
            Some(port) => port,
            None => return,
        };
        match (mode, write) {
            (DmaMode::Complete, false) | (DmaMode::WrongEvent, true) => port.rx_complete(),
            (DmaMode::Complete, true) | (DmaMode::WrongEvent, false) => port.tx_complete(),
            (DmaMode::Abort, _) => port.abort(),
            _ => return,
        }
        self.events.fetch_add(1, Ordering::SeqCst);
    }
}

impl SdHost for SimCard {
    fn init(&self) -> Result<(), HalError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            Err(HalError::Error)
        } else {
            Ok(())
        }
    }

    fn card_state(&self) -> CardState {
        self.state_queries.fetch_add(1, Ordering::SeqCst);
        if !self.ready.load(Ordering::SeqCst) {
            return CardState::Programming;
        }
        let busy = self.busy_left.load(Ordering::SeqCst);
        if busy > 0 {
            self.busy_left.store(busy - 1, Ordering::SeqCst);
            return CardState::Programming;
        }
        CardState::Transfer
    }

    fn card_info(&self) -> CardInfo {
        *self.info.lock().unwrap()
    }

    fn read_blocks(
        &self,
        buf: &mut [u8],
        sector: u64,
        count: u32,
        _timeout: u64,
    ) -> Result<(), HalError> {
        let range = self.range(sector, count)?;
        let len = range.len();
        buf[..len].copy_from_slice(&self.medium.lock().unwrap()[range]);
        self.busy_left
            .store(self.busy_after_io.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn write_blocks(
        &self,
        buf: &[u8],
        sector: u64,
        count: u32,
        _timeout: u64,
    ) -> Result<(), HalError> {
        let range = self.range(sector, count)?;
        let len = range.len();
        self.medium.lock().unwrap()[range].copy_from_slice(&buf[..len]);
        self.busy_left
            .store(self.busy_after_io.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    unsafe fn read_blocks_dma(
        &self,
        buf: &mut [u8],
        sector: u64,
        count: u32,
    ) -> Result<(), HalError> {
        let mode = self.start(DmaRequest {
            write: false,
            addr: buf.as_ptr() as usize,
            sector,
            count,
        })?;
        let range = self.range(sector, count)?;
        match mode {
            DmaMode::Silent => {}
            DmaMode::Late => {
                *self.pending.lock().unwrap() = Some(PendingDma {
                    write: false,
                    addr: buf.as_mut_ptr() as usize,
                    range,
                });
                return Ok(());
            }
            _ => {
                let len = range.len();
                buf[..len].copy_from_slice(&self.medium.lock().unwrap()[range]);
            }
        }
        self.interrupt(mode, false);
        Ok(())
    }

    unsafe fn write_blocks_dma(&self, buf: &[u8], sector: u64, count: u32) -> Result<(), HalError> {
        let mode = self.start(DmaRequest {
            write: true,
            addr: buf.as_ptr() as usize,
            sector,
            count,
        })?;
        let range = self.range(sector, count)?;
        match mode {
            DmaMode::Silent => {}
            DmaMode::Late => {
                *self.pending.lock().unwrap() = Some(PendingDma {
                    write: true,
                    addr: buf.as_ptr() as usize,
                    range,
                });
                return Ok(());
            }
            _ => {
                let len = range.len();
                self.medium.lock().unwrap()[range].copy_from_slice(&buf[..len]);
            }
        }
        self.interrupt(mode, true);
        Ok(())
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Clean(CacheRange),
    Invalidate(CacheRange),
}

// 记录所有缓存维护操作
#[derive(Clone, Default)]
pub struct RecordingCache {
    ops: Arc<Mutex<Vec<CacheOp>>>,
}

impl RecordingCache {
    pub fn take(&self) -> Vec<CacheOp> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }
}

impl CacheMaintenance for RecordingCache {
    fn clean(&self, range: CacheRange) {
        self.ops.lock().unwrap().push(CacheOp::Clean(range));
    }
    fn invalidate(&self, range: CacheRange) {
        self.ops.lock().unwrap().push(CacheOp::Invalidate(range));
    }
}

// 从storage中取出一段长为len的切片，其地址对32取模等于offset
pub fn aligned_slice(storage: &mut [u8], offset: usize, len: usize) -> &mut [u8] {
    let base = storage.as_ptr() as usize;
    let pad = (32 - base % 32) % 32;
    let start = pad + offset % 32;
    &mut storage[start..start + len]
}
