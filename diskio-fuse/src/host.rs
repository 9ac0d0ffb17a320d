//! 在宿主机上模拟的RTOS内核和SD卡
//!
//! SD卡的数据保存在镜像文件中。DMA传输交给一个单独的线程完成，
//! 传输结束后由这个线程调用驱动的完成事件入口，就像中断处理函数一样。

use diskio::completion::CompletionPort;
use diskio::sd::{CardInfo, CardState, HalError, SdHost};
use diskio::{Kernel, BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// 以毫秒为节拍的内核，挂起就是让出一小段时间
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
        thread::sleep(Duration::from_micros(100));
    }
}

// 一次DMA传输
struct DmaJob {
    write: bool,
    addr: *mut u8,
    len: usize,
    sector: u64,
    // 提交时的中止计数。之后发生过中止，这个传输就作废
    epoch: u64,
}

// SAFETY: SdHost的调用者保证缓冲区在收到完成事件或者abort返回之前一直有效，
// 并且期间没有其他代码访问它。引擎只在持有epoch锁、且传输没有作废时访问缓冲区
unsafe impl Send for DmaJob {}

// DMA引擎线程持有的状态
struct DmaEngine {
    file: Arc<Mutex<File>>,
    busy: Arc<AtomicBool>,
    port: Arc<Mutex<Option<CompletionPort>>>,
    epoch: Arc<Mutex<u64>>,
    latency: Duration,
}

impl DmaEngine {
    fn run(&self, job: DmaJob) {
        thread::sleep(self.latency);
        // 整个传输期间持有epoch锁，abort要等传输结束才能返回
        let epoch = self.epoch.lock().unwrap();
        if *epoch != job.epoch {
            debug!("dma: dropped aborted transfer at sector {}", job.sector);
            return;
        }
        let result = self.transfer(&job);
        self.busy.store(false, Ordering::Release);
        let port = match self.port.lock().unwrap().clone() {
            Some(port) => port,
            None => return,
        };
        match result {
            Ok(()) if job.write => port.tx_complete(),
            Ok(()) => port.rx_complete(),
            Err(err) => {
                error!("dma: transfer at sector {} failed: {}", job.sector, err);
                port.abort();
            }
        }
    }

    fn transfer(&self, job: &DmaJob) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(job.sector * BLOCK_SIZE as u64))?;
        if job.write {
            let buf = unsafe { std::slice::from_raw_parts(job.addr as *const u8, job.len) };
            file.write_all(buf)
        } else {
            let buf = unsafe { std::slice::from_raw_parts_mut(job.addr, job.len) };
            file.read_exact(buf)
        }
    }
}

pub struct ImageCard {
    file: Arc<Mutex<File>>,
    sectors: u64,
    // DMA传输进行中，卡处于忙状态
    busy: Arc<AtomicBool>,
    port: Arc<Mutex<Option<CompletionPort>>>,
    epoch: Arc<Mutex<u64>>,
    jobs: Mutex<Sender<DmaJob>>,
}

impl ImageCard {
    // 打开（或创建）镜像文件，并把它的大小调整为sectors个扇区
    pub fn open(path: &Path, sectors: u64, latency: Duration) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(sectors * BLOCK_SIZE as u64)?;
        let file = Arc::new(Mutex::new(file));
        let busy = Arc::new(AtomicBool::new(false));
        let port = Arc::new(Mutex::new(None));
        let epoch = Arc::new(Mutex::new(0));
        let engine = DmaEngine {
            file: file.clone(),
            busy: busy.clone(),
            port: port.clone(),
            epoch: epoch.clone(),
            latency,
        };
        let (tx, rx) = mpsc::channel::<DmaJob>();
        // 卡被释放后，发送端关闭，线程随之退出
        thread::spawn(move || {
            for job in rx {
                engine.run(job);
            }
        });
        Ok(Self {
            file,
            sectors,
            busy,
            port,
            epoch,
            jobs: Mutex::new(tx),
        })
    }

    // 连接驱动的完成事件入口
    pub fn attach(&self, port: CompletionPort) {
        *self.port.lock().unwrap() = Some(port);
    }

    fn check(&self, buf_len: usize, sector: u64, count: u32) -> Result<usize, HalError> {
        let len = count as usize * BLOCK_SIZE;
        let end = sector.checked_add(count as u64).ok_or(HalError::Error)?;
        if buf_len < len || end > self.sectors {
            return Err(HalError::Error);
        }
        Ok(len)
    }

    fn submit(&self, write: bool, addr: *mut u8, len: usize, sector: u64) -> Result<(), HalError> {
        let job = DmaJob {
            write,
            addr,
            len,
            sector,
            epoch: *self.epoch.lock().unwrap(),
        };
        self.busy.store(true, Ordering::Release);
        self.jobs.lock().unwrap().send(job).map_err(|_| {
            self.busy.store(false, Ordering::Release);
            HalError::Error
        })
    }

    fn seek(&self, file: &mut File, sector: u64) -> Result<(), HalError> {
        file.seek(SeekFrom::Start(sector * BLOCK_SIZE as u64))
            .map(|_| ())
            .map_err(|_| HalError::Error)
    }
}

impl SdHost for ImageCard {
    fn init(&self) -> Result<(), HalError> {
        Ok(())
    }

    fn card_state(&self) -> CardState {
        if self.busy.load(Ordering::Acquire) {
            CardState::Programming
        } else {
            CardState::Transfer
        }
    }

    fn card_info(&self) -> CardInfo {
        CardInfo {
            block_count: self.sectors,
            block_size: BLOCK_SIZE as u32,
            // 4KiB的擦除块
            erase_block_size: 8 * BLOCK_SIZE as u32,
        }
    }

    fn read_blocks(
        &self,
        buf: &mut [u8],
        sector: u64,
        count: u32,
        _timeout: u64,
    ) -> Result<(), HalError> {
        let len = self.check(buf.len(), sector, count)?;
        let mut file = self.file.lock().unwrap();
        self.seek(&mut file, sector)?;
        file.read_exact(&mut buf[..len]).map_err(|_| HalError::Error)
    }

    fn write_blocks(
        &self,
        buf: &[u8],
        sector: u64,
        count: u32,
        _timeout: u64,
    ) -> Result<(), HalError> {
        let len = self.check(buf.len(), sector, count)?;
        let mut file = self.file.lock().unwrap();
        self.seek(&mut file, sector)?;
        file.write_all(&buf[..len]).map_err(|_| HalError::Error)
    }

    unsafe fn read_blocks_dma(
        &self,
        buf: &mut [u8],
        sector: u64,
        count: u32,
    ) -> Result<(), HalError> {
        let len = self.check(buf.len(), sector, count)?;
        self.submit(false, buf.as_mut_ptr(), len, sector)
    }

    unsafe fn write_blocks_dma(&self, buf: &[u8], sector: u64, count: u32) -> Result<(), HalError> {
        let len = self.check(buf.len(), sector, count)?;
        // 只会从这个地址读取数据
        self.submit(true, buf.as_ptr() as *mut u8, len, sector)
    }

    // 作废所有已提交的传输。正在进行的传输结束之后才返回
    fn abort(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch += 1;
        self.busy.store(false, Ordering::Release);
    }
}
