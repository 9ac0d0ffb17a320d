//! 随机读写校验
//!
//! 每一轮随机选择扇区、扇区数和缓冲区的对齐方式，写入随机数据后再读回比较。
//! 同时维护一份磁盘内容的副本，最后把整个磁盘读出来和副本比较。

use diskio::config::DMA_ALIGNMENT;
use diskio::registry::{self, Drive};
use diskio::{DiskError, DiskIo, IoctlCmd, BLOCK_SIZE};
use rand::Rng;
use std::io;
use std::sync::Arc;

pub struct Options {
    pub rounds: usize,
    // 一次传输最多的扇区数
    pub max_count: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub sectors: u64,
    pub rounds: usize,
    // 缓冲区没有按DMA要求对齐的传输数
    pub misaligned: usize,
    pub bytes: u64,
}

pub fn disk_error(err: DiskError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

// 从storage中取出一段长为len的切片，其地址按DMA_ALIGNMENT取模等于offset
fn aligned(storage: &mut [u8], offset: usize, len: usize) -> &mut [u8] {
    let base = storage.as_ptr() as usize;
    let pad = (DMA_ALIGNMENT - base % DMA_ALIGNMENT) % DMA_ALIGNMENT;
    let start = pad + offset % DMA_ALIGNMENT;
    &mut storage[start..start + len]
}

// 一半的传输使用对齐的缓冲区，另一半随机错开
fn pick_offset(rng: &mut impl Rng) -> usize {
    if rng.gen_bool(0.5) {
        0
    } else {
        rng.gen_range(1..DMA_ALIGNMENT)
    }
}

fn sector_count(drive: &Drive) -> io::Result<u64> {
    let reply = drive.ioctl(IoctlCmd::SectorCount).map_err(disk_error)?;
    reply.value().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected ioctl reply {:?}", reply),
        )
    })
}

fn read_range(drive: &Drive, sector: u64, count: u32, offset: usize) -> io::Result<Vec<u8>> {
    let len = count as usize * BLOCK_SIZE;
    let mut storage = vec![0u8; len + 2 * DMA_ALIGNMENT];
    let buf = aligned(&mut storage, offset, len);
    drive.read(buf, sector, count).map_err(disk_error)?;
    Ok(buf.to_vec())
}

fn mismatch(sector: u64, count: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("sectors {}..{} read back wrong data", sector, sector + count as u64),
    )
}

pub fn run(drive: &Drive, opts: &Options, rng: &mut impl Rng) -> io::Result<Report> {
    let sectors = sector_count(drive)?;
    if sectors == 0 || opts.max_count == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "nothing to verify"));
    }
    let mut report = Report {
        sectors,
        ..Report::default()
    };
    let chunk = opts.max_count.min(sectors as u32);

    // 先把磁盘现有的内容读出来作为副本
    let mut shadow = Vec::with_capacity(sectors as usize * BLOCK_SIZE);
    let mut sector = 0;
    while sector < sectors {
        let count = chunk.min((sectors - sector) as u32);
        shadow.extend(read_range(drive, sector, count, 0)?);
        sector += count as u64;
    }

    for round in 0..opts.rounds {
        let count = rng.gen_range(1..=chunk);
        let sector = rng.gen_range(0..=sectors - count as u64);
        let len = count as usize * BLOCK_SIZE;
        let start = sector as usize * BLOCK_SIZE;

        let offset = pick_offset(rng);
        let mut storage = vec![0u8; len + 2 * DMA_ALIGNMENT];
        let buf = aligned(&mut storage, offset, len);
        rng.fill(&mut buf[..]);
        debug!(
            "round {}: write {} sector(s) at {}, offset {}",
            round, count, sector, offset
        );
        drive.write(buf, sector, count).map_err(disk_error)?;
        shadow[start..start + len].copy_from_slice(buf);

        let read_offset = pick_offset(rng);
        let back = read_range(drive, sector, count, read_offset)?;
        if back[..] != shadow[start..start + len] {
            return Err(mismatch(sector, count));
        }

        report.misaligned += (offset != 0) as usize + (read_offset != 0) as usize;
        report.bytes += 2 * len as u64;
        report.rounds += 1;
    }

    // 整个磁盘再比较一遍，确认没有写到别的扇区
    let mut sector = 0;
    while sector < sectors {
        let count = chunk.min((sectors - sector) as u32);
        let start = sector as usize * BLOCK_SIZE;
        let back = read_range(drive, sector, count, pick_offset(rng))?;
        if back[..] != shadow[start..start + back.len()] {
            return Err(mismatch(sector, count));
        }
        sector += count as u64;
    }
    Ok(report)
}

// 注册驱动，初始化后校验，最后注销
pub fn exercise(
    driver: Arc<dyn DiskIo>,
    opts: &Options,
    rng: &mut impl Rng,
) -> io::Result<Report> {
    let handle = registry::link_driver(driver, 0).map_err(disk_error)?;
    let result = registry::get_drive(handle)
        .map_err(disk_error)
        .and_then(|drive| {
            let stat = drive.initialize();
            if !stat.is_ready() {
                return Err(disk_error(DiskError::NotReady));
            }
            info!("drive {} initialized", handle.drive());
            run(&drive, opts, rng)
        });
    registry::unlink_driver(handle).map_err(disk_error)?;
    result
}
