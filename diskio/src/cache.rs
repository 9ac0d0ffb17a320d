//! 数据缓存的维护
//!
//! 带数据缓存的CPU上，DMA直接访问内存，不经过缓存：
//! - DMA从内存读数据（写磁盘）之前，要把缓存中的脏数据写回内存（clean）
//! - DMA向内存写数据（读磁盘）之后，要丢弃缓存中的旧数据（invalidate）
//!
//! 不需要维护缓存的平台使用[`NoCache`]，所有操作都是空的。

use crate::config::CACHE_LINE_SIZE;

// 一段按缓存行对齐的地址范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRange {
    pub addr: usize,
    pub len: usize,
}

impl CacheRange {
    // 覆盖[addr, addr + len)的最小缓存行范围：起始地址向下对齐，结束地址向上对齐
    pub fn covering(addr: usize, len: usize) -> Self {
        let mask = CACHE_LINE_SIZE - 1;
        let start = addr & !mask;
        let end = (addr + len + mask) & !mask;
        Self {
            addr: start,
            len: end - start,
        }
    }

    pub fn of(buf: &[u8]) -> Self {
        Self::covering(buf.as_ptr() as usize, buf.len())
    }

    // 范围内每个缓存行的起始地址
    pub fn lines(&self) -> impl Iterator<Item = usize> {
        (self.addr..self.addr + self.len).step_by(CACHE_LINE_SIZE)
    }
}

pub trait CacheMaintenance: Send + Sync {
    // 把缓存中的数据写回内存
    fn clean(&self, range: CacheRange);
    // 丢弃缓存中的数据，之后CPU会从内存重新读取
    fn invalidate(&self, range: CacheRange);
}

pub struct NoCache;

impl CacheMaintenance for NoCache {
    #[inline(always)]
    fn clean(&self, _range: CacheRange) {}
    #[inline(always)]
    fn invalidate(&self, _range: CacheRange) {}
}

/// Cortex-M7的L1数据缓存，按地址逐行操作SCB的维护寄存器
#[cfg(target_arch = "arm")]
pub struct CortexM7DCache;

#[cfg(target_arch = "arm")]
mod cortex_m7 {
    use super::{CacheMaintenance, CacheRange, CortexM7DCache};
    use core::arch::asm;
    use core::ptr::write_volatile;

    // Data cache invalidate by MVA to PoC
    const SCB_DCIMVAC: usize = 0xE000_EF5C;
    // Data cache clean by MVA to PoC
    const SCB_DCCMVAC: usize = 0xE000_EF68;

    fn maintain(register: usize, range: CacheRange) {
        unsafe {
            asm!("dsb sy", options(nostack, preserves_flags));
            for line in range.lines() {
                write_volatile(register as *mut u32, line as u32);
            }
            asm!("dsb sy", "isb sy", options(nostack, preserves_flags));
        }
    }

    impl CacheMaintenance for CortexM7DCache {
        fn clean(&self, range: CacheRange) {
            maintain(SCB_DCCMVAC, range);
        }
        fn invalidate(&self, range: CacheRange) {
            maintain(SCB_DCIMVAC, range);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_widens_to_cache_lines() {
        assert_eq!(CacheRange::covering(64, 512), CacheRange { addr: 64, len: 512 });
        assert_eq!(CacheRange::covering(72, 512), CacheRange { addr: 64, len: 544 });
        assert_eq!(CacheRange::covering(95, 1), CacheRange { addr: 64, len: 32 });
        assert_eq!(CacheRange::covering(64, 512).lines().count(), 16);
    }
}
