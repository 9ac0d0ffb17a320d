//! DMA暂存区
//!
//! 调用者的缓冲区不满足DMA的对齐要求时，逐个扇区地经过暂存区中转。
//! 暂存区由驱动实例持有，不可重入：同一时刻只能有一个慢速传输在使用它。

use crate::config::{BLOCK_SIZE, DMA_ALIGNMENT};

// 一个扇区大小、按32字节对齐的缓冲区。
// 对齐到缓存行，维护缓存时不会波及相邻的数据
#[repr(C, align(32))]
pub struct ScratchBuffer([u8; BLOCK_SIZE]);

const _: () = assert!(core::mem::align_of::<ScratchBuffer>() >= DMA_ALIGNMENT);

impl ScratchBuffer {
    pub const fn new() -> Self {
        Self([0; BLOCK_SIZE])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// 地址是否按align（2的幂）对齐
pub fn is_aligned(ptr: *const u8, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    (ptr as usize) & (align - 1) == 0
}
