//! 卡就绪状态的轮询
//!
//! 这是一个真正的忙等待：不挂起任务，直到硬件就绪或超过期限。
//! 它和等待完成事件共用同一个超时值，所以调用者看到的最长等待时间
//! 是两者之和。

use crate::rtos::{self, Kernel};
use crate::sd::{CardState, SdHost};

// 反复调用ready，直到它返回true（成功）或经过timeout个节拍（失败）
pub fn poll_until(kernel: &dyn Kernel, timeout: u64, mut ready: impl FnMut() -> bool) -> bool {
    let start = kernel.tick_count();
    while rtos::elapsed(kernel, start) < timeout {
        if ready() {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}

// 等待SD卡回到传输（空闲）状态，可以接收新的请求
pub fn wait_ready<H: SdHost + ?Sized>(kernel: &dyn Kernel, host: &H, timeout: u64) -> bool {
    poll_until(kernel, timeout, || host.card_state() == CardState::Transfer)
}
