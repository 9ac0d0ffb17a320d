//! 内核服务的抽象
//!
//! 本层只需要内核提供三样东西：调度器是否在运行、节拍计数、挂起当前任务。
//! 测试中可以用模拟的节拍源代替，不必真的等待。

pub trait Kernel: Send + Sync {
    // 调度器是否已经启动。启动前无法挂起任务，也就不能等待完成事件
    fn is_running(&self) -> bool;
    // 启动以来经过的节拍数，一个节拍为1毫秒
    fn tick_count(&self) -> u64;
    // 挂起当前任务，直到下一个节拍或者被中断唤醒
    fn yield_now(&self);
}

// 从start开始经过的节拍数。节拍计数器回绕后结果仍然正确
pub fn elapsed(kernel: &dyn Kernel, start: u64) -> u64 {
    kernel.tick_count().wrapping_sub(start)
}
