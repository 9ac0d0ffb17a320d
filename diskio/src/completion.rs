//! DMA完成事件的队列
//!
//! 生产者是传输完成中断，消费者是发起传输的任务。
//! 中断一侧不加锁、不分配内存，队列满时直接丢弃事件；
//! 任务一侧带超时地等待，等待期间把CPU让给其他任务。

use crate::rtos::{self, Kernel};
use alloc::collections::TryReserveError;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use spin::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionEvent {
    ReadComplete = 1,
    WriteComplete = 2,
    Aborted = 3,
}

impl CompletionEvent {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CompletionEvent::ReadComplete),
            2 => Some(CompletionEvent::WriteComplete),
            3 => Some(CompletionEvent::Aborted),
            _ => None,
        }
    }
}

// 单生产者单消费者的有界环形队列
pub struct CompletionQueue {
    slots: Vec<AtomicU8>,
    // head和tail只增不减（回绕），下标为它们对容量取模
    head: AtomicUsize, // 消费者下一次读取的位置
    tail: AtomicUsize, // 生产者下一次写入的位置
    // 因队列满而丢弃的事件数
    dropped: AtomicUsize,
}

impl CompletionQueue {
    // 分配失败时返回错误，而不是让整个系统终止
    pub fn try_new(capacity: usize) -> Result<Self, TryReserveError> {
        let capacity = capacity.max(1);
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        slots.extend((0..capacity).map(|_| AtomicU8::new(0)));
        Ok(Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 放入一个事件，不会阻塞。队列已满时事件被丢弃并计数，返回`Err`。
    ///
    /// 只能在一个生产者（中断处理函数）中调用。
    pub fn post(&self, event: CompletionEvent) -> Result<(), CompletionEvent> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == self.capacity() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(event);
        }
        self.slots[tail % self.capacity()].store(event as u8, Ordering::Relaxed);
        // Release保证消费者看到新的tail时，也能看到槽里的事件
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    // 取出一个事件。只能在一个消费者中调用
    pub fn try_recv(&self) -> Option<CompletionEvent> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let raw = self.slots[head % self.capacity()].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        CompletionEvent::from_raw(raw)
    }

    /// 等待一个事件，最多等待`timeout`个节拍。超时返回`None`。
    pub fn recv_timeout(&self, kernel: &dyn Kernel, timeout: u64) -> Option<CompletionEvent> {
        let start = kernel.tick_count();
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if rtos::elapsed(kernel, start) >= timeout {
                return None;
            }
            kernel.yield_now();
        }
    }

    // 丢弃之前被放弃的传输留下的事件，返回丢弃的个数
    pub fn drain(&self) -> usize {
        let mut stale = 0;
        while self.try_recv().is_some() {
            stale += 1;
        }
        stale
    }
}

/// 中断处理函数使用的句柄，可以在驱动初始化之前拿到。
///
/// 队列还没有分配时，事件被直接丢弃。
#[derive(Clone)]
pub struct CompletionPort {
    queue: Arc<Once<CompletionQueue>>,
}

impl CompletionPort {
    pub(crate) fn new(queue: Arc<Once<CompletionQueue>>) -> Self {
        Self { queue }
    }

    pub fn post(&self, event: CompletionEvent) -> bool {
        match self.queue.get() {
            Some(queue) => queue.post(event).is_ok(),
            None => false,
        }
    }

    // 接收（读磁盘）完成
    pub fn rx_complete(&self) {
        self.post(CompletionEvent::ReadComplete);
    }

    // 发送（写磁盘）完成
    pub fn tx_complete(&self) {
        self.post(CompletionEvent::WriteComplete);
    }

    // 传输出错或被中止
    pub fn abort(&self) {
        self.post(CompletionEvent::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    #[test]
    fn events_come_out_in_order() {
        let queue = CompletionQueue::try_new(4).unwrap();
        queue.post(CompletionEvent::WriteComplete).unwrap();
        queue.post(CompletionEvent::ReadComplete).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_recv(), Some(CompletionEvent::WriteComplete));
        assert_eq!(queue.try_recv(), Some(CompletionEvent::ReadComplete));
        assert_eq!(queue.try_recv(), None);
    }

    #[test]
    fn overflow_drops_without_blocking() {
        let queue = CompletionQueue::try_new(3).unwrap();
        for _ in 0..3 {
            queue.post(CompletionEvent::ReadComplete).unwrap();
        }
        assert_eq!(
            queue.post(CompletionEvent::Aborted),
            Err(CompletionEvent::Aborted)
        );
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain(), 3);
        // 取走之后又能放入，下标能正确回绕
        for _ in 0..10 {
            queue.post(CompletionEvent::WriteComplete).unwrap();
            assert_eq!(queue.try_recv(), Some(CompletionEvent::WriteComplete));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn recv_timeout_waits_the_full_budget() {
        let kernel = SimKernel::new();
        let queue = CompletionQueue::try_new(2).unwrap();
        let start = kernel.now();
        assert_eq!(queue.recv_timeout(&kernel, 50), None);
        let waited = kernel.now() - start;
        assert!(waited >= 50, "gave up after {} ticks", waited);
        assert!(waited < 60, "overshot to {} ticks", waited);
        assert!(kernel.yields() > 0);
    }

    #[test]
    fn recv_timeout_returns_pending_event_without_yielding() {
        let kernel = SimKernel::new();
        let queue = CompletionQueue::try_new(2).unwrap();
        queue.post(CompletionEvent::ReadComplete).unwrap();
        assert_eq!(
            queue.recv_timeout(&kernel, 50),
            Some(CompletionEvent::ReadComplete)
        );
        assert_eq!(kernel.yields(), 0);
    }

    #[test]
    fn port_drops_events_before_queue_exists() {
        let slot = Arc::new(Once::new());
        let port = CompletionPort::new(slot.clone());
        assert!(!port.post(CompletionEvent::ReadComplete));
        slot.call_once(|| CompletionQueue::try_new(2).unwrap());
        port.tx_complete();
        assert_eq!(
            slot.get().unwrap().try_recv(),
            Some(CompletionEvent::WriteComplete)
        );
    }

    #[test]
    fn interrupt_thread_wakes_waiting_task() {
        let kernel = crate::sim::StdKernel::new();
        let slot = Arc::new(Once::new());
        slot.call_once(|| CompletionQueue::try_new(4).unwrap());
        let port = CompletionPort::new(slot.clone());
        let isr = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            port.rx_complete();
        });
        let event = slot.get().unwrap().recv_timeout(&kernel, 1000);
        isr.join().unwrap();
        assert_eq!(event, Some(CompletionEvent::ReadComplete));
    }
}
