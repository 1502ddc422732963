//! 睡眠与唤醒

use axerrno::{AxError, AxResult};
use spin::{Mutex, MutexGuard};

use crate::manager::Kernel;
use crate::process::{Channel, Proc, ProcState};

impl Kernel {
    /// 释放 `guard` 并在 `chan` 上睡眠，醒来后重新获取 `lock`
    ///
    /// 先拿到自己的进程锁再放开 `guard`，唤醒方也必须拿进程锁，所以不会丢失唤醒。
    pub fn sleep<'a, T>(
        &self,
        p: &Proc,
        chan: Channel,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        let mut inner = p.inner.lock();
        drop(guard);

        inner.chan = Some(chan);
        inner.state = ProcState::Sleeping;
        let mut inner = self.sched(p, inner);

        inner.chan = None;
        drop(inner);
        lock.lock()
    }

    /// 唤醒所有睡在 `chan` 上的进程，当前进程除外
    ///
    /// 调用时不能持有任何进程锁。
    pub fn wakeup(&self, chan: Channel) {
        let me = self.current_proc().map(Proc::slot);
        for p in &self.procs {
            if Some(p.slot()) == me {
                continue;
            }
            let mut inner = p.inner.lock();
            if inner.state == ProcState::Sleeping && inner.chan == Some(chan) {
                inner.state = ProcState::Runnable;
            }
        }
    }

    /// 睡眠 `n` 个时钟滴答，被杀死时提前返回失败
    pub fn sleep_ticks(&self, p: &Proc, n: u64) -> AxResult {
        let mut ticks = self.ticks.lock();
        let start = *ticks;
        while *ticks - start < n {
            if p.killed() {
                return Err(AxError::BadState);
            }
            ticks = self.sleep(p, Channel::Ticks, &self.ticks, ticks);
        }
        Ok(())
    }

    /// 时钟中断，只由 0 号 CPU 计数
    pub fn clock_tick(&self) {
        if self.hal.cpu_id() != 0 {
            return;
        }
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        self.wakeup(Channel::Ticks);
        drop(ticks);
    }

    pub fn uptime(&self) -> u64 {
        *self.ticks.lock()
    }
}
