//! 彩票调度

use core::cell::UnsafeCell;
use core::sync::atomic::Ordering;

use crate::arch::Context;
use crate::manager::Kernel;
use crate::param::NCPU;
use crate::process::{Proc, ProcGuard, ProcState};
use crate::random::random_range;

/// 每个 CPU 的状态
#[derive(Default)]
pub struct Cpu {
    /// 正在运行的进程槽
    proc: Option<usize>,
    /// 调度循环自己的上下文
    context: Context,
}

/// 只由所属 CPU 在关中断时访问
pub(crate) struct CpuTable([UnsafeCell<Cpu>; NCPU]);

unsafe impl Sync for CpuTable {}

impl CpuTable {
    pub(crate) fn new() -> Self {
        Self(core::array::from_fn(|_| UnsafeCell::new(Cpu::default())))
    }
}

impl Kernel {
    #[allow(clippy::mut_from_ref)]
    unsafe fn cpu(&self) -> &mut Cpu {
        &mut *self.cpus.0[self.hal.cpu_id()].get()
    }

    /// 当前 CPU 上运行的进程
    pub fn current_proc(&self) -> Option<&Proc> {
        let slot = unsafe { self.cpu() }.proc?;
        Some(&self.procs[slot])
    }

    /// 抽一次签
    ///
    /// 第一遍统计所有可运行进程的彩票数与运行次数，用二者之和作种子抽出
    /// `[1, 总票数]` 中的一个数；第二遍按槽位顺序累加票数，第一个使累计值
    /// 达到该数的进程中签。中签进程被置为 RUNNING，运行次数加一，连同它的锁一起返回。
    pub fn draw(&self) -> Option<(&Proc, ProcGuard<'_>)> {
        let (mut tickets, mut ticks) = (0u64, 0u64);
        for p in &self.procs {
            let inner = p.inner.lock();
            if inner.state == ProcState::Runnable {
                tickets += inner.tickets as u64;
                ticks += inner.ticks as u64;
            }
        }
        if tickets < 1 {
            return None;
        }
        let winner = random_range(tickets.wrapping_add(ticks), 1, tickets);

        let mut counter = 0u64;
        for p in &self.procs {
            let mut inner = p.inner.lock();
            if inner.state != ProcState::Runnable {
                continue;
            }
            counter += inner.tickets as u64;
            if counter >= winner {
                inner.state = ProcState::Running;
                inner.ticks += 1;
                return Some((p, inner));
            }
        }
        // 两遍之间有进程被其他 CPU 取走
        None
    }

    /// 每个 CPU 启动后进入的调度循环
    pub fn scheduler(&self) -> ! {
        let cpu = unsafe { self.cpu() };
        cpu.proc = None;
        loop {
            // 给设备中断一个机会
            self.hal.enable_irqs();
            self.hal.disable_irqs();

            let Some((p, inner)) = self.draw() else {
                // 挂起的中断即使被屏蔽也会唤醒 wfi
                self.hal.wait_for_irq();
                continue;
            };
            cpu.proc = Some(p.slot());
            unsafe { self.hal.switch_context(&mut cpu.context, &p.data().context) };
            // 进程已经让出 CPU，它的锁仍由这里持有
            cpu.proc = None;
            drop(inner);
        }
    }

    /// 切回调度循环
    ///
    /// 调用者持有 `p` 的锁并且已经把状态改为非 RUNNING；返回时锁仍然持有。
    pub fn sched<'a>(&self, p: &'a Proc, inner: ProcGuard<'a>) -> ProcGuard<'a> {
        assert!(!self.hal.irqs_enabled(), "sched: interruptible");
        assert!(
            inner.state != ProcState::Running,
            "sched: pid {} still running",
            inner.pid
        );
        let cpu = unsafe { self.cpu() };
        unsafe { self.hal.switch_context(&mut p.data_mut().context, &cpu.context) };
        inner
    }

    /// 放弃 CPU，回到可运行状态
    pub fn yield_proc(&self, p: &Proc) {
        let mut inner = p.inner.lock();
        inner.state = ProcState::Runnable;
        drop(self.sched(p, inner));
    }

    /// 新进程第一次被调度时运行
    ///
    /// 释放调度循环替它持有的锁；系统中第一次调用时启动文件系统。
    /// 返回后由调用者返回用户态。
    pub fn fork_return(&self) -> &Proc {
        let Some(p) = self.current_proc() else {
            panic!("fork_return: no process on cpu {}", self.hal.cpu_id());
        };
        unsafe { p.inner.force_unlock() };
        if !self.fs_started.swap(true, Ordering::AcqRel) {
            self.fs.start();
        }
        p
    }
}
