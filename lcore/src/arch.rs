//! 平台接口
//!
//! 内核在陷入处理期间保持中断关闭，只在调度循环里短暂打开，
//! 因此进程锁、等待锁与时钟锁都不会被中断处理程序重入。

use lmm::PhysAddr;

/// 内核线程切换时保存的寄存器（被调用者保存寄存器）
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

/// 用户态陷入时保存的寄存器，布局与跳板代码约定一致
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub kernel_satp: usize,
    pub kernel_sp: usize,
    pub kernel_trap: usize,
    pub epc: usize,
    pub kernel_hartid: usize,
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

/// 硬件抽象层
pub trait Hal: Send + Sync {
    fn cpu_id(&self) -> usize;
    fn enable_irqs(&self);
    fn disable_irqs(&self);
    fn irqs_enabled(&self) -> bool;

    /// 没有可运行进程时等待中断
    fn wait_for_irq(&self) {}

    /// 把当前寄存器保存到 `save`，然后从 `restore` 恢复执行
    ///
    /// # Safety
    ///
    /// 两个指针都必须指向有效的 `Context`，`restore` 必须是此前一次切换保存的现场
    /// 或者是新进程初始化好的现场。
    unsafe fn switch_context(&self, save: *mut Context, restore: *const Context);

    /// 页表项权限变化后刷新 TLB
    fn flush_tlb(&self) {}

    /// 跳板代码所在的物理页
    fn trampoline(&self) -> PhysAddr;

    /// 第 `slot` 个进程槽的内核栈（最低地址）
    fn kernel_stack(&self, slot: usize) -> usize;

    /// 新进程第一次被调度时的入口地址
    fn fork_return_entry(&self) -> usize;

    /// 切换到用户页表，从 trapframe 恢复用户态寄存器
    fn return_to_user(&self, satp: usize, trapframe: PhysAddr) -> !;
}
