//! 用户态陷入处理

use lcore::{FaultKind, Kernel, Proc};
use lmm::{VirtAddr, PAGE_SIZE};

use crate::syscall::syscall;

/// scause 最高位表示中断
const INTERRUPT: usize = 1 << (usize::BITS - 1);

const ECALL_FROM_U: usize = 8;
const INSTRUCTION_PAGE_FAULT: usize = 12;
const LOAD_PAGE_FAULT: usize = 13;
const STORE_PAGE_FAULT: usize = 15;
const SUPERVISOR_SOFTWARE: usize = INTERRUPT | 1;
const SUPERVISOR_TIMER: usize = INTERRUPT | 5;

/// 陷入原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Syscall,
    PageFault(FaultKind, usize),
    Timer,
    Unknown(usize),
}

pub fn classify(scause: usize, stval: usize) -> Trap {
    match scause {
        ECALL_FROM_U => Trap::Syscall,
        INSTRUCTION_PAGE_FAULT => Trap::PageFault(FaultKind::Instruction, stval),
        LOAD_PAGE_FAULT => Trap::PageFault(FaultKind::Load, stval),
        STORE_PAGE_FAULT => Trap::PageFault(FaultKind::Store, stval),
        SUPERVISOR_SOFTWARE | SUPERVISOR_TIMER => Trap::Timer,
        other => Trap::Unknown(other),
    }
}

/// 处理一次用户态陷入
///
/// 被杀死的进程在返回用户态之前以 -1 退出；时钟中断让出 CPU。
pub fn user_trap(k: &Kernel, p: &Proc, scause: usize, stval: usize) {
    let trap = classify(scause, stval);
    match trap {
        Trap::Syscall => {
            if p.killed() {
                k.exit(p, -1);
            }
            // 返回到 ecall 的下一条指令
            unsafe { p.trapframe() }.epc += 4;
            syscall(k, p);
        }
        Trap::PageFault(kind, addr) => k.handle_page_fault(p, kind, VirtAddr::from(addr)),
        Trap::Timer => k.clock_tick(),
        Trap::Unknown(cause) => {
            log::warn!(
                "usertrap: unexpected scause {:#x} pid {} stval {:#x}",
                cause,
                p.pid(),
                stval
            );
            p.set_killed();
        }
    }

    if p.killed() {
        k.exit(p, -1);
    }
    if trap == Trap::Timer {
        k.yield_proc(p);
    }
}

/// 回到用户态
pub fn user_trap_return(k: &Kernel, p: &Proc) -> ! {
    let hal = k.hal();
    hal.disable_irqs();
    let data = unsafe { p.data() };
    let Some(trapframe) = data.trapframe else {
        panic!("user_trap_return: pid {} has no trapframe", p.pid());
    };
    let Ok(pt) = data.page_table() else {
        panic!("user_trap_return: pid {} has no page table", p.pid());
    };
    let tf = unsafe { p.trapframe() };
    tf.kernel_sp = data.kstack + PAGE_SIZE;
    tf.kernel_hartid = hal.cpu_id();
    log::trace!("return to user: pid {} epc {:#x}", p.pid(), tf.epc);
    hal.return_to_user(pt.satp(), trapframe)
}
