//! lotos：RISC-V 教学内核的进程与内存管理
//!
//! 平台代码在启动时调用 [`init`] 创建全局内核与第一个进程，随后在每个 CPU 上调用
//! [`Kernel::scheduler`]。陷入处理入口是 [`usertrap`]，新进程第一次运行从
//! [`fork_return`] 开始。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod syscall;
pub mod trap;

use alloc::sync::Arc;
use axerrno::{AxError, AxResult};
use lcore::arch::Hal;
use lcore::param::{NCPU, NPROC};
use lfs::{FileSystem, FileTable};
use lmm::FrameAllocator;
use spin::Once;

pub use lcore::{FaultKind, Kernel, Proc};

static KERNEL: Once<Kernel> = Once::new();

/// 创建全局内核并放入第一个进程
pub fn init(
    hal: &'static dyn Hal,
    frames: Arc<dyn FrameAllocator>,
    fs: Arc<dyn FileSystem>,
) -> AxResult<&'static Kernel> {
    if KERNEL.is_completed() {
        return Err(AxError::AlreadyExists);
    }
    log::info!("lotos: {} process slots, {} cpus", NPROC, NCPU);
    let kernel = KERNEL.call_once(|| Kernel::new(hal, frames, fs, Arc::new(FileTable::new())));
    kernel.create_first_process()?;
    log::info!("lotos: initialized");
    Ok(kernel)
}

pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("lotos: kernel not initialized"),
    }
}

/// 用户态陷入入口，由跳板代码在切换到内核页表后调用
pub fn usertrap(scause: usize, stval: usize) -> ! {
    let k = kernel();
    let Some(p) = k.current_proc() else {
        panic!("usertrap: no process, scause {:#x}", scause);
    };
    trap::user_trap(k, p, scause, stval);
    trap::user_trap_return(k, p)
}

/// 新进程第一次被调度时的入口，地址由 `Hal::fork_return_entry` 提供
pub extern "C" fn fork_return() -> ! {
    let k = kernel();
    let p = k.fork_return();
    trap::user_trap_return(k, p)
}
