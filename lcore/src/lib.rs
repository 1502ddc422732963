//! lotos 内核核心
//!
//! 进程表与进程生命周期、彩票调度、睡眠唤醒、文件映射区（VMA）
//! 以及缺页处理（按需加载与写时复制）。
//!
//! 平台相关的部分（上下文切换、中断开关、返回用户态）通过 [`arch::Hal`] 注入，
//! 物理页帧与文件系统分别由 `lmm` 与 `lfs` 提供。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
mod fault;
mod fork;
mod manager;
pub mod param;
mod process;
pub mod random;
mod sched;
mod sleep;
mod vma;


pub use fault::FaultKind;
pub use manager::{Kernel, PStat};
pub use process::{Channel, Proc, ProcData, ProcGuard, ProcInner, ProcState, Segment};
pub use vma::{Prot, Share, Vma, MAP_FAILED, MAP_PRIVATE, MAP_SHARED, PROT_EXEC, PROT_READ, PROT_RW, PROT_WRITE};
