//! 用户地址空间布局

use memory_addr::PAGE_SIZE_4K;

pub const PAGE_SIZE: usize = PAGE_SIZE_4K;

/// 用户虚拟地址上限，比 Sv39 少用一位以避开符号扩展
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// 跳板页，位于地址空间最高处
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;

/// 进程的 trapframe 页，紧挨在跳板页下方
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;

/// 向上取整的页数
pub const fn pages_of(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}
