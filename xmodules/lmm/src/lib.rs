//! lotos 内存管理：物理页帧与 Sv39 用户页表
//!
//! 页帧以物理地址标识，物理内存恒等映射，内核可以直接按物理地址读写页内容。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod frame;
mod layout;
mod page_table;

#[cfg(test)]
mod tests;

pub use frame::{phys_page, Frame, FrameAllocator, FramePool};
pub use layout::*;
pub use memory_addr::{PhysAddr, VirtAddr};
pub use page_table::{PageTable, Pte, PteFlags};
