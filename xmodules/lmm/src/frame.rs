//! 物理页帧分配与引用计数

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;
use axerrno::{AxError, AxResult};
use memory_addr::PhysAddr;
use spin::Mutex;

use crate::PAGE_SIZE;

/// 物理页帧分配器
///
/// 每个页帧带一个引用计数：`alloc` 得到的页计数为 1，
/// `free` 释放一个引用，只有最后一个引用释放时才真正回收。
pub trait FrameAllocator: Send + Sync {
    /// 分配一个清零的页帧
    fn alloc(&self) -> Option<PhysAddr>;
    /// 释放一个引用
    fn free(&self, pa: PhysAddr);
    fn incref(&self, pa: PhysAddr);
    /// 减少引用计数但不回收，调用者保证还有其他引用
    fn decref(&self, pa: PhysAddr);
    fn refcount(&self, pa: PhysAddr) -> usize;
}

/// 按物理地址访问一个页帧的内容
///
/// # Safety
///
/// `pa` 必须是已分配的页帧，调用者负责保证没有冲突的别名访问。
pub unsafe fn phys_page<'a>(pa: PhysAddr) -> &'a mut [u8; PAGE_SIZE] {
    &mut *(pa.as_usize() as *mut [u8; PAGE_SIZE])
}

/// 持有一个页帧引用，离开作用域时释放
pub struct Frame<'a> {
    pa: PhysAddr,
    allocator: &'a dyn FrameAllocator,
}

impl<'a> Frame<'a> {
    pub fn alloc(allocator: &'a dyn FrameAllocator) -> AxResult<Self> {
        let pa = allocator.alloc().ok_or(AxError::NoMemory)?;
        Ok(Self { pa, allocator })
    }

    pub fn pa(&self) -> PhysAddr {
        self.pa
    }

    pub fn bytes(&mut self) -> &mut [u8; PAGE_SIZE] {
        unsafe { phys_page(self.pa) }
    }

    /// 交出这个引用，之后由页表负责释放
    pub fn into_pa(self) -> PhysAddr {
        let pa = self.pa;
        core::mem::forget(self);
        pa
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        self.allocator.free(self.pa);
    }
}

const FRAME_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(layout) => layout,
    Err(_) => panic!("bad frame layout"),
};

/// 由堆内存支撑的定长页帧池
pub struct FramePool {
    capacity: usize,
    refs: Mutex<BTreeMap<usize, usize>>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            refs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已分配的页帧数
    pub fn in_use(&self) -> usize {
        self.refs.lock().len()
    }
}

impl FrameAllocator for FramePool {
    fn alloc(&self) -> Option<PhysAddr> {
        let mut refs = self.refs.lock();
        if refs.len() >= self.capacity {
            log::warn!("frame pool exhausted ({} frames)", self.capacity);
            return None;
        }
        let ptr = unsafe { alloc_zeroed(FRAME_LAYOUT) };
        if ptr.is_null() {
            return None;
        }
        refs.insert(ptr as usize, 1);
        Some(PhysAddr::from(ptr as usize))
    }

    fn free(&self, pa: PhysAddr) {
        let mut refs = self.refs.lock();
        let Some(count) = refs.get_mut(&pa.as_usize()) else {
            panic!("free: unknown frame {:#x}", pa.as_usize());
        };
        *count -= 1;
        if *count == 0 {
            refs.remove(&pa.as_usize());
            unsafe { dealloc(pa.as_usize() as *mut u8, FRAME_LAYOUT) };
        }
    }

    fn incref(&self, pa: PhysAddr) {
        let mut refs = self.refs.lock();
        let Some(count) = refs.get_mut(&pa.as_usize()) else {
            panic!("incref: unknown frame {:#x}", pa.as_usize());
        };
        *count += 1;
    }

    fn decref(&self, pa: PhysAddr) {
        let mut refs = self.refs.lock();
        let Some(count) = refs.get_mut(&pa.as_usize()) else {
            panic!("decref: unknown frame {:#x}", pa.as_usize());
        };
        assert!(*count > 1, "decref: last reference to {:#x}", pa.as_usize());
        *count -= 1;
    }

    fn refcount(&self, pa: PhysAddr) -> usize {
        self.refs.lock().get(&pa.as_usize()).copied().unwrap_or(0)
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        for (&pa, _) in self.refs.get_mut().iter() {
            unsafe { dealloc(pa as *mut u8, FRAME_LAYOUT) };
        }
    }
}
