//! RISC-V Sv39 三级页表

use axerrno::{AxError, AxResult};
use bitflags::bitflags;
use memory_addr::{align_down_4k, align_up_4k, is_aligned_4k, PhysAddr, VirtAddr};

use crate::frame::{phys_page, Frame, FrameAllocator};
use crate::{MAXVA, PAGE_SIZE};

bitflags! {
    /// 页表项标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// 页表项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const EMPTY: Self = Self(0);

    pub fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Self((((pa.as_usize() >> 12) as u64) << 10) | flags.bits())
    }

    pub fn pa(&self) -> PhysAddr {
        PhysAddr::from(((self.0 >> 10) << 12) as usize)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0x3ff)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// 带 R/W/X 任一位的是叶子项，否则指向下一级页表
    pub fn is_leaf(&self) -> bool {
        self.flags()
            .intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        *self = Self::new(self.pa(), flags);
    }
}

const ENTRIES: usize = PAGE_SIZE / core::mem::size_of::<Pte>();

fn table<'a>(pa: PhysAddr) -> &'a mut [Pte; ENTRIES] {
    unsafe { &mut *(pa.as_usize() as *mut [Pte; ENTRIES]) }
}

fn index(level: usize, va: usize) -> usize {
    (va >> (12 + 9 * level)) & (ENTRIES - 1)
}

/// 找到 va 对应的末级页表项，`frames` 非空时按需分配中间页表
fn walk<'a>(root: PhysAddr, frames: Option<&dyn FrameAllocator>, va: usize) -> Option<&'a mut Pte> {
    assert!(va < MAXVA, "walk: va {:#x} out of range", va);
    let mut entries = table(root);
    for level in [2, 1] {
        let pte = &mut entries[index(level, va)];
        if pte.is_valid() {
            entries = table(pte.pa());
        } else {
            let pa = Frame::alloc(frames?).ok()?.into_pa();
            *pte = Pte::new(pa, PteFlags::V);
            entries = table(pa);
        }
    }
    Some(&mut entries[index(0, va)])
}

fn free_walk(frames: &dyn FrameAllocator, pa: PhysAddr) {
    for pte in table(pa).iter_mut() {
        if !pte.is_valid() {
            continue;
        }
        assert!(!pte.is_leaf(), "free_walk: leaf left at {:#x}", pte.pa().as_usize());
        free_walk(frames, pte.pa());
        *pte = Pte::EMPTY;
    }
    frames.free(pa);
}

/// 进程的用户页表
///
/// 页表页本身也从 `FrameAllocator` 分配，`destroy` 时一并归还。
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    pub fn new(frames: &dyn FrameAllocator) -> AxResult<Self> {
        let root = Frame::alloc(frames)?.into_pa();
        Ok(Self { root })
    }

    /// Sv39 模式下的 satp 值
    pub fn satp(&self) -> usize {
        (8 << 60) | (self.root.as_usize() >> 12)
    }

    /// 读取 va 的末级页表项，不分配
    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        if va.as_usize() >= MAXVA {
            return None;
        }
        walk(self.root, None, va.as_usize()).map(|pte| *pte)
    }

    /// 取得 va 的末级页表项以便修改，不分配
    pub fn entry_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        if va.as_usize() >= MAXVA {
            return None;
        }
        walk(self.root, None, va.as_usize())
    }

    /// 把 `[va, va + size)` 映射到从 `pa` 开始的物理页
    ///
    /// 目标页已映射时返回 `AlreadyExists`，已经建立的映射不回滚。
    pub fn map(
        &mut self,
        frames: &dyn FrameAllocator,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        flags: PteFlags,
    ) -> AxResult {
        assert!(is_aligned_4k(va.as_usize()), "map: va not aligned");
        assert!(size != 0 && size % PAGE_SIZE == 0, "map: bad size {:#x}", size);
        for off in (0..size).step_by(PAGE_SIZE) {
            let pte = walk(self.root, Some(frames), va.as_usize() + off).ok_or(AxError::NoMemory)?;
            if pte.is_valid() {
                return Err(AxError::AlreadyExists);
            }
            *pte = Pte::new(PhysAddr::from(pa.as_usize() + off), flags | PteFlags::V);
        }
        Ok(())
    }

    /// 解除从 va 开始 `npages` 个页的映射，不在内存中的页跳过
    pub fn unmap(&mut self, frames: &dyn FrameAllocator, va: VirtAddr, npages: usize, free: bool) {
        assert!(is_aligned_4k(va.as_usize()), "unmap: va not aligned");
        for i in 0..npages {
            let Some(pte) = walk(self.root, None, va.as_usize() + i * PAGE_SIZE) else {
                continue;
            };
            if !pte.is_valid() {
                continue;
            }
            assert!(pte.is_leaf(), "unmap: not a leaf");
            if free {
                frames.free(pte.pa());
            }
            *pte = Pte::EMPTY;
        }
    }

    /// 用户可访问页的物理地址
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let pte = self.lookup(va)?;
        (pte.is_valid() && pte.flags().contains(PteFlags::U)).then(|| pte.pa())
    }

    /// 为 `[old_sz, new_sz)` 分配并映射清零页，失败时回退到 `old_sz`
    pub fn grow(
        &mut self,
        frames: &dyn FrameAllocator,
        old_sz: usize,
        new_sz: usize,
        xperm: PteFlags,
    ) -> AxResult<usize> {
        if new_sz < old_sz {
            return Ok(old_sz);
        }
        let mut va = align_up_4k(old_sz);
        while va < new_sz {
            let mapped = Frame::alloc(frames).and_then(|frame| {
                self.map(frames, VirtAddr::from(va), frame.pa(), PAGE_SIZE, PteFlags::R | PteFlags::U | xperm)?;
                frame.into_pa();
                Ok(())
            });
            if let Err(err) = mapped {
                self.shrink(frames, va, old_sz);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        Ok(new_sz)
    }

    /// 释放 `[new_sz, old_sz)` 中已在内存的页，返回新的大小
    pub fn shrink(&mut self, frames: &dyn FrameAllocator, old_sz: usize, new_sz: usize) -> usize {
        if new_sz >= old_sz {
            return old_sz;
        }
        let (from, to) = (align_up_4k(new_sz), align_up_4k(old_sz));
        if from < to {
            self.unmap(frames, VirtAddr::from(from), (to - from) / PAGE_SIZE, true);
        }
        new_sz
    }

    /// 把 `[0, sz)` 中已在内存的页复制一份映射进 `child`
    ///
    /// 失败时撤销 child 中已复制的页。
    pub fn copy_into(&self, child: &mut PageTable, frames: &dyn FrameAllocator, sz: usize) -> AxResult {
        for va in (0..sz).step_by(PAGE_SIZE) {
            let Some(pte) = self.lookup(VirtAddr::from(va)).filter(|pte| pte.is_valid()) else {
                continue;
            };
            let copied = Frame::alloc(frames).and_then(|mut frame| {
                frame.bytes().copy_from_slice(unsafe { phys_page(pte.pa()) });
                child.map(frames, VirtAddr::from(va), frame.pa(), PAGE_SIZE, pte.flags())?;
                frame.into_pa();
                Ok(())
            });
            if let Err(err) = copied {
                child.unmap(frames, VirtAddr::from(0), va / PAGE_SIZE, true);
                return Err(err);
            }
        }
        Ok(())
    }

    /// 释放 `[0, sz)` 的用户页和所有页表页
    ///
    /// 其余区域（跳板页、trapframe、映射区）必须事先解除映射。
    pub fn destroy(mut self, frames: &dyn FrameAllocator, sz: usize) {
        if sz > 0 {
            self.unmap(frames, VirtAddr::from(0), align_up_4k(sz) / PAGE_SIZE, true);
        }
        free_walk(frames, self.root);
    }

    fn user_page(&self, va: usize, need: PteFlags) -> AxResult<PhysAddr> {
        self.lookup(VirtAddr::from(va))
            .filter(|pte| pte.is_valid() && pte.flags().contains(PteFlags::U | need))
            .map(|pte| pte.pa())
            .ok_or(AxError::BadAddress)
    }

    /// 从内核缓冲区复制到用户地址
    pub fn copy_out(&self, dst: VirtAddr, mut src: &[u8]) -> AxResult {
        let mut dst = dst.as_usize();
        while !src.is_empty() {
            let base = align_down_4k(dst);
            let pa = self.user_page(base, PteFlags::W)?;
            let off = dst - base;
            let n = (PAGE_SIZE - off).min(src.len());
            unsafe { phys_page(pa)[off..off + n].copy_from_slice(&src[..n]) };
            src = &src[n..];
            dst = base + PAGE_SIZE;
        }
        Ok(())
    }

    /// 从用户地址复制到内核缓冲区
    pub fn copy_in(&self, mut dst: &mut [u8], src: VirtAddr) -> AxResult {
        let mut src = src.as_usize();
        while !dst.is_empty() {
            let base = align_down_4k(src);
            let pa = self.user_page(base, PteFlags::R)?;
            let off = src - base;
            let n = (PAGE_SIZE - off).min(dst.len());
            dst[..n].copy_from_slice(unsafe { &phys_page(pa)[off..off + n] });
            dst = &mut core::mem::take(&mut dst)[n..];
            src = base + PAGE_SIZE;
        }
        Ok(())
    }
}
