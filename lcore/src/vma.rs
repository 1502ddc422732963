//! 文件映射区（mmap / munmap）
//!
//! 映射只做登记，不分配物理页；页面在第一次访问时由缺页处理读入。

use axerrno::{AxError, AxResult};
use lfs::{FileId, InodeLock, Op, MAX_WRITE_CHUNK};
use lmm::{pages_of, phys_page, PteFlags, VirtAddr, PAGE_SIZE, TRAPFRAME};
use memory_addr::{align_up_4k, is_aligned_4k};
use spin::{Mutex, MutexGuard};

use crate::manager::Kernel;
use crate::param::{NVMAS, PER_PROCESS_VMAS};
use crate::process::Proc;

pub const PROT_READ: usize = 1;
pub const PROT_WRITE: usize = 2;
pub const PROT_RW: usize = 3;
/// 不支持可执行映射
pub const PROT_EXEC: usize = 6;

pub const MAP_SHARED: usize = 4;
pub const MAP_PRIVATE: usize = 5;

pub const MAP_FAILED: usize = usize::MAX;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Prot {
    #[default]
    Read,
    Write,
    ReadWrite,
}

impl Prot {
    pub fn from_bits(prot: usize) -> AxResult<Self> {
        match prot {
            PROT_READ => Ok(Self::Read),
            PROT_WRITE => Ok(Self::Write),
            PROT_RW => Ok(Self::ReadWrite),
            _ => Err(AxError::InvalidInput),
        }
    }

    pub fn writable(self) -> bool {
        self != Self::Read
    }

    /// 叶子页表项不允许只写，只写映射按读写处理
    pub fn pte_flags(self) -> PteFlags {
        match self {
            Self::Read => PteFlags::R,
            Self::Write | Self::ReadWrite => PteFlags::R | PteFlags::W,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Share {
    Shared,
    #[default]
    Private,
}

impl Share {
    pub fn from_bits(flags: usize) -> AxResult<Self> {
        match flags {
            MAP_SHARED => Ok(Self::Shared),
            MAP_PRIVATE => Ok(Self::Private),
            _ => Err(AxError::InvalidInput),
        }
    }
}

/// 一个映射区
#[derive(Debug, Default, Clone)]
pub struct Vma {
    pub used: bool,
    pub base: usize,
    /// 总是页大小的整数倍
    pub size: usize,
    pub prot: Prot,
    pub share: Share,
    /// `base` 对应的文件偏移
    pub offset: usize,
    /// 建立映射时使用的文件描述符
    pub fd: usize,
    pub file: Option<FileId>,
}

impl Vma {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn contains(&self, va: usize) -> bool {
        va >= self.base && va < self.end()
    }

    /// fork 时双方共享页面使用的权限：私有映射去掉写权限，等待写时复制
    fn fork_flags(&self) -> PteFlags {
        match self.share {
            Share::Shared => self.prot.pte_flags(),
            Share::Private => PteFlags::R,
        }
    }
}

/// 全局映射区池，每个槽位一把锁
pub(crate) struct VmaPool {
    slots: [Mutex<Vma>; NVMAS],
}

impl VmaPool {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Mutex::new(Vma::default())),
        }
    }

    fn claim(&self, vma: Vma) -> AxResult<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut entry = slot.lock();
            if !entry.used {
                *entry = Vma { used: true, ..vma };
                return Ok(idx);
            }
        }
        log::warn!("vma pool exhausted");
        Err(AxError::NoMemory)
    }

    pub(crate) fn get(&self, idx: usize) -> MutexGuard<'_, Vma> {
        self.slots[idx].lock()
    }

    fn release(&self, idx: usize) {
        *self.slots[idx].lock() = Vma::default();
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.lock().used).count()
    }
}

/// 一次 munmap 覆盖的形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Whole,
    Prefix,
    Suffix,
}

impl Kernel {
    /// 在进程 `p` 中为描述符 `fd` 建立一个映射区，返回起始地址
    pub fn map_region(
        &self,
        p: &Proc,
        length: usize,
        prot: Prot,
        share: Share,
        fd: usize,
        offset: usize,
    ) -> AxResult<VirtAddr> {
        if length == 0 || !is_aligned_4k(offset) {
            return Err(AxError::InvalidInput);
        }
        let data = unsafe { p.data_mut() };
        let file = data
            .ofile
            .get(fd)
            .copied()
            .flatten()
            .ok_or(AxError::InvalidInput)?;
        if !self.files.readable(file) {
            return Err(AxError::PermissionDenied);
        }
        if share == Share::Shared && prot.writable() && !self.files.writable(file) {
            return Err(AxError::PermissionDenied);
        }

        if length > TRAPFRAME {
            return Err(AxError::NoMemory);
        }
        let size = align_up_4k(length);
        let base = match data.nmp.checked_sub(size) {
            Some(base) if base >= align_up_4k(data.sz) => base,
            _ => return Err(AxError::NoMemory),
        };
        let slot = data
            .vmas
            .iter()
            .position(Option::is_none)
            .ok_or(AxError::NoMemory)?;
        let idx = self.vmas.claim(Vma {
            used: true,
            base,
            size,
            prot,
            share,
            offset,
            fd,
            file: Some(self.files.dup(file)),
        });
        let idx = match idx {
            Ok(idx) => idx,
            Err(err) => {
                self.files.close(file, self.fs.as_ref());
                return Err(err);
            }
        };
        data.vmas[slot] = Some(idx);
        data.nmp = base;
        log::debug!(
            "mmap: pid {} [{:#x}, {:#x}) {:?} {:?} fd {}",
            p.pid(),
            base,
            base + size,
            prot,
            share,
            fd
        );
        Ok(VirtAddr::from(base))
    }

    /// 解除 `[addr, addr + size)` 的映射
    ///
    /// 只能去掉整个映射区、它的开头或结尾。共享映射先把在内存中的页写回文件。
    pub fn unmap_region(&self, p: &Proc, addr: VirtAddr, size: usize) -> AxResult {
        let addr = addr.as_usize();
        if !is_aligned_4k(addr) || size % PAGE_SIZE != 0 {
            return Err(AxError::InvalidInput);
        }
        if size == 0 {
            return Ok(());
        }
        let (slot, idx, vma) = self.find_vma(p, addr).ok_or(AxError::NotFound)?;
        let end = addr.checked_add(size).ok_or(AxError::InvalidInput)?;
        if end > vma.end() {
            return Err(AxError::InvalidInput);
        }
        let shape = if addr == vma.base && end == vma.end() {
            Shape::Whole
        } else if addr == vma.base {
            Shape::Prefix
        } else if end == vma.end() {
            Shape::Suffix
        } else {
            return Err(AxError::Unsupported);
        };

        if vma.share == Share::Shared {
            self.write_back(p, &vma, addr, end)?;
        }
        self.release_pages(p, addr, end);

        match shape {
            Shape::Whole => self.drop_vma(p, slot, idx),
            Shape::Prefix => {
                let mut entry = self.vmas.get(idx);
                entry.base += size;
                entry.offset += size;
                entry.size -= size;
            }
            Shape::Suffix => self.vmas.get(idx).size -= size,
        }
        self.update_nmp(p);
        log::debug!("munmap: pid {} [{:#x}, {:#x}) {:?}", p.pid(), addr, end, shape);
        Ok(())
    }

    /// 找到包含 `va` 的映射区：(进程内槽位, 全局槽位, 映射区副本)
    pub(crate) fn find_vma(&self, p: &Proc, va: usize) -> Option<(usize, usize, Vma)> {
        unsafe { p.data() }
            .vmas
            .iter()
            .enumerate()
            .filter_map(|(slot, idx)| idx.map(|idx| (slot, idx)))
            .find_map(|(slot, idx)| {
                let vma = self.vmas.get(idx);
                (vma.used && vma.contains(va)).then(|| (slot, idx, vma.clone()))
            })
    }

    /// 把 `[from, to)` 中在内存的页写回文件，每块写入各自占用一个事务
    fn write_back(&self, p: &Proc, vma: &Vma, from: usize, to: usize) -> AxResult {
        let file = vma.file.ok_or(AxError::BadState)?;
        let inode = self.files.inode(file).ok_or(AxError::BadState)?;
        let pt = unsafe { p.data() }.page_table()?;
        for va in (from..to).step_by(PAGE_SIZE) {
            let Some(pa) = pt.translate(VirtAddr::from(va)) else {
                continue;
            };
            let page = unsafe { phys_page(pa) };
            let file_off = vma.offset + (va - vma.base);
            for start in (0..PAGE_SIZE).step_by(MAX_WRITE_CHUNK) {
                let _op = Op::begin(self.fs.as_ref());
                let ip = InodeLock::new(inode.as_ref());
                let pos = file_off + start;
                // 不把文件末尾之外的部分写回
                if pos >= ip.size() {
                    break;
                }
                let n = MAX_WRITE_CHUNK.min(PAGE_SIZE - start).min(ip.size() - pos);
                if ip.write_at(pos, &page[start..start + n])? != n {
                    return Err(AxError::Io);
                }
            }
        }
        Ok(())
    }

    /// 释放 `[from, to)` 中在内存的页，页帧在最后一个引用消失时回收
    fn release_pages(&self, p: &Proc, from: usize, to: usize) {
        let data = unsafe { p.data_mut() };
        if let Some(pt) = data.pagetable.as_mut() {
            pt.unmap(
                self.frames.as_ref(),
                VirtAddr::from(from),
                pages_of(to - from),
                true,
            );
        }
    }

    fn drop_vma(&self, p: &Proc, slot: usize, idx: usize) {
        let file = self.vmas.get(idx).file;
        if let Some(file) = file {
            self.files.close(file, self.fs.as_ref());
        }
        self.vmas.release(idx);
        unsafe { p.data_mut() }.vmas[slot] = None;
    }

    fn update_nmp(&self, p: &Proc) {
        let data = unsafe { p.data_mut() };
        data.nmp = data
            .vmas
            .iter()
            .flatten()
            .map(|&idx| self.vmas.get(idx).base)
            .min()
            .unwrap_or(TRAPFRAME);
    }

    /// 进程退出时解除所有映射区，共享映射照常写回
    pub(crate) fn unmap_all(&self, p: &Proc) {
        for slot in 0..PER_PROCESS_VMAS {
            let Some(idx) = unsafe { p.data() }.vmas[slot] else {
                continue;
            };
            let (base, size) = {
                let vma = self.vmas.get(idx);
                (vma.base, vma.size)
            };
            if let Err(err) = self.unmap_region(p, VirtAddr::from(base), size) {
                log::warn!("exit: pid {} write-back of {:#x} failed: {:?}", p.pid(), base, err);
                self.discard_vma(p, slot, idx);
            }
        }
    }

    /// 不写回，直接丢弃进程剩下的映射区
    pub(crate) fn discard_vmas(&self, p: &Proc) {
        for slot in 0..PER_PROCESS_VMAS {
            if let Some(idx) = unsafe { p.data() }.vmas[slot] {
                self.discard_vma(p, slot, idx);
            }
        }
    }

    fn discard_vma(&self, p: &Proc, slot: usize, idx: usize) {
        let (base, end) = {
            let vma = self.vmas.get(idx);
            (vma.base, vma.end())
        };
        self.release_pages(p, base, end);
        self.drop_vma(p, slot, idx);
        self.update_nmp(p);
    }

    /// fork 时为子进程复制映射区
    ///
    /// 子进程的映射区与父进程地址相同、共享同一个打开文件。在内存的页由双方共享：
    /// 共享映射保留声明的权限，私有映射双方都去掉写权限，写入时再复制。
    pub(crate) fn fork_vmas(&self, parent: &Proc, child: &Proc) -> AxResult {
        let pdata = unsafe { parent.data_mut() };
        let cdata = unsafe { child.data_mut() };
        let mut downgraded = false;
        let slots = pdata.vmas;
        for (slot, idx) in slots.into_iter().enumerate() {
            let Some(idx) = idx else {
                continue;
            };
            let vma = self.vmas.get(idx).clone();
            let file = vma.file.ok_or(AxError::BadState)?;
            let cidx = self.vmas.claim(Vma {
                file: Some(self.files.dup(file)),
                ..vma.clone()
            });
            let cidx = match cidx {
                Ok(cidx) => cidx,
                Err(err) => {
                    self.files.close(file, self.fs.as_ref());
                    return Err(err);
                }
            };
            cdata.vmas[slot] = Some(cidx);

            let flags = vma.fork_flags() | PteFlags::U;
            let ppt = pdata.page_table_mut()?;
            let cpt = cdata.page_table_mut()?;
            for va in (vma.base..vma.end()).step_by(PAGE_SIZE) {
                let va = VirtAddr::from(va);
                let Some(pte) = ppt.entry_mut(va).filter(|pte| pte.is_valid()) else {
                    continue;
                };
                let pa = pte.pa();
                if vma.share == Share::Private {
                    pte.set_flags(flags | PteFlags::V);
                    downgraded = true;
                }
                cpt.map(self.frames.as_ref(), va, pa, PAGE_SIZE, flags)?;
                self.frames.incref(pa);
            }
        }
        cdata.nmp = pdata.nmp;
        if downgraded {
            self.hal.flush_tlb();
        }
        Ok(())
    }
}
