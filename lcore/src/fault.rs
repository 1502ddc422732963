//! 缺页处理：代码段与数据段按需加载、映射区按需读入、写时复制

use axerrno::{AxError, AxResult};
use lfs::InodeLock;
use lmm::{phys_page, Frame, PageTable, Pte, PteFlags, VirtAddr, MAXVA, PAGE_SIZE};
use memory_addr::align_down_4k;

use crate::manager::Kernel;
use crate::process::{Proc, Segment};
use crate::vma::Vma;

/// 缺页类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Instruction,
    Load,
    /// 写或原子操作
    Store,
}

impl Kernel {
    /// 解决进程 `p` 在 `va` 处的缺页
    ///
    /// 按顺序尝试：映射区内已在内存的页上的写错误按写时复制处理；
    /// 代码段从可执行文件读入；数据段分配清零页；映射区从文件读入。
    /// 都不满足时返回错误，由调用者决定杀死进程还是报告地址错误。
    pub fn resolve_fault(&self, p: &Proc, kind: FaultKind, va: VirtAddr) -> AxResult {
        let va = va.as_usize();
        if va >= MAXVA {
            return Err(AxError::BadAddress);
        }
        let page = align_down_4k(va);
        let vma = self.find_vma(p, va).map(|(_, _, vma)| vma);
        let data = unsafe { p.data_mut() };
        let pt = data.pagetable.as_mut().ok_or(AxError::BadState)?;
        let resident = pt.lookup(VirtAddr::from(page)).filter(|pte| pte.is_valid());

        if let Some(pte) = resident {
            return match (kind, &vma) {
                (FaultKind::Store, Some(vma)) => self.copy_on_write(pt, page, pte, vma),
                // 页已在内存，访问权限本身不允许
                _ => Err(AxError::PermissionDenied),
            };
        }
        if data.text.contains(va) {
            log::trace!("fault: text page {:#x}", page);
            return self.load_page(pt, page, &data.text, PteFlags::R | PteFlags::X);
        }
        if data.data.contains(va) {
            log::trace!("fault: data page {:#x}", page);
            let zeroed = Frame::alloc(self.frames.as_ref())?;
            return self.install(pt, page, zeroed, PteFlags::R | PteFlags::W);
        }
        if let Some(vma) = vma {
            log::trace!("fault: vma page {:#x}", page);
            return self.load_vma_page(pt, page, &vma);
        }
        Err(AxError::NotFound)
    }

    /// 陷入路径上的缺页：解决不了就标记进程被杀死
    pub fn handle_page_fault(&self, p: &Proc, kind: FaultKind, va: VirtAddr) {
        if let Err(err) = self.resolve_fault(p, kind, va) {
            log::error!(
                "pid {}: unresolved {:?} fault at {:#x} ({:?}), killing",
                p.pid(),
                kind,
                va.as_usize(),
                err
            );
            p.set_killed();
        }
    }

    /// 确保 `[start, start + len)` 的每一页都可以按 `kind` 访问
    pub(crate) fn fault_in(&self, p: &Proc, start: VirtAddr, len: usize, kind: FaultKind) -> AxResult {
        if len == 0 {
            return Ok(());
        }
        let start = start.as_usize();
        let end = start
            .checked_add(len)
            .filter(|&end| end <= MAXVA)
            .ok_or(AxError::BadAddress)?;
        let need = match kind {
            FaultKind::Store => PteFlags::U | PteFlags::W,
            _ => PteFlags::U | PteFlags::R,
        };
        for page in (align_down_4k(start)..end).step_by(PAGE_SIZE) {
            let va = VirtAddr::from(page);
            let ready = unsafe { p.data() }
                .page_table()?
                .lookup(va)
                .is_some_and(|pte| pte.is_valid() && pte.flags().contains(need));
            if !ready {
                self.resolve_fault(p, kind, va)
                    .map_err(|_| AxError::BadAddress)?;
            }
        }
        Ok(())
    }

    fn copy_on_write(&self, pt: &mut PageTable, page: usize, pte: Pte, vma: &Vma) -> AxResult {
        if !vma.prot.writable() {
            return Err(AxError::PermissionDenied);
        }
        let old = pte.pa();
        let entry = pt
            .entry_mut(VirtAddr::from(page))
            .ok_or(AxError::BadState)?;
        if self.frames.refcount(old) > 1 {
            let mut frame = Frame::alloc(self.frames.as_ref())?;
            frame.bytes().copy_from_slice(unsafe { phys_page(old) });
            *entry = Pte::new(frame.into_pa(), pte.flags() | PteFlags::W);
            self.frames.free(old);
            log::trace!("fault: copied shared page {:#x}", page);
        } else {
            entry.set_flags(pte.flags() | PteFlags::W);
        }
        self.hal.flush_tlb();
        Ok(())
    }

    fn load_page(&self, pt: &mut PageTable, page: usize, seg: &Segment, flags: PteFlags) -> AxResult {
        let inode = seg.inode.as_ref().ok_or(AxError::NotFound)?;
        let mut frame = Frame::alloc(self.frames.as_ref())?;
        let len = PAGE_SIZE.min(seg.base + seg.size - page);
        {
            let ip = InodeLock::new(inode.as_ref());
            ip.read_at(seg.offset + (page - seg.base), &mut frame.bytes()[..len])?;
        }
        self.install(pt, page, frame, flags)
    }

    fn load_vma_page(&self, pt: &mut PageTable, page: usize, vma: &Vma) -> AxResult {
        let file = vma.file.ok_or(AxError::BadState)?;
        let inode = self.files.inode(file).ok_or(AxError::BadState)?;
        let mut frame = Frame::alloc(self.frames.as_ref())?;
        {
            let ip = InodeLock::new(inode.as_ref());
            ip.read_at(vma.offset + (page - vma.base), frame.bytes())?;
        }
        self.install(pt, page, frame, vma.prot.pte_flags())
    }

    fn install(&self, pt: &mut PageTable, page: usize, frame: Frame<'_>, flags: PteFlags) -> AxResult {
        pt.map(
            self.frames.as_ref(),
            VirtAddr::from(page),
            frame.pa(),
            PAGE_SIZE,
            flags | PteFlags::U,
        )?;
        frame.into_pa();
        Ok(())
    }
}
