//! 进程表管理：分配与回收进程槽、第一个进程、地址空间与快照

use alloc::string::String;
use alloc::sync::Arc;
use axerrno::{AxError, AxResult};
use core::sync::atomic::AtomicBool;
use lfs::{FileId, FileSystem, FileTable, Op};
use lmm::{Frame, FrameAllocator, PageTable, PhysAddr, PteFlags, VirtAddr, PAGE_SIZE, TRAMPOLINE, TRAPFRAME};
use memory_addr::{align_up_4k, is_aligned_4k};
use spin::{Mutex, Once};

use crate::arch::{Context, Hal};
use crate::fault::FaultKind;
use crate::param::{MAX_TICKETS, NOFILE, NPROC};
use crate::process::{Proc, ProcGuard, ProcInner, ProcState, Segment};
use crate::sched::CpuTable;
use crate::vma::VmaPool;

/// 第一个用户程序：exec("/init")，失败则 exit
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// `getpinfo` 返回给用户的进程表快照
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PStat {
    pub inuse: [i32; NPROC],
    pub tickets: [i32; NPROC],
    pub pid: [i32; NPROC],
    pub ticks: [i32; NPROC],
}

impl PStat {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, core::mem::size_of::<Self>())
        }
    }
}

/// 内核全局状态
///
/// 锁的顺序：`parents` 先于任何进程锁；进程锁先于映射区槽位锁。
pub struct Kernel {
    pub(crate) hal: &'static dyn Hal,
    pub(crate) frames: Arc<dyn FrameAllocator>,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) files: Arc<FileTable>,
    pub(crate) procs: [Proc; NPROC],
    /// 每个槽位的父进程槽位
    pub(crate) parents: Mutex<[Option<usize>; NPROC]>,
    next_pid: Mutex<usize>,
    init_proc: Once<usize>,
    pub(crate) vmas: VmaPool,
    pub(crate) cpus: CpuTable,
    pub(crate) ticks: Mutex<u64>,
    pub(crate) fs_started: AtomicBool,
}

impl Kernel {
    pub fn new(
        hal: &'static dyn Hal,
        frames: Arc<dyn FrameAllocator>,
        fs: Arc<dyn FileSystem>,
        files: Arc<FileTable>,
    ) -> Self {
        Self {
            hal,
            frames,
            fs,
            files,
            procs: core::array::from_fn(|slot| Proc::new(slot, hal.kernel_stack(slot))),
            parents: Mutex::new([None; NPROC]),
            next_pid: Mutex::new(1),
            init_proc: Once::new(),
            vmas: VmaPool::new(),
            cpus: CpuTable::new(),
            ticks: Mutex::new(0),
            fs_started: AtomicBool::new(false),
        }
    }

    pub fn hal(&self) -> &'static dyn Hal {
        self.hal
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn fs(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    pub fn proc(&self, slot: usize) -> &Proc {
        &self.procs[slot]
    }

    pub fn find_proc(&self, pid: usize) -> Option<&Proc> {
        self.procs.iter().find(|p| {
            let inner = p.inner.lock();
            inner.state != ProcState::Unused && inner.pid == pid
        })
    }

    /// 当前正在使用的映射区槽位数
    pub fn vmas_in_use(&self) -> usize {
        self.vmas.in_use()
    }

    pub fn parent_of(&self, p: &Proc) -> Option<usize> {
        self.parents.lock()[p.slot()]
    }

    pub(crate) fn init_slot(&self) -> Option<usize> {
        self.init_proc.get().copied()
    }

    fn alloc_pid(&self) -> usize {
        let mut next = self.next_pid.lock();
        let pid = *next;
        *next += 1;
        pid
    }

    /// 找一个空闲槽位并准备好 trapframe、页表与内核上下文
    ///
    /// 成功时返回的进程处于 USED 状态，并且仍持有它的锁。
    pub(crate) fn alloc_proc(&self) -> AxResult<(&Proc, ProcGuard<'_>)> {
        for p in &self.procs {
            let mut inner = p.inner.lock();
            if inner.state != ProcState::Unused {
                continue;
            }
            inner.pid = self.alloc_pid();
            inner.state = ProcState::Used;
            inner.tickets = 1;
            inner.ticks = 0;
            if let Err(err) = self.setup_proc(p) {
                self.free_proc(p, &mut inner);
                return Err(err);
            }
            return Ok((p, inner));
        }
        log::warn!("alloc_proc: process table full");
        Err(AxError::NoMemory)
    }

    fn setup_proc(&self, p: &Proc) -> AxResult {
        let data = unsafe { p.data_mut() };
        let trapframe = Frame::alloc(self.frames.as_ref())?;
        let pagetable = self.proc_pagetable(trapframe.pa())?;
        data.trapframe = Some(trapframe.into_pa());
        data.pagetable = Some(pagetable);
        data.nmp = TRAPFRAME;
        data.context = Context {
            ra: self.hal.fork_return_entry(),
            sp: data.kstack + PAGE_SIZE,
            ..Context::default()
        };
        Ok(())
    }

    /// 新的用户页表，只映射跳板页和 trapframe，二者都不允许用户访问
    fn proc_pagetable(&self, trapframe: PhysAddr) -> AxResult<PageTable> {
        let frames = self.frames.as_ref();
        let mut pt = PageTable::new(frames)?;
        let trampoline = pt.map(
            frames,
            VirtAddr::from(TRAMPOLINE),
            self.hal.trampoline(),
            PAGE_SIZE,
            PteFlags::R | PteFlags::X,
        );
        if let Err(err) = trampoline {
            pt.destroy(frames, 0);
            return Err(err);
        }
        let mapped = pt.map(
            frames,
            VirtAddr::from(TRAPFRAME),
            trapframe,
            PAGE_SIZE,
            PteFlags::R | PteFlags::W,
        );
        if let Err(err) = mapped {
            pt.unmap(frames, VirtAddr::from(TRAMPOLINE), 1, false);
            pt.destroy(frames, 0);
            return Err(err);
        }
        Ok(pt)
    }

    fn free_pagetable(&self, mut pt: PageTable, sz: usize) {
        let frames = self.frames.as_ref();
        pt.unmap(frames, VirtAddr::from(TRAMPOLINE), 1, false);
        pt.unmap(frames, VirtAddr::from(TRAPFRAME), 1, false);
        pt.destroy(frames, sz);
    }

    /// 回收进程槽的全部资源，调用者持有它的锁
    pub(crate) fn free_proc(&self, p: &Proc, inner: &mut ProcInner) {
        self.discard_vmas(p);
        let data = unsafe { p.data_mut() };
        for fd in data.ofile.iter_mut() {
            if let Some(file) = fd.take() {
                self.files.close(file, self.fs.as_ref());
            }
        }
        if let Some(pt) = data.pagetable.take() {
            self.free_pagetable(pt, data.sz);
        }
        if let Some(trapframe) = data.trapframe.take() {
            self.frames.free(trapframe);
        }
        let cwd = data.cwd.take();
        let text = core::mem::take(&mut data.text);
        let segment = core::mem::take(&mut data.data);
        if cwd.is_some() || text.inode.is_some() || segment.inode.is_some() {
            let _op = Op::begin(self.fs.as_ref());
            drop((cwd, text, segment));
        }
        data.sz = 0;
        data.nmp = TRAPFRAME;
        data.name.clear();
        *inner = ProcInner::default();
    }

    /// 创建第一个用户进程，把 initcode 放在地址 0
    pub fn create_first_process(&self) -> AxResult<usize> {
        let (p, mut inner) = self.alloc_proc()?;
        if let Err(err) = self.load_initcode(p) {
            self.free_proc(p, &mut inner);
            return Err(err);
        }
        inner.state = ProcState::Runnable;
        self.init_proc.call_once(|| p.slot());
        log::info!("first process pid {} ready", inner.pid);
        Ok(inner.pid)
    }

    fn load_initcode(&self, p: &Proc) -> AxResult {
        let frames = self.frames.as_ref();
        let data = unsafe { p.data_mut() };
        let mut frame = Frame::alloc(frames)?;
        frame.bytes()[..INITCODE.len()].copy_from_slice(&INITCODE);
        let flags = PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U;
        data.page_table_mut()?
            .map(frames, VirtAddr::from(0), frame.pa(), PAGE_SIZE, flags)?;
        frame.into_pa();
        data.sz = PAGE_SIZE;
        let tf = unsafe { p.trapframe() };
        tf.epc = 0;
        tf.sp = PAGE_SIZE;
        data.name = String::from("initcode");
        data.cwd = self.fs.namei("/");
        Ok(())
    }

    /// 记录按需加载的代码段与数据段，并丢弃原有线性区
    ///
    /// 由 exec 路径调用；两段都必须页对齐并位于 `[0, sz)` 内。
    pub fn install_image(&self, p: &Proc, text: Segment, segment: Segment, sz: usize) -> AxResult {
        let data = unsafe { p.data_mut() };
        let fits = |seg: &Segment| is_aligned_4k(seg.base) && seg.base + seg.size <= sz;
        if !fits(&text) || !fits(&segment) || align_up_4k(sz) > data.nmp {
            return Err(AxError::InvalidInput);
        }
        let old_sz = data.sz;
        data.sz = data.page_table_mut()?.shrink(self.frames.as_ref(), old_sz, 0);
        let _op = Op::begin(self.fs.as_ref());
        data.text = text;
        data.data = segment;
        data.sz = sz;
        Ok(())
    }

    /// 调整线性区大小，正数增长、负数收缩
    pub fn grow_address_space(&self, p: &Proc, delta: isize) -> AxResult<usize> {
        let data = unsafe { p.data_mut() };
        let frames = self.frames.as_ref();
        let sz = data.sz;
        let nmp = data.nmp;
        let pt = data.page_table_mut()?;
        let new_sz = if delta > 0 {
            let target = sz
                .checked_add(delta as usize)
                .filter(|&target| align_up_4k(target) <= nmp)
                .ok_or(AxError::NoMemory)?;
            pt.grow(frames, sz, target, PteFlags::W)?
        } else if delta < 0 {
            let target = sz.checked_sub(delta.unsigned_abs()).ok_or(AxError::InvalidInput)?;
            pt.shrink(frames, sz, target)
        } else {
            sz
        };
        data.sz = new_sz;
        Ok(new_sz)
    }

    /// 设置彩票数，超过 [`MAX_TICKETS`] 的部分被截掉
    pub fn set_tickets(&self, p: &Proc, tickets: isize) -> AxResult {
        if tickets < 1 {
            return Err(AxError::InvalidInput);
        }
        let tickets = (tickets as usize).min(MAX_TICKETS);
        p.inner.lock().tickets = tickets;
        Ok(())
    }

    /// 进程表快照，逐个槽位加锁读取，不保证槽位之间一致
    pub fn snapshot(&self) -> PStat {
        let mut st = PStat {
            inuse: [0; NPROC],
            tickets: [0; NPROC],
            pid: [0; NPROC],
            ticks: [0; NPROC],
        };
        for (i, p) in self.procs.iter().enumerate() {
            let inner = p.inner.lock();
            st.inuse[i] = (inner.state != ProcState::Unused) as i32;
            st.tickets[i] = inner.tickets as i32;
            st.pid[i] = inner.pid as i32;
            st.ticks[i] = inner.ticks as i32;
        }
        st
    }

    /// 把快照复制到进程 `p` 的 `addr` 处
    pub fn get_process_snapshot(&self, p: &Proc, addr: VirtAddr) -> AxResult {
        let st = self.snapshot();
        self.copy_out(p, addr, st.as_bytes())
    }

    /// 在进程的文件描述符表中放入一个打开文件
    pub fn fd_alloc(&self, p: &Proc, file: FileId) -> AxResult<usize> {
        let data = unsafe { p.data_mut() };
        for (fd, entry) in data.ofile.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(file);
                return Ok(fd);
            }
        }
        Err(AxError::NoMemory)
    }

    pub fn fd_close(&self, p: &Proc, fd: usize) -> AxResult {
        if fd >= NOFILE {
            return Err(AxError::InvalidInput);
        }
        let file = unsafe { p.data_mut() }.ofile[fd]
            .take()
            .ok_or(AxError::InvalidInput)?;
        self.files.close(file, self.fs.as_ref());
        Ok(())
    }

    /// 复制到用户地址，缺页或写时复制页先经缺页处理解决
    pub fn copy_out(&self, p: &Proc, dst: VirtAddr, src: &[u8]) -> AxResult {
        self.fault_in(p, dst, src.len(), FaultKind::Store)?;
        unsafe { p.data() }.page_table()?.copy_out(dst, src)
    }

    pub fn copy_in(&self, p: &Proc, dst: &mut [u8], src: VirtAddr) -> AxResult {
        self.fault_in(p, src, dst.len(), FaultKind::Load)?;
        unsafe { p.data() }.page_table()?.copy_in(dst, src)
    }

    /// 打印进程表，调试用；正被占用的槽位不等待
    pub fn procdump(&self) {
        for p in &self.procs {
            let Some(inner) = p.inner.try_lock() else {
                log::info!("slot {}: busy", p.slot());
                continue;
            };
            if inner.state == ProcState::Unused {
                continue;
            }
            // 名字只在槽位尚不可见或持有槽位锁时写入
            let name = &unsafe { p.data() }.name;
            log::info!(
                "{} {:?} {} tickets={} ticks={}",
                inner.pid,
                inner.state,
                name,
                inner.tickets,
                inner.ticks
            );
        }
    }
}
