//! 进程控制块

use alloc::string::String;
use axerrno::{AxError, AxResult};
use core::cell::UnsafeCell;
use lfs::{FileId, InodeRef};
use lmm::{phys_page, PageTable, PhysAddr, TRAPFRAME};
use spin::{Mutex, MutexGuard};

use crate::arch::{Context, TrapFrame};
use crate::param::{NOFILE, PER_PROCESS_VMAS};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// 睡眠等待的对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// 某个进程槽，`wait` 在自己的槽上睡眠
    Proc(usize),
    /// 时钟滴答
    Ticks,
    /// 其他内核对象，按地址区分
    Addr(usize),
}

/// 受进程锁保护的字段
#[derive(Debug, Default)]
pub struct ProcInner {
    pub state: ProcState,
    pub chan: Option<Channel>,
    pub killed: bool,
    pub xstate: i32,
    pub pid: usize,
    /// 彩票数
    pub tickets: usize,
    /// 被调度运行的次数
    pub ticks: usize,
}

pub type ProcGuard<'a> = MutexGuard<'a, ProcInner>;

/// 可执行文件中按需加载的一段
#[derive(Clone, Default)]
pub struct Segment {
    pub base: usize,
    pub size: usize,
    /// 段内容在文件中的偏移
    pub offset: usize,
    /// 为空时按清零页处理
    pub inode: Option<InodeRef>,
}

impl Segment {
    pub fn contains(&self, va: usize) -> bool {
        self.size > 0 && va >= self.base && va - self.base < self.size
    }
}

/// 进程私有的字段，只由进程自身访问，或在进程尚不可见时由创建者访问
pub struct ProcData {
    pub kstack: usize,
    /// 线性区大小
    pub sz: usize,
    /// 映射区的最低地址，新映射区从这里向下分配
    pub nmp: usize,
    pub pagetable: Option<PageTable>,
    pub trapframe: Option<PhysAddr>,
    pub context: Context,
    pub ofile: [Option<FileId>; NOFILE],
    pub cwd: Option<InodeRef>,
    pub name: String,
    pub text: Segment,
    pub data: Segment,
    /// 全局映射区池中的槽位
    pub vmas: [Option<usize>; PER_PROCESS_VMAS],
}

impl ProcData {
    fn new(kstack: usize) -> Self {
        Self {
            kstack,
            sz: 0,
            nmp: TRAPFRAME,
            pagetable: None,
            trapframe: None,
            context: Context::default(),
            ofile: [None; NOFILE],
            cwd: None,
            name: String::new(),
            text: Segment::default(),
            data: Segment::default(),
            vmas: [None; PER_PROCESS_VMAS],
        }
    }

    pub fn page_table(&self) -> AxResult<&PageTable> {
        self.pagetable.as_ref().ok_or(AxError::BadState)
    }

    pub fn page_table_mut(&mut self) -> AxResult<&mut PageTable> {
        self.pagetable.as_mut().ok_or(AxError::BadState)
    }
}

/// 进程表中的一个槽位
pub struct Proc {
    slot: usize,
    pub inner: Mutex<ProcInner>,
    data: UnsafeCell<ProcData>,
}

unsafe impl Sync for Proc {}

impl Proc {
    pub(crate) fn new(slot: usize, kstack: usize) -> Self {
        Self {
            slot,
            inner: Mutex::new(ProcInner::default()),
            data: UnsafeCell::new(ProcData::new(kstack)),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> usize {
        self.inner.lock().pid
    }

    pub fn killed(&self) -> bool {
        self.inner.lock().killed
    }

    pub fn set_killed(&self) {
        self.inner.lock().killed = true;
    }

    /// # Safety
    ///
    /// 同 [`Proc::data_mut`]；此外调用者持有返回的引用期间不能有人修改这些字段。
    pub unsafe fn data(&self) -> &ProcData {
        &*self.data.get()
    }

    /// # Safety
    ///
    /// 只能由进程自身调用，或者在进程还没有对其他 CPU 可见时由创建者调用。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        &mut *self.data.get()
    }

    /// # Safety
    ///
    /// 同 [`Proc::data_mut`]。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn trapframe(&self) -> &mut TrapFrame {
        let Some(pa) = self.data().trapframe else {
            panic!("proc slot {}: no trapframe", self.slot);
        };
        &mut *(phys_page(pa).as_mut_ptr() as *mut TrapFrame)
    }
}
