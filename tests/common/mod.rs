//! 集成测试公共部分：宿主机上的 HAL、页帧池与内存文件系统

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use lcore::arch::{Context, Hal};
use lcore::{Kernel, Proc, ProcData, ProcState};
use lfs::{FileTable, MemFs, MemInode};
use lmm::{FramePool, PhysAddr, VirtAddr, PAGE_SIZE};
use spin::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

/// 没有真正的上下文切换：每次切换依次执行一个预先登记的钩子，
/// 钩子扮演调度器和其他进程，返回后被切走的进程继续执行。
pub struct TestHal {
    hooks: Mutex<VecDeque<Hook>>,
}

impl TestHal {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn on_switch(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().push_back(Box::new(hook));
    }

    pub fn pending_hooks(&self) -> usize {
        self.hooks.lock().len()
    }
}

impl Hal for TestHal {
    fn cpu_id(&self) -> usize {
        0
    }

    fn enable_irqs(&self) {}

    fn disable_irqs(&self) {}

    fn irqs_enabled(&self) -> bool {
        false
    }

    /// 测试中没有中断会到来，调度循环空转到这里就结束
    fn wait_for_irq(&self) {
        panic!("调度器空闲");
    }

    unsafe fn switch_context(&self, _save: *mut Context, _restore: *const Context) {
        let hook = self.hooks.lock().pop_front();
        match hook {
            Some(hook) => hook(),
            None => panic!("切换上下文时没有登记钩子"),
        }
    }

    fn trampoline(&self) -> PhysAddr {
        PhysAddr::from(0x8000_0000)
    }

    fn kernel_stack(&self, slot: usize) -> usize {
        0x4000_0000 + slot * 2 * PAGE_SIZE
    }

    fn fork_return_entry(&self) -> usize {
        0x8020_0000
    }

    fn return_to_user(&self, _satp: usize, _trapframe: PhysAddr) -> ! {
        panic!("测试中不会返回用户态");
    }
}

/// 测试线程就是唯一访问进程私有字段的一方
pub fn data(p: &Proc) -> &ProcData {
    unsafe { p.data() }
}

/// `va` 所在的页是否已在内存
pub fn resident(p: &Proc, va: VirtAddr) -> bool {
    data(p)
        .page_table()
        .ok()
        .and_then(|pt| pt.lookup(VirtAddr::from(va.as_usize() & !(PAGE_SIZE - 1))))
        .is_some_and(|pte| pte.is_valid())
}

pub struct Boot {
    pub k: &'static Kernel,
    pub hal: &'static TestHal,
    pub frames: Arc<FramePool>,
    pub fs: Arc<MemFs>,
}

pub fn boot() -> Boot {
    try_boot(4096).unwrap()
}

/// 用给定容量的页帧池启动，第一个进程创建失败时返回 None
pub fn try_boot(frames: usize) -> Option<Boot> {
    let hal: &'static TestHal = Box::leak(Box::new(TestHal::new()));
    let frames = Arc::new(FramePool::new(frames));
    let fs = Arc::new(MemFs::new());
    let kernel = Kernel::new(hal, frames.clone(), fs.clone(), Arc::new(FileTable::new()));
    let k: &'static Kernel = Box::leak(Box::new(kernel));
    k.create_first_process().ok()?;
    Some(Boot { k, hal, frames, fs })
}

impl Boot {
    pub fn init(&self) -> &'static Proc {
        self.k.find_proc(1).unwrap()
    }

    pub fn proc(&self, pid: usize) -> &'static Proc {
        self.k.find_proc(pid).unwrap()
    }

    /// fork 一个子进程并返回它
    pub fn fork(&self, parent: &Proc) -> &'static Proc {
        let pid = self.k.fork(parent).unwrap();
        self.proc(pid)
    }

    /// 创建文件并在进程 `p` 中打开，返回文件描述符
    pub fn open(&self, p: &Proc, path: &str, data: &[u8], readable: bool, writable: bool) -> (usize, Arc<MemInode>) {
        let inode = self.fs.create(path, data);
        let file = self.k.files().alloc(inode.clone(), readable, writable).unwrap();
        let fd = self.k.fd_alloc(p, file).unwrap();
        (fd, inode)
    }

    /// 模拟调度器：`p` 让出 CPU 期间运行 `f`，之后 `p` 必须已被唤醒并重新运行
    pub fn while_switched_out(&self, p: &'static Proc, f: impl FnOnce() + Send + 'static) {
        self.hal.on_switch(move || {
            unsafe { p.inner.force_unlock() };
            f();
            let mut inner = p.inner.lock();
            assert_eq!(inner.state, ProcState::Runnable, "让出 CPU 的进程应已被唤醒");
            inner.state = ProcState::Running;
            core::mem::forget(inner);
        });
    }

    pub fn read(&self, p: &Proc, addr: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.k.copy_in(p, &mut buf, VirtAddr::from(addr)).unwrap();
        buf
    }

    pub fn write(&self, p: &Proc, addr: usize, data: &[u8]) {
        self.k.copy_out(p, VirtAddr::from(addr), data).unwrap();
    }
}
