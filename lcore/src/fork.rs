//! 进程生命周期：fork、exit、wait、kill

use axerrno::{AxError, AxResult};
use lfs::Op;
use lmm::VirtAddr;

use crate::manager::Kernel;
use crate::param::NPROC;
use crate::process::{Channel, Proc, ProcGuard, ProcState};

impl Kernel {
    /// 复制进程 `p`，返回子进程 pid；子进程从 fork 返回 0
    ///
    /// 线性区中已在内存的页逐页复制，映射区的页与父进程共享。
    pub fn fork(&self, p: &Proc) -> AxResult<usize> {
        let tickets = p.inner.lock().tickets;
        let (np, mut child) = self.alloc_proc()?;
        if let Err(err) = self.copy_address_space(p, np) {
            log::warn!("fork: pid {} copy failed: {:?}", child.pid, err);
            self.free_proc(np, &mut child);
            return Err(err);
        }

        let pdata = unsafe { p.data() };
        let cdata = unsafe { np.data_mut() };
        unsafe {
            *np.trapframe() = *p.trapframe();
            np.trapframe().a0 = 0;
        }
        for (fd, file) in pdata.ofile.iter().enumerate() {
            cdata.ofile[fd] = file.map(|file| self.files.dup(file));
        }
        cdata.cwd = pdata.cwd.clone();
        cdata.name = pdata.name.clone();
        cdata.text = pdata.text.clone();
        cdata.data = pdata.data.clone();
        child.tickets = tickets;
        let pid = child.pid;
        drop(child);

        self.parents.lock()[np.slot()] = Some(p.slot());
        np.inner.lock().state = ProcState::Runnable;
        log::debug!("fork: pid {} -> pid {}", p.pid(), pid);
        Ok(pid)
    }

    fn copy_address_space(&self, p: &Proc, np: &Proc) -> AxResult {
        let pdata = unsafe { p.data() };
        {
            let cdata = unsafe { np.data_mut() };
            pdata
                .page_table()?
                .copy_into(cdata.page_table_mut()?, self.frames.as_ref(), pdata.sz)?;
            cdata.sz = pdata.sz;
        }
        self.fork_vmas(p, np)
    }

    /// 退出的前半部分：释放资源、托孤、唤醒父进程，然后成为僵尸
    ///
    /// 返回时仍持有 `p` 的锁，调用者随后切回调度循环。
    pub fn retire<'a>(&self, p: &'a Proc, status: i32) -> ProcGuard<'a> {
        if Some(p.slot()) == self.init_slot() {
            panic!("init exiting");
        }
        for fd in unsafe { p.data_mut() }.ofile.iter_mut() {
            if let Some(file) = fd.take() {
                self.files.close(file, self.fs.as_ref());
            }
        }
        self.unmap_all(p);
        {
            let data = unsafe { p.data_mut() };
            let _op = Op::begin(self.fs.as_ref());
            data.cwd = None;
            data.text.inode = None;
            data.data.inode = None;
        }

        let mut parents = self.parents.lock();
        self.reparent(p, &mut parents);
        if let Some(parent) = parents[p.slot()] {
            self.wakeup(Channel::Proc(parent));
        }
        let mut inner = p.inner.lock();
        inner.xstate = status;
        inner.state = ProcState::Zombie;
        drop(parents);
        log::debug!("exit: pid {} status {}", inner.pid, status);
        inner
    }

    /// 结束进程 `p`，不返回；进程在父进程 `wait` 之前保持僵尸状态
    pub fn exit(&self, p: &Proc, status: i32) -> ! {
        let inner = self.retire(p, status);
        let _inner = self.sched(p, inner);
        panic!("zombie exit");
    }

    /// 把 `p` 的子进程交给 init
    fn reparent(&self, p: &Proc, parents: &mut [Option<usize>; NPROC]) {
        let init = self.init_slot();
        for parent in parents.iter_mut() {
            if *parent == Some(p.slot()) {
                *parent = init;
                if let Some(init) = init {
                    self.wakeup(Channel::Proc(init));
                }
            }
        }
    }

    /// 等待一个子进程退出，返回其 pid，`status_addr` 非空时写回退出码
    ///
    /// 没有子进程或者调用者已被杀死时立即失败。
    pub fn wait(&self, p: &Proc, status_addr: Option<VirtAddr>) -> AxResult<usize> {
        let mut parents = self.parents.lock();
        loop {
            let mut have_kids = false;
            for slot in 0..NPROC {
                if parents[slot] != Some(p.slot()) {
                    continue;
                }
                have_kids = true;
                let child = &self.procs[slot];
                let mut inner = child.inner.lock();
                if inner.state != ProcState::Zombie {
                    continue;
                }
                let pid = inner.pid;
                if let Some(addr) = status_addr {
                    self.copy_out(p, addr, &inner.xstate.to_ne_bytes())?;
                }
                self.free_proc(child, &mut inner);
                parents[slot] = None;
                log::debug!("wait: reaped pid {}", pid);
                return Ok(pid);
            }
            if !have_kids {
                return Err(AxError::NotFound);
            }
            if p.killed() {
                return Err(AxError::BadState);
            }
            parents = self.sleep(p, Channel::Proc(p.slot()), &self.parents, parents);
        }
    }

    /// 标记 pid 为被杀死；睡眠中的进程被置为可运行，以便尽快检查标记
    pub fn kill(&self, pid: usize) -> AxResult {
        for p in &self.procs {
            let mut inner = p.inner.lock();
            if inner.state != ProcState::Unused && inner.pid == pid {
                inner.killed = true;
                if inner.state == ProcState::Sleeping {
                    inner.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(AxError::NotFound)
    }
}
