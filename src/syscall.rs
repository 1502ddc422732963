//! 系统调用分发
//!
//! 调用号在 a7，参数在 a0..a5，返回值写回 a0；失败统一返回 -1。

use axerrno::{AxError, AxResult};
use lcore::{Kernel, Proc, Prot, Share, MAP_FAILED};
use lmm::{VirtAddr, PAGE_SIZE};

// 系统调用号定义
pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_SETTICKETS: usize = 22;
pub const SYS_GETPINFO: usize = 23;
pub const SYS_MMAP: usize = 24;
pub const SYS_MUNMAP: usize = 25;

/// 执行 trapframe 中的系统调用
pub fn syscall(k: &Kernel, p: &Proc) {
    let tf = unsafe { p.trapframe() };
    let args = [tf.a0, tf.a1, tf.a2, tf.a3, tf.a4, tf.a5];
    let num = tf.a7;

    let ret = match num {
        SYS_FORK => k.fork(p).map(|pid| pid as isize),
        SYS_EXIT => k.exit(p, args[0] as i32),
        SYS_WAIT => sys_wait(k, p, args[0]),
        SYS_KILL => sys_kill(k, args[0]),
        SYS_GETPID => Ok(p.pid() as isize),
        SYS_SBRK => sys_sbrk(k, p, args[0]),
        SYS_SLEEP => sys_sleep(k, p, args[0]),
        SYS_UPTIME => Ok(k.uptime() as isize),
        SYS_SETTICKETS => k.set_tickets(p, args[0] as i32 as isize).map(|_| 0),
        SYS_GETPINFO => k
            .get_process_snapshot(p, VirtAddr::from(args[0]))
            .map(|_| 0),
        SYS_MMAP => Ok(sys_mmap(k, p, &args)),
        SYS_MUNMAP => sys_munmap(k, p, args[0], args[1]),
        _ => {
            log::warn!("pid {}: unknown syscall {}", p.pid(), num);
            Err(AxError::Unsupported)
        }
    };

    let tf = unsafe { p.trapframe() };
    tf.a0 = match ret {
        Ok(value) => value as usize,
        Err(err) => {
            log::warn!("pid {}: syscall {} failed: {:?}", p.pid(), num, err);
            usize::MAX
        }
    };
}

fn sys_wait(k: &Kernel, p: &Proc, addr: usize) -> AxResult<isize> {
    let status_addr = (addr != 0).then(|| VirtAddr::from(addr));
    k.wait(p, status_addr).map(|pid| pid as isize)
}

fn sys_kill(k: &Kernel, pid: usize) -> AxResult<isize> {
    let pid = pid as i32;
    if pid <= 0 {
        return Err(AxError::InvalidInput);
    }
    k.kill(pid as usize).map(|_| 0)
}

/// 返回增长前的线性区大小
fn sys_sbrk(k: &Kernel, p: &Proc, n: usize) -> AxResult<isize> {
    let old = unsafe { p.data() }.sz;
    k.grow_address_space(p, n as i32 as isize)?;
    Ok(old as isize)
}

fn sys_sleep(k: &Kernel, p: &Proc, n: usize) -> AxResult<isize> {
    let n = (n as i32).max(0) as u64;
    k.sleep_ticks(p, n).map(|_| 0)
}

/// mmap(addr, length, prot, flags, fd, offset)，`addr` 被忽略，失败返回 `MAP_FAILED`
fn sys_mmap(k: &Kernel, p: &Proc, args: &[usize; 6]) -> isize {
    let mapped = check_mmap(args).and_then(|(length, prot, share, fd, offset)| {
        k.map_region(p, length, prot, share, fd, offset)
    });
    match mapped {
        Ok(addr) => addr.as_usize() as isize,
        Err(err) => {
            log::warn!("pid {}: mmap failed: {:?}", p.pid(), err);
            MAP_FAILED as isize
        }
    }
}

fn check_mmap(args: &[usize; 6]) -> AxResult<(usize, Prot, Share, usize, usize)> {
    let length = args[1] as i32;
    let prot = Prot::from_bits(args[2])?;
    let share = Share::from_bits(args[3])?;
    let fd = args[4] as i32;
    let offset = args[5] as i32;
    if length < 0 || fd < 0 || offset < 0 {
        return Err(AxError::InvalidInput);
    }
    Ok((length as usize, prot, share, fd as usize, offset as usize))
}

fn sys_munmap(k: &Kernel, p: &Proc, addr: usize, size: usize) -> AxResult<isize> {
    let size = size as i32;
    if addr == 0 || addr % PAGE_SIZE != 0 || size < 0 || size as usize % PAGE_SIZE != 0 {
        return Err(AxError::InvalidInput);
    }
    k.unmap_region(p, VirtAddr::from(addr), size as usize).map(|_| 0)
}
