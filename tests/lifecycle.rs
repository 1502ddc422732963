//! 进程生命周期：fork、exit、wait、kill

mod common;

use axerrno::AxError;
use common::{boot, data, try_boot};
use lcore::ProcState;
use lmm::{VirtAddr, PAGE_SIZE};

#[test]
fn test_fork_wait_exit_status() {
    let b = boot();
    let init = b.init();
    let before = b.frames.in_use();

    let child = b.fork(init);
    let pid = child.pid();
    assert_eq!(child.inner.lock().state, ProcState::Runnable);
    assert_eq!(unsafe { child.trapframe() }.a0, 0, "子进程从 fork 返回 0");

    drop(b.k.retire(child, 7));
    assert_eq!(child.inner.lock().state, ProcState::Zombie);

    let status_addr = 0x800;
    assert_eq!(b.k.wait(init, Some(VirtAddr::from(status_addr))), Ok(pid));
    let status = b.read(init, status_addr, 4);
    assert_eq!(i32::from_ne_bytes(status.try_into().unwrap()), 7);

    assert_eq!(child.inner.lock().state, ProcState::Unused, "回收后槽位应空闲");
    assert_eq!(b.frames.in_use(), before, "子进程的页应全部回收");
    assert_eq!(b.k.wait(init, None), Err(AxError::NotFound), "同一个子进程不能被等待两次");
}

#[test]
fn test_wait_blocks_until_child_exits() {
    let b = boot();
    let init = b.init();
    let child = b.fork(init);
    let pid = child.pid();

    let k = b.k;
    b.while_switched_out(init, move || {
        drop(k.retire(child, 3));
    });
    assert_eq!(b.k.wait(init, None), Ok(pid));
    assert_eq!(b.hal.pending_hooks(), 0, "wait 应睡眠恰好一次");
}

#[test]
fn test_kill_interrupts_wait() {
    let b = boot();
    let init = b.init();
    let child = b.fork(init);

    let k = b.k;
    b.while_switched_out(init, move || {
        k.kill(1).unwrap();
    });
    assert_eq!(b.k.wait(init, None), Err(AxError::BadState));
    assert!(init.killed());
    assert_eq!(child.inner.lock().state, ProcState::Runnable, "子进程不受影响");
}

#[test]
fn test_wait_without_children() {
    let b = boot();
    assert_eq!(b.k.wait(b.init(), None), Err(AxError::NotFound));
}

#[test]
fn test_exit_reparents_to_init() {
    let b = boot();
    let init = b.init();
    let a = b.fork(init);
    let grandchild = b.fork(a);
    assert_eq!(b.k.parent_of(grandchild), Some(a.slot()));

    let a_pid = a.pid();
    drop(b.k.retire(a, 0));
    assert_eq!(b.k.parent_of(grandchild), Some(init.slot()), "孙进程应交给 init");

    assert_eq!(b.k.wait(init, None), Ok(a_pid));
    let g_pid = grandchild.pid();
    drop(b.k.retire(grandchild, 0));
    assert_eq!(b.k.wait(init, None), Ok(g_pid));
}

#[test]
#[should_panic(expected = "init exiting")]
fn test_init_cannot_exit() {
    let b = boot();
    drop(b.k.retire(b.init(), 0));
}

#[test]
fn test_fork_copies_memory_and_state() {
    let b = boot();
    let init = b.init();
    b.write(init, 0x100, b"hello");
    b.k.set_tickets(init, 5).unwrap();

    let child = b.fork(init);
    assert_eq!(b.read(child, 0x100, 5), b"hello");
    assert_eq!(data(child).sz, data(init).sz);
    assert_eq!(data(child).name, "initcode");
    assert_eq!(child.inner.lock().tickets, 5, "子进程继承彩票数");
    assert_eq!(child.inner.lock().ticks, 0);

    b.write(child, 0x100, b"world");
    assert_eq!(b.read(init, 0x100, 5), b"hello", "线性区应是独立的副本");
}

#[test]
fn test_fork_shares_open_files() {
    let b = boot();
    let init = b.init();
    let (fd, _inode) = b.open(init, "/f", b"data", true, true);
    let file = data(init).ofile[fd].unwrap();

    let child = b.fork(init);
    assert_eq!(data(child).ofile[fd], Some(file));
    assert_eq!(b.k.files().refs(file), 2);

    drop(b.k.retire(child, 0));
    assert_eq!(b.k.files().refs(file), 1, "子进程退出时关闭它的引用");
    b.k.wait(init, None).unwrap();
}

#[test]
fn test_fork_failure_leaves_no_trace() {
    for capacity in 6..24 {
        let Some(b) = try_boot(capacity) else {
            continue;
        };
        let init = b.init();
        let before = b.frames.in_use();
        match b.k.fork(init) {
            Ok(pid) => {
                let child = b.proc(pid);
                drop(b.k.retire(child, 0));
                assert_eq!(b.k.wait(init, None), Ok(pid));
            }
            Err(err) => {
                assert_eq!(err, AxError::NoMemory);
                let st = b.k.snapshot();
                assert_eq!(st.inuse.iter().sum::<i32>(), 1, "失败的 fork 不应留下进程");
            }
        }
        assert_eq!(b.frames.in_use(), before, "容量 {} 时页帧泄漏", capacity);
    }
}

#[test]
fn test_sleep_ticks() {
    let b = boot();
    let init = b.init();
    assert_eq!(b.k.uptime(), 0);

    let k = b.k;
    b.while_switched_out(init, move || k.clock_tick());
    b.while_switched_out(init, move || k.clock_tick());
    b.k.sleep_ticks(init, 2).unwrap();
    assert_eq!(b.k.uptime(), 2);
    assert_eq!(b.hal.pending_hooks(), 0);

    b.k.sleep_ticks(init, 0).unwrap();
}

#[test]
fn test_killed_sleeper_stops_sleeping() {
    let b = boot();
    let init = b.init();
    let k = b.k;
    b.while_switched_out(init, move || k.kill(1).unwrap());
    assert_eq!(b.k.sleep_ticks(init, 100), Err(AxError::BadState));
}

#[test]
fn test_yield_round_trip() {
    let b = boot();
    let init = b.init();
    b.hal.on_switch(move || {
        assert_eq!(init.inner.try_lock().map(|i| i.state), None, "切换期间锁由调度器持有");
    });
    b.k.yield_proc(init);
    assert_eq!(init.inner.lock().state, ProcState::Runnable);
}

#[test]
fn test_procdump_and_pinfo() {
    let b = boot();
    let init = b.init();
    let child = b.fork(init);
    b.k.set_tickets(child, 9).unwrap();
    b.k.procdump();

    let addr = 0x400;
    b.k.get_process_snapshot(init, VirtAddr::from(addr)).unwrap();
    let bytes = b.read(init, addr, 4 * 64 * 4);
    let field = |table: usize, slot: usize| {
        let off = (table * 64 + slot) * 4;
        i32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap())
    };
    assert_eq!(field(0, child.slot()), 1, "inuse");
    assert_eq!(field(1, child.slot()), 9, "tickets");
    assert_eq!(field(2, child.slot()), child.pid() as i32, "pid");
    assert_eq!(field(3, child.slot()), 0, "ticks");

    assert_eq!(
        b.k.get_process_snapshot(init, VirtAddr::from(16 * PAGE_SIZE)),
        Err(AxError::BadAddress)
    );
}
