//! 彩票调度的统计性质

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};

use common::{boot, Boot};
use lcore::param::MAX_TICKETS;
use lcore::{Proc, ProcState};

/// init 睡眠，给每个子进程分配 `tickets` 中对应的票数
fn setup(b: &Boot, tickets: &[isize]) -> Vec<&'static Proc> {
    let init = b.init();
    let children: Vec<_> = tickets
        .iter()
        .map(|&n| {
            let child = b.fork(init);
            b.k.set_tickets(child, n).unwrap();
            child
        })
        .collect();
    init.inner.lock().state = ProcState::Sleeping;
    children
}

/// 抽 `rounds` 次签，中签的进程立刻让出 CPU
fn run(b: &Boot, rounds: usize) -> Vec<usize> {
    (0..rounds)
        .map(|_| {
            let (p, mut inner) = b.k.draw().expect("总有可运行的进程");
            assert_eq!(inner.state, ProcState::Running);
            inner.state = ProcState::Runnable;
            p.slot()
        })
        .collect()
}

fn counts(picks: &[usize], slots: &[&Proc]) -> Vec<usize> {
    slots
        .iter()
        .map(|p| picks.iter().filter(|&&slot| slot == p.slot()).count())
        .collect()
}

#[test]
fn test_share_follows_tickets() {
    let b = boot();
    let procs = setup(&b, &[1, 99]);
    let picks = run(&b, 10_000);
    let c = counts(&picks, &procs);
    assert_eq!(c.iter().sum::<usize>(), 10_000, "init 在睡眠，不会中签");
    assert!((50..=200).contains(&c[0]), "1 张票中签 {} 次", c[0]);
}

#[test]
fn test_three_way_split() {
    let b = boot();
    let procs = setup(&b, &[10, 20, 30]);
    let picks = run(&b, 6_000);
    for (count, expect) in counts(&picks, &procs).into_iter().zip([1000, 2000, 3000]) {
        assert!(
            count.abs_diff(expect) <= expect / 10,
            "期望约 {} 次，实际 {} 次",
            expect,
            count
        );
    }
}

#[test]
fn test_draws_are_deterministic() {
    let run_once = || {
        let b = boot();
        setup(&b, &[3, 5]);
        run(&b, 1_000)
    };
    assert_eq!(run_once(), run_once(), "相同的票数与运行次数得到相同的抽签序列");
}

#[test]
fn test_ticks_counted_per_win() {
    let b = boot();
    let procs = setup(&b, &[2, 2]);
    let picks = run(&b, 100);
    let st = b.k.snapshot();
    for (p, count) in procs.iter().zip(counts(&picks, &procs)) {
        assert_eq!(st.ticks[p.slot()] as usize, count);
        assert_eq!(st.tickets[p.slot()], 2);
    }
    assert_eq!(st.ticks[b.init().slot()], 0);
}

#[test]
fn test_nothing_runnable() {
    let b = boot();
    let init = b.init();
    init.inner.lock().state = ProcState::Sleeping;
    assert!(b.k.draw().is_none());

    init.inner.lock().state = ProcState::Runnable;
    let (p, inner) = b.k.draw().unwrap();
    assert_eq!(p.slot(), init.slot(), "唯一的可运行进程必然中签");
    assert_eq!(inner.ticks, 1);
}

#[test]
fn test_large_ticket_counts_split_evenly() {
    let b = boot();
    let procs = setup(&b, &[20_000, 20_000]);
    let c = counts(&run(&b, 10_000), &procs);
    for count in c {
        assert!(count.abs_diff(5000) <= 500, "两个进程票数相同，实际 {} 次", count);
    }
}

#[test]
fn test_maximum_tickets_do_not_overflow_draw() {
    let b = boot();
    let procs = setup(&b, &[i32::MAX as isize, i32::MAX as isize, 1]);
    assert_eq!(procs[0].inner.lock().tickets, MAX_TICKETS);
    b.init().inner.lock().state = ProcState::Runnable;

    let picks = run(&b, 3_000);
    let c = counts(&picks, &procs);
    assert!(c[0].abs_diff(1500) <= 150, "实际 {} 次", c[0]);
    assert!(c[1].abs_diff(1500) <= 150, "实际 {} 次", c[1]);
}

#[test]
fn test_idle_scheduler_waits_for_interrupt() {
    let b = boot();
    b.init().inner.lock().state = ProcState::Sleeping;
    let k = b.k;
    let idle = catch_unwind(AssertUnwindSafe(|| k.scheduler()));
    let msg = idle.err().and_then(|e| e.downcast_ref::<&str>().copied());
    assert_eq!(msg, Some("调度器空闲"), "没有可运行进程时应等待中断");
}
