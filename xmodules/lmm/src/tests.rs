use axerrno::AxError;
use memory_addr::VirtAddr;

use crate::*;

fn va(addr: usize) -> VirtAddr {
    VirtAddr::from(addr)
}

#[test]
fn test_pool_refcount() {
    let pool = FramePool::new(4);
    let pa = pool.alloc().unwrap();
    assert_eq!(pool.refcount(pa), 1);
    assert!(unsafe { phys_page(pa) }.iter().all(|&b| b == 0), "新页未清零");

    pool.incref(pa);
    pool.incref(pa);
    assert_eq!(pool.refcount(pa), 3);
    pool.decref(pa);
    pool.free(pa);
    assert_eq!(pool.in_use(), 1, "还有引用时不应回收");
    pool.free(pa);
    assert_eq!(pool.in_use(), 0, "最后一个引用释放后应回收");
}

#[test]
fn test_pool_exhaustion() {
    let pool = FramePool::new(2);
    let a = Frame::alloc(&pool).unwrap();
    let _b = Frame::alloc(&pool).unwrap();
    assert_eq!(Frame::alloc(&pool).err(), Some(AxError::NoMemory));
    drop(a);
    assert!(Frame::alloc(&pool).is_ok(), "释放后应能再次分配");
}

#[test]
#[should_panic]
fn test_decref_last_reference() {
    let pool = FramePool::new(1);
    let pa = pool.alloc().unwrap();
    pool.decref(pa);
}

#[test]
fn test_map_and_translate() {
    let pool = FramePool::new(16);
    let mut pt = PageTable::new(&pool).unwrap();
    let frame = Frame::alloc(&pool).unwrap().into_pa();
    pt.map(&pool, va(0x3000), frame, PAGE_SIZE, PteFlags::R | PteFlags::U).unwrap();

    assert_eq!(pt.translate(va(0x3000)), Some(frame));
    assert_eq!(pt.translate(va(0x4000)), None);
    assert!(pt.translate(va(0x3abc)).is_some());

    let again = pt.map(&pool, va(0x3000), frame, PAGE_SIZE, PteFlags::R | PteFlags::U);
    assert_eq!(again, Err(AxError::AlreadyExists), "重复映射应失败");

    pt.unmap(&pool, va(0x3000), 1, true);
    pt.destroy(&pool, 0);
    assert_eq!(pool.in_use(), 0, "页表页未全部回收");
}

#[test]
fn test_unmap_skips_holes() {
    let pool = FramePool::new(16);
    let mut pt = PageTable::new(&pool).unwrap();
    pt.map_page_for_test(&pool, 0x1000);
    // 0x0 与 0x2000 没有映射
    pt.unmap(&pool, va(0), 3, true);
    assert!(pt.translate(va(0x1000)).is_none());
    pt.destroy(&pool, 0);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn test_grow_and_shrink() {
    let pool = FramePool::new(32);
    let mut pt = PageTable::new(&pool).unwrap();
    let base = pool.in_use();

    let sz = pt.grow(&pool, 0, 3 * PAGE_SIZE + 1, PteFlags::W).unwrap();
    assert_eq!(sz, 3 * PAGE_SIZE + 1);
    assert_eq!(pool.in_use() - base, 4 + 2, "应分配 4 个数据页和 2 个中间页表");
    let pte = pt.lookup(va(0)).unwrap();
    assert!(pte.flags().contains(PteFlags::R | PteFlags::W | PteFlags::U));

    let sz = pt.shrink(&pool, sz, PAGE_SIZE);
    assert_eq!(sz, PAGE_SIZE);
    assert!(pt.translate(va(0)).is_some());
    assert!(pt.translate(va(PAGE_SIZE)).is_none());

    pt.destroy(&pool, sz);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn test_grow_rolls_back_on_exhaustion() {
    let pool = FramePool::new(6);
    let mut pt = PageTable::new(&pool).unwrap();
    let err = pt.grow(&pool, 0, 8 * PAGE_SIZE, PteFlags::W);
    assert_eq!(err, Err(AxError::NoMemory));
    assert!(pt.translate(va(0)).is_none(), "失败后应回退已分配的页");
    pt.destroy(&pool, 0);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn test_copy_into_resident_only() {
    let pool = FramePool::new(32);
    let mut parent = PageTable::new(&pool).unwrap();
    let mut child = PageTable::new(&pool).unwrap();
    parent.map_page_for_test(&pool, 0);
    parent.map_page_for_test(&pool, 2 * PAGE_SIZE);
    parent.copy_out(va(10), b"hello").unwrap();

    parent.copy_into(&mut child, &pool, 3 * PAGE_SIZE).unwrap();
    assert!(child.translate(va(0)).is_some());
    assert!(child.translate(va(PAGE_SIZE)).is_none(), "不在内存的页不应复制");
    assert!(child.translate(va(2 * PAGE_SIZE)).is_some());
    assert_ne!(child.translate(va(0)), parent.translate(va(0)), "应复制而非共享");

    let mut buf = [0u8; 5];
    child.copy_in(&mut buf, va(10)).unwrap();
    assert_eq!(&buf, b"hello");

    child.destroy(&pool, 3 * PAGE_SIZE);
    parent.destroy(&pool, 3 * PAGE_SIZE);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn test_copy_across_pages() {
    let pool = FramePool::new(16);
    let mut pt = PageTable::new(&pool).unwrap();
    pt.grow(&pool, 0, 2 * PAGE_SIZE, PteFlags::W).unwrap();

    let data: Vec<u8> = (0..100u8).collect();
    pt.copy_out(va(PAGE_SIZE - 50), &data).unwrap();
    let mut back = vec![0u8; 100];
    pt.copy_in(&mut back, va(PAGE_SIZE - 50)).unwrap();
    assert_eq!(back, data);

    assert_eq!(pt.copy_out(va(2 * PAGE_SIZE - 1), b"xy"), Err(AxError::BadAddress));
    assert_eq!(pt.copy_in(&mut back, va(MAXVA)), Err(AxError::BadAddress));
    pt.destroy(&pool, 2 * PAGE_SIZE);
}

#[test]
fn test_copy_out_requires_write() {
    let pool = FramePool::new(16);
    let mut pt = PageTable::new(&pool).unwrap();
    let frame = Frame::alloc(&pool).unwrap().into_pa();
    pt.map(&pool, va(0), frame, PAGE_SIZE, PteFlags::R | PteFlags::U).unwrap();
    assert_eq!(pt.copy_out(va(0), b"x"), Err(AxError::BadAddress), "只读页不可写入");
    pt.destroy(&pool, PAGE_SIZE);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn test_pte_encoding() {
    let pa = PhysAddr::from(0x8020_3000);
    let mut pte = Pte::new(pa, PteFlags::V | PteFlags::R | PteFlags::U);
    assert_eq!(pte.pa(), pa);
    assert!(pte.is_leaf());
    pte.set_flags(pte.flags() | PteFlags::W);
    assert_eq!(pte.pa(), pa, "修改标志位不应改变物理地址");
    assert!(pte.flags().contains(PteFlags::W));
    assert!(!Pte::new(pa, PteFlags::V).is_leaf());
}

#[test]
fn test_layout() {
    assert_eq!(MAXVA, 1 << 38);
    assert_eq!(TRAPFRAME + PAGE_SIZE, TRAMPOLINE);
    assert_eq!(pages_of(0), 0);
    assert_eq!(pages_of(1), 1);
    assert_eq!(pages_of(PAGE_SIZE + 1), 2);
}

impl PageTable {
    fn map_page_for_test(&mut self, pool: &FramePool, addr: usize) {
        let frame = Frame::alloc(pool).unwrap().into_pa();
        self.map(pool, va(addr), frame, PAGE_SIZE, PteFlags::R | PteFlags::W | PteFlags::U)
            .unwrap();
    }
}
