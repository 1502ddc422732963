//! 内存文件系统，文件内容保存在 `Vec<u8>` 中

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use axerrno::{AxError, AxResult};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::{FileSystem, Inode, InodeRef};

pub struct MemInode {
    data: Mutex<Vec<u8>>,
    locked: AtomicBool,
}

impl MemInode {
    pub fn new(data: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data.to_vec()),
            locked: AtomicBool::new(false),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl Inode for MemInode {
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        let was = self.locked.swap(false, Ordering::Release);
        assert!(was, "unlock: inode not locked");
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> AxResult<usize> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> AxResult<usize> {
        let mut data = self.data.lock();
        if offset > data.len() {
            return Err(AxError::InvalidInput);
        }
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> usize {
        self.data.lock().len()
    }
}

/// 记录事务计数的内存文件系统
pub struct MemFs {
    files: Mutex<BTreeMap<String, Arc<MemInode>>>,
    outstanding: AtomicUsize,
    committed: AtomicUsize,
}

impl MemFs {
    pub fn new() -> Self {
        let fs = Self {
            files: Mutex::new(BTreeMap::new()),
            outstanding: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        };
        fs.create("/", &[]);
        fs
    }

    /// 创建或覆盖一个文件
    pub fn create(&self, path: &str, data: &[u8]) -> Arc<MemInode> {
        let inode = MemInode::new(data);
        self.files.lock().insert(path.to_string(), inode.clone());
        inode
    }

    pub fn get(&self, path: &str) -> Option<Arc<MemInode>> {
        self.files.lock().get(path).cloned()
    }

    /// 尚未结束的事务数
    pub fn outstanding_ops(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// 已结束的事务数
    pub fn committed_ops(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemFs {
    fn namei(&self, path: &str) -> Option<InodeRef> {
        self.get(path).map(|inode| inode as InodeRef)
    }

    fn begin_op(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn end_op(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "end_op without begin_op");
        self.committed.fetch_add(1, Ordering::AcqRel);
    }
}
