//! 全局打开文件表

use axerrno::{AxError, AxResult};
use spin::Mutex;

use crate::{FileSystem, InodeRef, Op, NFILE};

/// 打开文件表中的槽位编号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(usize);

impl FileId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Default)]
struct OpenFile {
    refs: usize,
    readable: bool,
    writable: bool,
    inode: Option<InodeRef>,
}

/// 打开文件表，每个槽位带显式引用计数
///
/// 文件描述符和映射区都持有引用，最后一次 `close` 在事务中释放 inode。
pub struct FileTable {
    slots: [Mutex<OpenFile>; NFILE],
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Mutex::new(OpenFile::default())),
        }
    }

    pub fn alloc(&self, inode: InodeRef, readable: bool, writable: bool) -> AxResult<FileId> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut file = slot.lock();
            if file.refs == 0 {
                *file = OpenFile {
                    refs: 1,
                    readable,
                    writable,
                    inode: Some(inode),
                };
                return Ok(FileId(i));
            }
        }
        log::warn!("file table full");
        Err(AxError::NoMemory)
    }

    pub fn dup(&self, id: FileId) -> FileId {
        let mut file = self.slots[id.0].lock();
        assert!(file.refs >= 1, "filedup: slot {} not open", id.0);
        file.refs += 1;
        id
    }

    pub fn close(&self, id: FileId, fs: &dyn FileSystem) {
        let inode = {
            let mut file = self.slots[id.0].lock();
            assert!(file.refs >= 1, "fileclose: slot {} not open", id.0);
            file.refs -= 1;
            if file.refs > 0 {
                return;
            }
            file.readable = false;
            file.writable = false;
            file.inode.take()
        };
        if let Some(inode) = inode {
            let _op = Op::begin(fs);
            drop(inode);
        }
    }

    pub fn refs(&self, id: FileId) -> usize {
        self.slots[id.0].lock().refs
    }

    pub fn readable(&self, id: FileId) -> bool {
        self.slots[id.0].lock().readable
    }

    pub fn writable(&self, id: FileId) -> bool {
        self.slots[id.0].lock().writable
    }

    pub fn inode(&self, id: FileId) -> Option<InodeRef> {
        self.slots[id.0].lock().inode.clone()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
