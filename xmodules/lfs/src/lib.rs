//! lotos 文件层协作接口
//!
//! 进程与内存管理只通过这里的 trait 使用文件系统：inode 读写、
//! 事务括号以及全局打开文件表。`MemFs` 是一个内存实现。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod file;
mod inode;
mod memfs;


pub use file::{FileId, FileTable};
pub use inode::{FileSystem, Inode, InodeLock, InodeRef, Op};
pub use memfs::{MemFs, MemInode};

/// 磁盘块大小
pub const BSIZE: usize = 1024;
/// 一次事务最多写入的块数
pub const MAXOPBLOCKS: usize = 10;
/// 系统打开文件数上限
pub const NFILE: usize = 100;

/// 单个事务内允许写入的最大字节数，需为 inode、间接块、位图等留出余量
pub const MAX_WRITE_CHUNK: usize = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
