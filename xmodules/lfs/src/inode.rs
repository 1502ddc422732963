//! inode 与事务接口

use alloc::sync::Arc;
use axerrno::AxResult;
use core::ops::Deref;

/// 文件系统中的一个 inode
///
/// `read_at`/`write_at` 要求调用者已经持有 inode 锁，写入还要求处于事务中。
pub trait Inode: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
    /// 从 `offset` 读取，返回实际读到的字节数，越过文件末尾返回 0
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> AxResult<usize>;
    fn write_at(&self, offset: usize, buf: &[u8]) -> AxResult<usize>;
    fn size(&self) -> usize;
}

pub type InodeRef = Arc<dyn Inode>;

/// inode 锁守卫
pub struct InodeLock<'a>(&'a dyn Inode);

impl<'a> InodeLock<'a> {
    pub fn new(inode: &'a dyn Inode) -> Self {
        inode.lock();
        Self(inode)
    }
}

impl<'a> Deref for InodeLock<'a> {
    type Target = dyn Inode + 'a;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl Drop for InodeLock<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// 文件系统
pub trait FileSystem: Send + Sync {
    /// 按路径查找 inode
    fn namei(&self, path: &str) -> Option<InodeRef>;
    fn begin_op(&self);
    fn end_op(&self);
    /// 第一个用户进程开始运行前调用一次
    fn start(&self) {}
}

/// 事务守卫，离开作用域时结束事务
pub struct Op<'a>(&'a dyn FileSystem);

impl<'a> Op<'a> {
    pub fn begin(fs: &'a dyn FileSystem) -> Self {
        fs.begin_op();
        Self(fs)
    }
}

impl Drop for Op<'_> {
    fn drop(&mut self) {
        self.0.end_op();
    }
}
