//! 内核参数

/// 进程表大小
pub const NPROC: usize = 64;
/// 最大 CPU 数
pub const NCPU: usize = 8;
/// 每个进程的打开文件数
pub const NOFILE: usize = 16;
/// 全局映射区槽位数
pub const NVMAS: usize = 128;
/// 每个进程同时存在的映射区数
pub const PER_PROCESS_VMAS: usize = 16;
/// 单个进程的彩票数上限，保证总票数不超过 30 位随机数的范围
pub const MAX_TICKETS: usize = (1 << 30) / NPROC;
