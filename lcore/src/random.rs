//! 调度器使用的确定性伪随机数
//!
//! 线性同余生成器迭代 10 轮，相同种子总是得到相同结果。

const ROUNDS: usize = 10;

/// 15 位的伪随机数，只取决于种子的低 15 位
pub fn random(seed: u32) -> u32 {
    let mut x = seed;
    for _ in 0..ROUNDS {
        x = x.wrapping_mul(1103515245).wrapping_add(12345) % 32768;
    }
    x
}

/// 两次生成各取 15 位拼成 30 位，第二次混入种子的第 15 至 46 位
pub fn random_wide(seed: u64) -> u64 {
    let hi = random(seed as u32);
    let lo = random(hi ^ (seed >> 15) as u32);
    ((hi as u64) << 15) | lo as u64
}

/// `[lo, hi]` 内的伪随机数
pub fn random_range(seed: u64, lo: u64, hi: u64) -> u64 {
    assert!(lo <= hi, "random_range: empty range {}..={}", lo, hi);
    random_wide(seed) % (hi - lo + 1) + lo
}
