//! 序列号守卫
//!
//! "发起操作，然后让超时与真实回调赛跑" 模式的过期检查：
//! 每次发起操作递增序列号并标记为进行中；回调或超时只有在
//! 序列号仍为最新且操作仍在进行中时才会被处理。

/// 单个操作类别（读、写、连接）的序列号守卫
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceGuard {
    sequence: u64,
    in_flight: bool,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发起新操作，返回新的序列号
    pub fn begin(&mut self) -> u64 {
        self.sequence += 1;
        self.in_flight = true;
        self.sequence
    }

    /// 序列号为最新且操作仍在进行中
    pub fn is_current(&self, sequence: u64) -> bool {
        self.in_flight && sequence == self.sequence
    }

    /// 清除进行中标记（幂等）
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_is_monotonic() {
        let mut guard = SequenceGuard::new();
        let first = guard.begin();
        let second = guard.begin();
        assert!(second > first);
        assert!(!guard.is_current(first));
        assert!(guard.is_current(second));
    }

    #[test]
    fn test_finish_invalidates_current() {
        let mut guard = SequenceGuard::new();
        let seq = guard.begin();
        guard.finish();
        assert!(!guard.is_current(seq));
        // 幂等
        guard.finish();
        assert!(!guard.in_flight());
        assert_eq!(guard.sequence(), seq);
    }

    #[test]
    fn test_never_begun() {
        let guard = SequenceGuard::new();
        assert!(!guard.is_current(0));
    }
}
