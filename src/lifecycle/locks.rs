use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;
use crate::error::{FsError, Result};

/// 字节范围锁
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLock {
    pub owner: u64,
    pub offset: u64,
    pub length: u64,
}

impl RangeLock {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    fn overlaps(&self, offset: u64, length: u64) -> bool {
        if self.length == 0 || length == 0 {
            return false;
        }
        self.offset < offset.saturating_add(length) && offset < self.end()
    }
}

/// 进程内字节范围锁表，按物理路径分组
#[derive(Debug, Default)]
pub struct RangeLockTable {
    locks: RwLock<HashMap<PathBuf, Vec<RangeLock>>>,
}

impl RangeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 与任何已有锁重叠（包括同一持有者）都视为冲突
    pub fn lock(&self, path: &Path, owner: u64, offset: u64, length: u64) -> Result<()> {
        let mut locks = self.locks.write().unwrap_or_else(|e| e.into_inner());
        let held = locks.entry(path.to_path_buf()).or_default();

        if let Some(conflict) = held.iter().find(|l| l.overlaps(offset, length)) {
            debug!(
                "lock: {:?} [{}, +{}) conflicts with owner={} [{}, +{})",
                path, offset, length, conflict.owner, conflict.offset, conflict.length
            );
            return Err(FsError::access_denied(path.to_string_lossy()));
        }

        held.push(RangeLock { owner, offset, length });
        Ok(())
    }

    /// 只能解除完全一致的范围
    pub fn unlock(&self, path: &Path, owner: u64, offset: u64, length: u64) -> Result<()> {
        let mut locks = self.locks.write().unwrap_or_else(|e| e.into_inner());
        let held = match locks.get_mut(path) {
            Some(held) => held,
            None => return Err(FsError::access_denied(path.to_string_lossy())),
        };

        let wanted = RangeLock { owner, offset, length };
        match held.iter().position(|l| *l == wanted) {
            Some(index) => {
                held.remove(index);
                if held.is_empty() {
                    locks.remove(path);
                }
                Ok(())
            }
            None => Err(FsError::access_denied(path.to_string_lossy())),
        }
    }

    /// 释放某个句柄持有的全部锁
    pub fn release_owner(&self, owner: u64) -> usize {
        let mut locks = self.locks.write().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        locks.retain(|_, held| {
            let before = held.len();
            held.retain(|l| l.owner != owner);
            released += before - held.len();
            !held.is_empty()
        });
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_lock_is_denied() {
        let table = RangeLockTable::new();
        let path = Path::new("/v/a.txt");

        assert!(table.lock(path, 1, 0, 10).is_ok());
        assert!(table.lock(path, 2, 5, 10).is_err());
        assert!(table.lock(path, 2, 10, 10).is_ok());
        assert!(table.lock(Path::new("/v/b.txt"), 2, 0, 10).is_ok());
    }

    #[test]
    fn test_unlock_requires_exact_range() {
        let table = RangeLockTable::new();
        let path = Path::new("/v/a.txt");

        table.lock(path, 1, 0, 10).unwrap();
        assert!(table.unlock(path, 1, 0, 5).is_err());
        assert!(table.unlock(path, 2, 0, 10).is_err());
        assert!(table.unlock(path, 1, 0, 10).is_ok());
        assert!(table.lock(path, 2, 0, 10).is_ok());
    }

    #[test]
    fn test_release_owner() {
        let table = RangeLockTable::new();
        let path = Path::new("/v/a.txt");

        table.lock(path, 1, 0, 10).unwrap();
        table.lock(path, 1, 20, 10).unwrap();
        table.lock(path, 2, 40, 10).unwrap();
        assert!(table.lock(path, 2, 0, 5).is_err());

        assert_eq!(table.release_owner(1), 2);
        assert!(table.lock(path, 2, 0, 40).is_ok());
        assert_eq!(table.release_owner(1), 0);
    }
}
