use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use futures::future::try_join_all;
use tracing::{debug, info};
use walkdir::WalkDir;
use crate::config::PoolConfig;
use crate::error::{FsError, Result};
use crate::fs::DiskSpace;
use crate::merger::pattern::is_name_in_expression;

/// 卷池中的一个成员：一个物理根目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRoot {
    index: usize,
    root: PathBuf,
    /// 可选的容量上限（字节）
    capacity: Option<u64>,
}

/// 单个卷的空间快照，`fsid` 用于识别位于同一文件系统的卷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeSpace {
    pub space: DiskSpace,
    pub fsid: u64,
    pub capped: bool,
}

impl VolumeRoot {
    pub fn new(index: usize, root: PathBuf, capacity: Option<u64>) -> Self {
        Self { index, root, capacity }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    /// 把逻辑路径拼接到卷根下；逻辑路径中的根与 `..` 不会逃出卷根
    pub fn join(&self, logical: &Path) -> PathBuf {
        let mut full = self.root.clone();
        for component in logical.components() {
            if let Component::Normal(part) = component {
                full.push(part);
            }
        }
        full
    }

    /// 查询卷空间；设置了容量上限时按 `容量 - 已用` 截断
    pub async fn disk_space(&self, ignore_patterns: &[String]) -> Result<VolumeSpace> {
        let root = self.root.clone();
        let stat = tokio::task::spawn_blocking(move || rustix::fs::statvfs(root.as_path()))
            .await
            .map_err(|e| FsError::Storage(format!("statvfs task failed: {}", e)))?
            .map_err(|e| FsError::Io(e.into()))?;

        let frsize = stat.f_frsize.max(1);
        let mut space = DiskSpace {
            free_available: stat.f_bavail.saturating_mul(frsize),
            total: stat.f_blocks.saturating_mul(frsize),
            total_free: stat.f_bfree.saturating_mul(frsize),
        };

        if let Some(capacity) = self.capacity {
            let used = self.used_bytes(ignore_patterns).await?;
            let remaining = capacity.saturating_sub(used);
            space.free_available = space.free_available.min(remaining);
            space.total_free = space.total_free.min(remaining);
            space.total = space.total.min(capacity);
        }

        debug!("disk_space: volume={} root={:?} -> {:?}", self.index, self.root, space);
        Ok(VolumeSpace {
            space,
            fsid: stat.f_fsid,
            capped: self.capacity.is_some(),
        })
    }

    /// 统计卷根下所有普通文件的字节数；被忽略的名字（锁文件等）及其子树不计入
    pub async fn used_bytes(&self, ignore_patterns: &[String]) -> Result<u64> {
        let root = self.root.clone();
        let patterns = ignore_patterns.to_vec();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut total = 0u64;
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_ignored_name(&patterns, &e.file_name().to_string_lossy()));
            for entry in walker {
                let entry = entry.map_err(|e| FsError::Storage(format!("walk {:?} failed: {}", root, e)))?;
                if entry.file_type().is_file() {
                    total += entry
                        .metadata()
                        .map_err(|e| FsError::Storage(format!("metadata {:?} failed: {}", entry.path(), e)))?
                        .len();
                }
            }
            Ok(total)
        })
        .await
        .map_err(|e| FsError::Storage(format!("used_bytes task failed: {}", e)))?
    }
}

fn is_ignored_name(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|pattern| is_name_in_expression(pattern, name, false))
}

/// 有序卷池：成员在启动时确定，运行期间不变
#[derive(Debug, Clone)]
pub struct VolumePool {
    volumes: Vec<VolumeRoot>,
    ignore_patterns: Vec<String>,
}

impl VolumePool {
    /// `volumes` 的顺序即池顺序
    pub fn new(volumes: Vec<(PathBuf, Option<u64>)>, ignore_patterns: Vec<String>) -> Result<Self> {
        if volumes.is_empty() {
            return Err(FsError::Config("卷池至少需要一个卷".to_string()));
        }

        let mut seen = HashSet::new();
        let mut roots = Vec::with_capacity(volumes.len());
        for (index, (root, capacity)) in volumes.into_iter().enumerate() {
            if !root.is_dir() {
                return Err(FsError::Config(format!("卷根目录不存在或不是目录: {:?}", root)));
            }
            let canonical = root.canonicalize()?;
            if !seen.insert(canonical) {
                return Err(FsError::Config(format!("卷根目录重复: {:?}", root)));
            }
            info!("卷 #{}: {:?}, 容量上限={:?}", index, root, capacity);
            roots.push(VolumeRoot::new(index, root, capacity));
        }

        Ok(Self {
            volumes: roots,
            ignore_patterns,
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(
            config
                .volumes
                .iter()
                .map(|v| (v.path.clone(), v.capacity))
                .collect(),
            config.effective_ignore_patterns(),
        )
    }

    pub fn volumes(&self) -> &[VolumeRoot] {
        &self.volumes
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&VolumeRoot> {
        self.volumes.get(index)
    }

    pub fn primary(&self) -> &VolumeRoot {
        &self.volumes[0]
    }

    /// 是否为需要对外隐藏的名字（元数据文件、锁文件等）
    pub fn is_ignored(&self, name: &str) -> bool {
        is_ignored_name(&self.ignore_patterns, name)
    }

    /// 单个卷的空间，容量上限按池的忽略规则统计已用字节
    pub async fn volume_space(&self, volume: &VolumeRoot) -> Result<VolumeSpace> {
        volume.disk_space(&self.ignore_patterns).await
    }

    /// 按池顺序为每个卷取一次可用空间快照
    pub async fn free_space_snapshot(&self) -> Result<Vec<u64>> {
        let spaces = try_join_all(self.volumes.iter().map(|v| self.volume_space(v))).await?;
        Ok(spaces.into_iter().map(|s| s.space.free_available).collect())
    }

    /// 汇总所有卷的空间；位于同一文件系统且未设上限的卷只计一次
    pub async fn get_space(&self) -> Result<DiskSpace> {
        let spaces = try_join_all(self.volumes.iter().map(|v| self.volume_space(v))).await?;
        let mut seen = HashSet::new();
        let mut total = DiskSpace::default();
        for volume_space in spaces {
            if !volume_space.capped && !seen.insert(volume_space.fsid) {
                continue;
            }
            total += volume_space.space;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_pool(dirs: &[&TempDir], capacities: &[Option<u64>]) -> VolumePool {
        VolumePool::new(
            dirs.iter()
                .zip(capacities)
                .map(|(d, c)| (d.path().to_path_buf(), *c))
                .collect(),
            vec!["._*".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_pool_rejects_missing_and_duplicate_roots() {
        let a = TempDir::new().unwrap();
        assert!(VolumePool::new(vec![], vec![]).is_err());
        assert!(VolumePool::new(vec![(a.path().join("missing"), None)], vec![]).is_err());
        assert!(VolumePool::new(
            vec![(a.path().to_path_buf(), None), (a.path().to_path_buf(), None)],
            vec![]
        )
        .is_err());
    }

    #[test]
    fn test_join_stays_inside_root() {
        let volume = VolumeRoot::new(0, PathBuf::from("/vol/a"), None);
        assert_eq!(volume.join(Path::new("/foo.txt")), PathBuf::from("/vol/a/foo.txt"));
        assert_eq!(volume.join(Path::new("/../etc/passwd")), PathBuf::from("/vol/a/etc/passwd"));
        assert_eq!(volume.join(Path::new("/")), PathBuf::from("/vol/a"));
    }

    #[tokio::test]
    async fn test_capacity_caps_free_space() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        std::fs::write(a.path().join("data.bin"), vec![0u8; 4]).unwrap();
        std::fs::create_dir(a.path().join("sub")).unwrap();
        std::fs::write(a.path().join("sub").join("more.bin"), vec![0u8; 2]).unwrap();

        let pool = make_pool(&[&a, &b], &[Some(10), Some(100)]);
        assert_eq!(pool.free_space_snapshot().await.unwrap(), vec![4, 100]);

        let space = pool.get_space().await.unwrap();
        assert_eq!(space.total, 110);
        assert_eq!(space.free_available, 104);
    }

    #[tokio::test]
    async fn test_ignored_names_do_not_count_against_capacity() {
        let a = TempDir::new().unwrap();
        std::fs::write(a.path().join("data.bin"), vec![0u8; 4]).unwrap();
        std::fs::write(a.path().join("._meta"), vec![0u8; 3]).unwrap();
        std::fs::create_dir(a.path().join("._dir")).unwrap();
        std::fs::write(a.path().join("._dir").join("inner"), vec![0u8; 2]).unwrap();

        let pool = make_pool(&[&a], &[Some(10)]);
        assert_eq!(pool.volumes()[0].used_bytes(&["._*".to_string()]).await.unwrap(), 4);
        assert_eq!(pool.volumes()[0].used_bytes(&[]).await.unwrap(), 9);
        assert_eq!(pool.free_space_snapshot().await.unwrap(), vec![6]);
    }

    #[tokio::test]
    async fn test_uncapped_volumes_on_same_filesystem_counted_once() {
        let parent = TempDir::new().unwrap();
        let a = parent.path().join("a");
        let b = parent.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();

        let single = VolumePool::new(vec![(a.clone(), None)], vec![]).unwrap();
        let double = VolumePool::new(vec![(a, None), (b, None)], vec![]).unwrap();

        let one = single.get_space().await.unwrap();
        let two = double.get_space().await.unwrap();
        assert_eq!(one.total, two.total);
    }

    #[test]
    fn test_pool_from_config_always_hides_lock_file() {
        let a = TempDir::new().unwrap();
        let config = PoolConfig::new()
            .with_volume(crate::config::VolumeConfig::new(a.path()))
            .with_ignore_patterns(vec!["*.tmp".to_string()]);
        let pool = VolumePool::from_config(&config).unwrap();
        assert!(pool.is_ignored(crate::lock::LOCK_FILE_NAME));
        assert!(pool.is_ignored("scratch.tmp"));
        assert!(!pool.is_ignored("data.bin"));
    }

    #[test]
    fn test_ignored_names() {
        let a = TempDir::new().unwrap();
        let pool = make_pool(&[&a], &[None]);
        assert!(pool.is_ignored("._foo"));
        assert!(!pool.is_ignored("foo"));
    }
}
