use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use crate::error::{FsError, Result};
use crate::fs::Fragment;
use crate::volume::{VolumePool, VolumeRoot};

/// 一个候选物理位置：(卷, 物理路径)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub volume: usize,
    pub path: PathBuf,
}

/// 逻辑路径到物理位置的解析。
///
/// 名字匹配只比较逻辑路径的最后一段（忽略大小写），在每个卷上逻辑父目录对应的物理目录中进行；
/// 位于逻辑根下的名字即与卷根的直接子项比较。
#[derive(Debug, Clone)]
pub struct PathResolver {
    pool: Arc<VolumePool>,
}

impl PathResolver {
    pub fn new(pool: Arc<VolumePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &VolumePool {
        &self.pool
    }

    /// 逻辑路径的最后一段；根路径返回 `None`
    pub fn leaf_name(logical: &Path) -> Option<String> {
        logical.components().rev().find_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
    }

    fn display(logical: &Path) -> String {
        logical.to_string_lossy().into_owned()
    }

    /// 在逻辑父目录对应的物理目录中查找与叶子名同名（忽略大小写）的条目，返回其实际路径。
    ///
    /// 路径直接位于逻辑根下时即为卷根的直接子项。父目录在该卷上不存在时返回 `None`。
    async fn find_entry(&self, volume: &VolumeRoot, logical: &Path, files_only: bool) -> Result<Option<(PathBuf, std::fs::Metadata)>> {
        let leaf = match Self::leaf_name(logical) {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        if self.pool.is_ignored(&leaf) {
            return Ok(None);
        }
        let accept = |metadata: &std::fs::Metadata| !files_only || metadata.is_file();

        // 大小写完全一致时不必扫描目录
        let exact = volume.join(logical);
        if let Ok(metadata) = tokio::fs::metadata(&exact).await {
            if accept(&metadata) {
                return Ok(Some((exact, metadata)));
            }
        }

        let parent = volume.join(logical.parent().unwrap_or_else(|| Path::new("/")));
        let mut entries = match tokio::fs::read_dir(&parent).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let wanted = leaf.to_lowercase();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_lowercase() != wanted || self.pool.is_ignored(&name) {
                continue;
            }
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if accept(&metadata) {
                return Ok(Some((entry.path(), metadata)));
            }
        }
        Ok(None)
    }

    /// 解析逻辑路径。
    ///
    /// `force_all_volumes` 为 false 时按池顺序返回第一个包含该名字的卷，路径沿用卷上实际的大小写；
    /// 没有匹配时，`all_volumes` 为 true 则返回每个卷的候选路径，否则返回 `NotFound`。
    /// `force_all_volumes` 为 true 时不检查存在性，直接返回所有卷的候选路径。
    pub async fn resolve(&self, logical: &Path, all_volumes: bool, force_all_volumes: bool) -> Result<Vec<Candidate>> {
        if !force_all_volumes {
            for volume in self.pool.volumes() {
                if let Some((path, _)) = self.find_entry(volume, logical, false).await? {
                    debug!("resolve: {:?} -> volume #{} ({:?})", logical, volume.index(), path);
                    return Ok(vec![Candidate {
                        volume: volume.index(),
                        path,
                    }]);
                }
            }
            if !all_volumes {
                return Err(FsError::not_found(Self::display(logical)));
            }
        }

        Ok(self
            .pool
            .volumes()
            .iter()
            .map(|volume| Candidate {
                volume: volume.index(),
                path: volume.join(logical),
            })
            .collect())
    }

    /// 单目标解析：第一个匹配的卷，没有匹配时落到池中第一个卷
    pub async fn resolve_or_primary(&self, logical: &Path) -> Result<Candidate> {
        match self.resolve(logical, false, false).await {
            Ok(mut found) => Ok(found.remove(0)),
            Err(FsError::NotFound(_)) => {
                let primary = self.pool.primary();
                Ok(Candidate {
                    volume: primary.index(),
                    path: primary.join(logical),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// 返回第一个真实存在的物理路径（文件或目录）；逻辑根解析为第一个卷的根目录
    pub async fn resolve_existing(&self, logical: &Path) -> Result<PathBuf> {
        let leaf = match Self::leaf_name(logical) {
            Some(leaf) => leaf,
            None => return Ok(self.pool.primary().root().to_path_buf()),
        };

        // 所有卷上都没有匹配时退回第一个卷上的同名路径
        let candidate = self.resolve_or_primary(logical).await?;
        if !self.pool.is_ignored(&leaf) && tokio::fs::symlink_metadata(&candidate.path).await.is_ok() {
            return Ok(candidate.path);
        }
        Err(FsError::file_not_found(Self::display(logical)))
    }

    /// 跨卷写入的目标：每个卷一个；卷中已有大小写不同的同名分片时沿用其路径，
    /// 保证每个卷最多一个分片
    pub async fn write_targets(&self, logical: &Path) -> Result<Vec<Candidate>> {
        let mut targets = self.resolve(logical, true, true).await?;
        for target in targets.iter_mut() {
            let volume = &self.pool.volumes()[target.volume];
            if let Some((path, _)) = self.find_entry(volume, logical, true).await? {
                target.path = path;
            }
        }
        Ok(targets)
    }

    /// 按池顺序收集该逻辑文件在各卷上的分片（每卷最多一个）；
    /// 分片路径与 [`resolve`](Self::resolve) 使用同一映射
    pub async fn fragments(&self, logical: &Path) -> Result<Vec<Fragment>> {
        let mut fragments = Vec::new();
        for volume in self.pool.volumes() {
            if let Some((path, metadata)) = self.find_entry(volume, logical, true).await? {
                fragments.push(Fragment::from_metadata(volume.index(), path, &metadata));
            }
        }
        debug!("fragments: {:?} -> {} fragment(s)", logical, fragments.len());
        Ok(fragments)
    }

    /// 反向映射：物理路径 -> (卷序号, 以 `/` 为根的逻辑路径)
    pub fn to_logical(&self, physical: &Path) -> Option<(usize, PathBuf)> {
        self.pool.volumes().iter().find_map(|volume| {
            physical
                .strip_prefix(volume.root())
                .ok()
                .map(|rel| (volume.index(), Path::new("/").join(rel)))
        })
    }
}
