pub mod pattern;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use crate::error::{FsError, Result};
use crate::fs::LogicalFileView;
use crate::resolver::PathResolver;
use self::pattern::is_name_in_expression;

/// 把各卷上的目录项合并为一个逻辑目录视图
#[derive(Debug, Clone)]
pub struct DirectoryMerger {
    resolver: Arc<PathResolver>,
}

impl DirectoryMerger {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// 列出逻辑目录下匹配 `pattern` 的条目，每个名字一项，按首次出现的顺序排列
    pub async fn list(&self, directory: &Path, pattern: &str) -> Result<Vec<LogicalFileView>> {
        let pool = self.resolver.pool();
        let mut entries: Vec<LogicalFileView> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut visited = 0usize;

        for volume in pool.volumes() {
            let physical = volume.join(directory);
            let metadata = match tokio::fs::metadata(&physical).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_dir() {
                return Err(FsError::NotADirectory(directory.to_string_lossy().into_owned()));
            }
            visited += 1;

            let mut children = tokio::fs::read_dir(&physical).await?;
            while let Some(child) = children.next_entry().await? {
                let name = child.file_name().to_string_lossy().into_owned();
                if pool.is_ignored(&name) || !is_name_in_expression(pattern, &name, true) {
                    continue;
                }
                // 悬空链接等无法读取元数据的条目直接跳过
                let metadata = match tokio::fs::metadata(child.path()).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        debug!("list: skipping {:?}: {}", child.path(), e);
                        continue;
                    }
                };

                let view = LogicalFileView::from_metadata(name.clone(), &metadata);
                match index.get(&name) {
                    Some(&i) => entries[i].fold(view.created, view.accessed, view.modified, view.length),
                    None => {
                        index.insert(name, entries.len());
                        entries.push(view);
                    }
                }
            }
        }

        if visited == 0 {
            return Err(FsError::PathNotFound(directory.to_string_lossy().into_owned()));
        }

        debug!("list: {:?} pattern={:?} -> {} entries", directory, pattern, entries.len());
        Ok(entries)
    }

    /// 单个逻辑路径的聚合视图；每次调用都重新计算
    pub async fn file_view(&self, logical: &Path) -> Result<LogicalFileView> {
        let physical = self.resolver.resolve_existing(logical).await?;
        let name = PathResolver::leaf_name(logical).unwrap_or_else(|| "/".to_string());

        let metadata = tokio::fs::metadata(&physical).await?;
        if metadata.is_dir() {
            return Ok(LogicalFileView::from_metadata(name, &metadata));
        }

        let fragments = self.resolver.fragments(logical).await?;
        let mut iter = fragments.iter();
        let first = match iter.next() {
            Some(first) => first,
            None => return Err(FsError::file_not_found(logical.to_string_lossy())),
        };
        let mut view = LogicalFileView::from_fragment(name, first);
        for fragment in iter {
            view.fold_fragment(fragment);
        }
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumePool;
    use std::fs::{File, FileTimes};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn setup(count: usize) -> (Vec<TempDir>, DirectoryMerger) {
        let dirs: Vec<TempDir> = (0..count).map(|_| TempDir::new().unwrap()).collect();
        let pool = VolumePool::new(
            dirs.iter().map(|d| (d.path().to_path_buf(), None)).collect(),
            vec!["._*".to_string()],
        )
        .unwrap();
        let resolver = Arc::new(PathResolver::new(Arc::new(pool)));
        (dirs, DirectoryMerger::new(resolver))
    }

    fn write_with_mtime(path: &Path, data: &[u8], secs: u64) {
        std::fs::write(path, data).unwrap();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_modified(at).set_accessed(at)).unwrap();
    }

    #[tokio::test]
    async fn test_same_name_is_aggregated() {
        let (dirs, merger) = setup(2);
        write_with_mtime(&dirs[0].path().join("foo.txt"), b"1234", 1_000);
        write_with_mtime(&dirs[1].path().join("foo.txt"), b"567890", 2_000);
        write_with_mtime(&dirs[1].path().join("bar.txt"), b"z", 1_500);

        let entries = merger.list(Path::new("/"), "*").await.unwrap();
        assert_eq!(entries.len(), 2);

        let foo = entries.iter().find(|e| e.name == "foo.txt").unwrap();
        assert_eq!(foo.length, 10);
        assert_eq!(foo.modified, SystemTime::UNIX_EPOCH + Duration::from_secs(2_000));
        assert!(!foo.is_dir);
    }

    #[tokio::test]
    async fn test_pattern_and_ignored_names() {
        let (dirs, merger) = setup(2);
        std::fs::write(dirs[0].path().join("a.txt"), b"a").unwrap();
        std::fs::write(dirs[1].path().join("B.TXT"), b"b").unwrap();
        std::fs::write(dirs[1].path().join("c.rs"), b"c").unwrap();
        std::fs::write(dirs[0].path().join("._a.txt"), b"meta").unwrap();

        let mut names: Vec<String> = merger
            .list(Path::new("/"), "*.txt")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["B.TXT".to_string(), "a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_list_subdirectory_on_some_volumes() {
        let (dirs, merger) = setup(2);
        std::fs::create_dir(dirs[1].path().join("docs")).unwrap();
        std::fs::write(dirs[1].path().join("docs").join("x.md"), b"x").unwrap();

        let entries = merger.list(Path::new("/docs"), "").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x.md");

        let err = merger.list(Path::new("/nowhere"), "*").await.unwrap_err();
        assert!(matches!(err, FsError::PathNotFound(_)));

        std::fs::write(dirs[0].path().join("plain"), b"p").unwrap();
        let err = merger.list(Path::new("/plain"), "*").await.unwrap_err();
        assert!(matches!(err, FsError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_file_view_is_idempotent() {
        let (dirs, merger) = setup(2);
        write_with_mtime(&dirs[0].path().join("foo.txt"), b"1234", 1_000);
        write_with_mtime(&dirs[1].path().join("foo.txt"), b"567890", 2_000);

        let first = merger.file_view(Path::new("/foo.txt")).await.unwrap();
        let second = merger.file_view(Path::new("/foo.txt")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.length, 10);
        assert_eq!(first.name, "foo.txt");

        let root = merger.file_view(Path::new("/")).await.unwrap();
        assert!(root.is_dir);
    }
}
