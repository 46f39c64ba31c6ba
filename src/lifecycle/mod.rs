pub mod handle;
pub mod locks;

pub use self::handle::{BoundFile, OpenHandle};
pub use self::locks::{RangeLock, RangeLockTable};

use std::fs::{FileTimes, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tracing::{debug, info, warn};
use crate::error::{FsError, Result, Status};
use crate::fs::{
    AccessIntent, CreationDisposition, DiskSpace, LogicalFileSystem, LogicalFileView, OpenRequest,
    Opened, VolumeInfo,
};
use crate::merger::DirectoryMerger;
use crate::reader::FragmentReader;
use crate::resolver::PathResolver;
use crate::volume::VolumePool;
use crate::writer::SpanningWriter;

pub const VOLUME_LABEL: &str = "SPANFS";
pub const FILESYSTEM_NAME: &str = "spanfs";
pub const MAX_COMPONENT_LENGTH: u32 = 255;

/// 跨卷逻辑文件系统。
///
/// 打开/清理状态机、属性与时间、删除、移动、长度与字节范围锁都在这里分派，
/// 数据读写交给 [`SpanningWriter`] 与 [`FragmentReader`]，目录合并交给 [`DirectoryMerger`]。
pub struct SpanningFs {
    resolver: Arc<PathResolver>,
    writer: SpanningWriter,
    reader: FragmentReader,
    merger: DirectoryMerger,
    locks: RangeLockTable,
    next_handle: AtomicU64,
    mount_point: Mutex<Option<PathBuf>>,
}

impl std::fmt::Debug for SpanningFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanningFs")
            .field("volumes", &self.resolver.pool().len())
            .field("next_handle", &self.next_handle.load(Ordering::Relaxed))
            .finish()
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn status_of<T>(result: &Result<T>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(e) => e.status(),
    }
}

/// 每个逻辑操作一行调试日志：`op('path', args) -> Status`
fn trace(op: &str, path: &Path, args: &str, status: Status) {
    if args.is_empty() {
        debug!("{}('{}') -> {}", op, path.display(), status);
    } else {
        debug!("{}('{}', {}) -> {}", op, path.display(), args, status);
    }
}

impl SpanningFs {
    pub fn new(pool: VolumePool) -> Self {
        let resolver = Arc::new(PathResolver::new(Arc::new(pool)));
        Self {
            writer: SpanningWriter::new(resolver.clone()),
            reader: FragmentReader::new(resolver.clone()),
            merger: DirectoryMerger::new(resolver.clone()),
            resolver,
            locks: RangeLockTable::new(),
            next_handle: AtomicU64::new(1),
            mount_point: Mutex::new(None),
        }
    }

    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    pub fn pool(&self) -> &VolumePool {
        self.resolver.pool()
    }

    pub fn mount_point(&self) -> Option<PathBuf> {
        self.mount_point.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 第一个存在的物理位置及其元数据；不存在时返回 `None`
    async fn existing(&self, logical: &Path) -> Result<Option<(PathBuf, std::fs::Metadata)>> {
        match self.resolver.resolve_existing(logical).await {
            Ok(physical) => {
                let metadata = tokio::fs::metadata(&physical).await?;
                Ok(Some((physical, metadata)))
            }
            Err(FsError::FileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn open_entry(&self, logical: &Path, request: OpenRequest) -> Result<Opened> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let existing = self.existing(logical).await?;

        if request.directory {
            let is_dir = existing.as_ref().map(|(_, metadata)| metadata.is_dir());
            return self.open_directory(id, logical, request, is_dir).await;
        }

        use CreationDisposition::*;
        match existing {
            Some((_, metadata)) if metadata.is_dir() => match request.disposition {
                CreateNew => Err(FsError::FileExists(display(logical))),
                Create | Truncate => Err(FsError::access_denied(display(logical))),
                _ => {
                    // 以文件方式请求删除一个目录
                    if request.access.contains(AccessIntent::DELETE)
                        && !request.access.contains(AccessIntent::SYNCHRONIZE)
                    {
                        return Err(FsError::access_denied(display(logical)));
                    }
                    Ok(Opened {
                        handle: OpenHandle::new(id, logical.to_path_buf(), true, None),
                        status: Status::Success,
                    })
                }
            },
            Some((physical, _)) => {
                match request.disposition {
                    CreateNew => return Err(FsError::FileExists(display(logical))),
                    Create | Truncate => self.truncate_logical(logical).await?,
                    Open | OpenOrCreate | Append => {}
                }

                // 只操作元数据的打开绑定到第一个匹配卷上的物理文件，数据读写保持未绑定
                let bound = if request.access.has_data_access() {
                    None
                } else {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(request.access.writes())
                        .open(&physical)
                        .await?;
                    Some(BoundFile::new(physical, file))
                };

                let status = match request.disposition {
                    Create | OpenOrCreate => Status::AlreadyExists,
                    _ => Status::Success,
                };
                Ok(Opened {
                    handle: OpenHandle::new(id, logical.to_path_buf(), false, bound),
                    status,
                })
            }
            None => match request.disposition {
                Open | Truncate => Err(FsError::file_not_found(display(logical))),
                CreateNew | Create | OpenOrCreate | Append => {
                    self.create_file(logical, request.mode).await?;
                    Ok(Opened {
                        handle: OpenHandle::new(id, logical.to_path_buf(), false, None),
                        status: Status::Success,
                    })
                }
            },
        }
    }

    async fn open_directory(
        &self,
        id: u64,
        logical: &Path,
        request: OpenRequest,
        is_dir: Option<bool>,
    ) -> Result<Opened> {
        use CreationDisposition::*;
        let status = match (is_dir, request.disposition) {
            (Some(false), _) => return Err(FsError::NotADirectory(display(logical))),
            (Some(true), CreateNew) => return Err(FsError::FileExists(display(logical))),
            (Some(true), Create | OpenOrCreate) => Status::AlreadyExists,
            (Some(true), _) => Status::Success,
            (None, Open | Truncate | Append) => return Err(FsError::file_not_found(display(logical))),
            (None, CreateNew | Create | OpenOrCreate) => {
                self.create_directory(logical, request.mode).await?;
                Status::Success
            }
        };
        Ok(Opened {
            handle: OpenHandle::new(id, logical.to_path_buf(), true, None),
            status,
        })
    }

    /// 新文件放在解析得到的单一目标上（不存在时为第一个卷）
    async fn create_file(&self, logical: &Path, mode: Option<u32>) -> Result<()> {
        let target = self.resolver.resolve_or_primary(logical).await?;
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        if let Some(mode) = mode {
            options.mode(mode & 0o7777);
        }
        match options.open(&target.path).await {
            Ok(_) => {
                debug!("create_file: {:?} on volume #{}", logical, target.volume);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FsError::PathNotFound(display(logical))),
            Err(e) => Err(e.into()),
        }
    }

    /// 目录在每个卷上都创建，这样之后的跨卷写入在每个卷上都有父目录
    async fn create_directory(&self, logical: &Path, mode: Option<u32>) -> Result<()> {
        let mut created = 0usize;
        for volume in self.pool().volumes() {
            let physical = volume.join(logical);
            match tokio::fs::create_dir(&physical).await {
                Ok(()) => {
                    if let Some(mode) = mode {
                        tokio::fs::set_permissions(&physical, Permissions::from_mode(mode & 0o7777)).await?;
                    }
                    created += 1;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => created += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("create_directory: parent missing on volume #{}", volume.index());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if created == 0 {
            return Err(FsError::PathNotFound(display(logical)));
        }
        Ok(())
    }

    /// 逻辑截断：第一个分片截为 0，其余分片删除
    async fn truncate_logical(&self, logical: &Path) -> Result<()> {
        let fragments = self.resolver.fragments(logical).await?;
        let mut iter = fragments.iter();
        if let Some(first) = iter.next() {
            let file = OpenOptions::new().write(true).open(&first.path).await?;
            file.set_len(0).await?;
        }
        for fragment in iter {
            tokio::fs::remove_file(&fragment.path).await?;
        }
        debug!("truncate: {:?} ({} fragment(s))", logical, fragments.len());
        Ok(())
    }

    /// 删除所有卷上的同名分片
    async fn delete_fragments(&self, logical: &Path) -> Result<usize> {
        let fragments = self.resolver.fragments(logical).await?;
        for fragment in &fragments {
            tokio::fs::remove_file(&fragment.path).await?;
            debug!("delete: volume #{} {:?}", fragment.volume, fragment.path);
        }
        Ok(fragments.len())
    }

    /// 从所有包含该目录的卷上删除；任一卷上非空则整体拒绝
    async fn delete_directory_everywhere(&self, logical: &Path) -> Result<()> {
        if PathResolver::leaf_name(logical).is_none() {
            return Err(FsError::access_denied(display(logical)));
        }

        let mut present = Vec::new();
        for volume in self.pool().volumes() {
            let physical = volume.join(logical);
            match tokio::fs::metadata(&physical).await {
                Ok(metadata) if metadata.is_dir() => {
                    let mut entries = tokio::fs::read_dir(&physical).await?;
                    if entries.next_entry().await?.is_some() {
                        return Err(FsError::DirectoryNotEmpty(display(logical)));
                    }
                    present.push(physical);
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        for physical in &present {
            tokio::fs::remove_dir(physical).await?;
        }
        debug!("delete_directory: {:?} removed from {} volume(s)", logical, present.len());
        Ok(())
    }

    /// 属性/时间修改的目标：所有分片，目录则为第一个匹配位置
    async fn attribute_targets(&self, logical: &Path) -> Result<Vec<PathBuf>> {
        let fragments = self.resolver.fragments(logical).await?;
        if !fragments.is_empty() {
            return Ok(fragments.into_iter().map(|f| f.path).collect());
        }
        Ok(vec![self.resolver.resolve_existing(logical).await?])
    }

    async fn lock_key(&self, handle: &OpenHandle) -> Result<PathBuf> {
        match handle.bound() {
            Some(bound) => Ok(bound.physical().to_path_buf()),
            None => self.resolver.resolve_existing(handle.path()).await,
        }
    }

    async fn do_cleanup(&self, handle: &OpenHandle) -> Result<()> {
        let released = self.locks.release_owner(handle.id());
        if released > 0 {
            debug!("cleanup: released {} range lock(s) of handle {}", released, handle.id());
        }
        handle.release().await?;

        if handle.delete_on_close() {
            if handle.is_directory() {
                self.delete_directory_everywhere(handle.path()).await?;
            } else {
                let count = self.delete_fragments(handle.path()).await?;
                info!("删除逻辑文件 {:?}，共 {} 个分片", handle.path(), count);
            }
        }
        Ok(())
    }

    async fn do_write(
        &self,
        logical: &Path,
        handle: Option<&OpenHandle>,
        data: &[u8],
        offset: i64,
        paging_io: bool,
    ) -> Result<u64> {
        if let Some(bound) = handle.and_then(|h| h.bound()) {
            return self.writer.write_at(bound, data, offset, paging_io).await;
        }
        self.writer.write(logical, data, offset).await?.into_result(logical)
    }

    async fn do_flush(&self, handle: &OpenHandle) -> Result<()> {
        let bound = match handle.bound() {
            Some(bound) => bound,
            None => return Ok(()),
        };
        let guard = bound.lock().await;
        if let Some(file) = guard.as_ref() {
            file.sync_all().await.map_err(|e| {
                warn!("flush: {:?} failed: {}", bound.physical(), e);
                FsError::DiskFull {
                    path: display(handle.path()),
                    written: 0,
                }
            })?;
        }
        Ok(())
    }

    async fn do_set_attributes(&self, logical: &Path, mode: u32) -> Result<()> {
        // 0 表示不修改
        if mode == 0 {
            return Ok(());
        }
        for target in self.attribute_targets(logical).await? {
            tokio::fs::set_permissions(&target, Permissions::from_mode(mode & 0o7777)).await?;
        }
        Ok(())
    }

    async fn do_set_times(
        &self,
        logical: &Path,
        created: Option<SystemTime>,
        accessed: Option<SystemTime>,
        written: Option<SystemTime>,
    ) -> Result<()> {
        if created.is_some() {
            debug!("set_times: creation time cannot be changed on this platform, ignored");
        }
        if accessed.is_none() && written.is_none() {
            return Ok(());
        }

        let mut times = FileTimes::new();
        if let Some(accessed) = accessed {
            times = times.set_accessed(accessed);
        }
        if let Some(written) = written {
            times = times.set_modified(written);
        }

        let targets = self.attribute_targets(logical).await?;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            for target in &targets {
                std::fs::File::open(target)?.set_times(times)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| FsError::Storage(format!("set_times task failed: {}", e)))??;
        Ok(())
    }

    async fn do_delete_file(&self, logical: &Path) -> Result<()> {
        let physical = self.resolver.resolve_existing(logical).await?;
        let metadata = tokio::fs::metadata(&physical).await?;
        if metadata.is_dir() {
            return Err(FsError::access_denied(display(logical)));
        }
        // 这里只做检查，真正的删除发生在 cleanup
        Ok(())
    }

    async fn do_move(&self, old_path: &Path, new_path: &Path, replace: bool) -> Result<()> {
        let source = match self.resolver.resolve(old_path, false, false).await {
            Ok(mut found) => found.remove(0),
            Err(FsError::NotFound(_)) => return Err(FsError::file_not_found(display(old_path))),
            Err(e) => return Err(e),
        };
        let source_metadata = tokio::fs::metadata(&source.path).await?;
        let is_dir = source_metadata.is_dir();

        if !is_dir {
            let fragments = self.resolver.fragments(old_path).await?;
            if fragments.len() > 1 {
                warn!(
                    "move: {:?} has {} fragments, only the one on volume #{} is renamed",
                    old_path,
                    fragments.len(),
                    source.volume
                );
            }
        }

        let destination = match self.resolver.resolve(new_path, false, false).await {
            Ok(mut found) => Some(found.remove(0)),
            Err(FsError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        // 只改大小写时目标解析回源文件本身
        if let Some(destination) = destination.filter(|d| d.path != source.path) {
            match tokio::fs::metadata(&destination.path).await {
                Ok(existing) => {
                    if !replace {
                        return Err(FsError::FileExists(display(new_path)));
                    }
                    if is_dir || existing.is_dir() {
                        return Err(FsError::access_denied(display(new_path)));
                    }
                    tokio::fs::remove_file(&destination.path).await?;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // 目标放在源所在的卷上，rename 不会跨文件系统
        let volume = self
            .pool()
            .get(source.volume)
            .ok_or_else(|| FsError::Storage(format!("volume #{} missing", source.volume)))?;
        let target = volume.join(new_path);
        match tokio::fs::rename(&source.path, &target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FsError::PathNotFound(display(new_path))),
            Err(e) => Err(e.into()),
        }
    }

    async fn do_set_end_of_file(&self, handle: &OpenHandle, length: u64) -> Result<()> {
        if handle.is_directory() {
            return Err(FsError::access_denied(display(handle.path())));
        }
        // 截断到 0 作用于整个逻辑文件
        if length == 0 {
            return self.truncate_logical(handle.path()).await;
        }
        self.set_bound_length(handle, length).await
    }

    /// 未绑定的句柄不做任何事：跨卷写入通过追加增长文件
    async fn set_bound_length(&self, handle: &OpenHandle, length: u64) -> Result<()> {
        let bound = match handle.bound() {
            Some(bound) => bound,
            None => return Ok(()),
        };
        let guard = bound.lock().await;
        let file = guard.as_ref().ok_or_else(|| bound.released())?;
        file.set_len(length).await.map_err(|e| {
            warn!("set_len: {:?} -> {} failed: {}", bound.physical(), length, e);
            FsError::DiskFull {
                path: display(handle.path()),
                written: 0,
            }
        })
    }
}

#[async_trait]
impl LogicalFileSystem for SpanningFs {
    async fn open<'a>(&'a self, path: &'a Path, request: OpenRequest) -> Result<Opened> {
        let result = self.open_entry(path, request).await;
        let status = match &result {
            Ok(opened) => opened.status,
            Err(e) => e.status(),
        };
        trace(
            "open",
            path,
            &format!("{:?}, {:?}, dir={}", request.access, request.disposition, request.directory),
            status,
        );
        result
    }

    async fn cleanup<'a>(&'a self, handle: &'a OpenHandle) -> Result<()> {
        let result = self.do_cleanup(handle).await;
        trace(
            "cleanup",
            handle.path(),
            &format!("delete_on_close={}", handle.delete_on_close()),
            status_of(&result),
        );
        result
    }

    async fn close<'a>(&'a self, handle: &'a OpenHandle) {
        let result = handle.release().await;
        if let Err(e) = &result {
            warn!("close: {:?} release failed: {}", handle.path(), e);
        }
        trace("close", handle.path(), "", status_of(&result));
    }

    async fn read<'a>(&'a self, path: &'a Path, handle: Option<&'a OpenHandle>, len: usize, offset: u64) -> Result<Vec<u8>> {
        let result = match handle.and_then(|h| h.bound()) {
            Some(bound) => self.reader.read_at(bound, len, offset).await,
            None => self.reader.read(path, len, offset).await,
        };
        let args = match &result {
            Ok(data) => format!("out {}, {}", data.len(), offset),
            Err(_) => format!("{}", offset),
        };
        trace("read", path, &args, status_of(&result));
        result
    }

    async fn write<'a>(
        &'a self,
        path: &'a Path,
        handle: Option<&'a OpenHandle>,
        data: &'a [u8],
        offset: i64,
        paging_io: bool,
    ) -> Result<u64> {
        let result = self.do_write(path, handle, data, offset, paging_io).await;
        let written = match &result {
            Ok(n) => *n,
            Err(FsError::DiskFull { written, .. }) => *written,
            Err(_) => 0,
        };
        trace("write", path, &format!("out {}, {}", written, offset), status_of(&result));
        result
    }

    async fn flush<'a>(&'a self, handle: &'a OpenHandle) -> Result<()> {
        let result = self.do_flush(handle).await;
        trace("flush", handle.path(), "", status_of(&result));
        result
    }

    async fn get_attributes<'a>(&'a self, path: &'a Path) -> Result<LogicalFileView> {
        let result = self.merger.file_view(path).await;
        trace("get_attributes", path, "", status_of(&result));
        result
    }

    async fn set_attributes<'a>(&'a self, path: &'a Path, mode: u32) -> Result<()> {
        let result = self.do_set_attributes(path, mode).await;
        trace("set_attributes", path, &format!("{:o}", mode), status_of(&result));
        result
    }

    async fn set_times<'a>(
        &'a self,
        path: &'a Path,
        created: Option<SystemTime>,
        accessed: Option<SystemTime>,
        written: Option<SystemTime>,
    ) -> Result<()> {
        let result = self.do_set_times(path, created, accessed, written).await;
        trace(
            "set_times",
            path,
            &format!("{:?}, {:?}, {:?}", created, accessed, written),
            status_of(&result),
        );
        result
    }

    async fn delete_file<'a>(&'a self, path: &'a Path) -> Result<()> {
        let result = self.do_delete_file(path).await;
        trace("delete_file", path, "", status_of(&result));
        result
    }

    async fn delete_directory<'a>(&'a self, path: &'a Path) -> Result<()> {
        let result = Err(FsError::NotImplemented(
            "directories are removed by delete-on-close cleanup".to_string(),
        ));
        trace("delete_directory", path, "", status_of(&result));
        result
    }

    async fn move_file<'a>(&'a self, old_path: &'a Path, new_path: &'a Path, replace: bool) -> Result<()> {
        let result = self.do_move(old_path, new_path, replace).await;
        trace(
            "move_file",
            old_path,
            &format!("{}, {}", new_path.display(), replace),
            status_of(&result),
        );
        result
    }

    async fn set_end_of_file<'a>(&'a self, handle: &'a OpenHandle, length: u64) -> Result<()> {
        let result = self.do_set_end_of_file(handle, length).await;
        trace("set_end_of_file", handle.path(), &length.to_string(), status_of(&result));
        result
    }

    async fn set_allocation_size<'a>(&'a self, handle: &'a OpenHandle, length: u64) -> Result<()> {
        let result = self.set_bound_length(handle, length).await;
        trace("set_allocation_size", handle.path(), &length.to_string(), status_of(&result));
        result
    }

    async fn lock<'a>(&'a self, handle: &'a OpenHandle, offset: u64, length: u64) -> Result<()> {
        let result = match self.lock_key(handle).await {
            Ok(key) => self.locks.lock(&key, handle.id(), offset, length),
            Err(e) => Err(e),
        };
        trace("lock", handle.path(), &format!("{}, {}", offset, length), status_of(&result));
        result
    }

    async fn unlock<'a>(&'a self, handle: &'a OpenHandle, offset: u64, length: u64) -> Result<()> {
        let result = match self.lock_key(handle).await {
            Ok(key) => self.locks.unlock(&key, handle.id(), offset, length),
            Err(e) => Err(e),
        };
        trace("unlock", handle.path(), &format!("{}, {}", offset, length), status_of(&result));
        result
    }

    async fn list<'a>(&'a self, directory: &'a Path, pattern: &'a str) -> Result<Vec<LogicalFileView>> {
        let result = self.merger.list(directory, pattern).await;
        trace("list", directory, pattern, status_of(&result));
        result
    }

    async fn get_space(&self) -> Result<DiskSpace> {
        let result = self.pool().get_space().await;
        if let Ok(space) = &result {
            debug!(
                "get_space() -> out {}, out {}, out {}",
                space.free_available, space.total, space.total_free
            );
        }
        result
    }

    fn volume_info(&self) -> VolumeInfo {
        VolumeInfo {
            label: VOLUME_LABEL.to_string(),
            filesystem_name: FILESYSTEM_NAME.to_string(),
            max_component_length: MAX_COMPONENT_LENGTH,
        }
    }

    async fn mounted<'a>(&'a self, mount_point: &'a Path) -> Result<()> {
        *self.mount_point.lock().unwrap_or_else(|e| e.into_inner()) = Some(mount_point.to_path_buf());
        info!("已挂载到 {:?}，共 {} 个卷", mount_point, self.pool().len());
        Ok(())
    }

    async fn unmounted(&self) -> Result<()> {
        let previous = self.mount_point.lock().unwrap_or_else(|e| e.into_inner()).take();
        info!("已卸载 {:?}", previous);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        dirs: Vec<TempDir>,
        fs: SpanningFs,
    }

    fn fixture(capacities: &[Option<u64>]) -> Fixture {
        let dirs: Vec<TempDir> = capacities.iter().map(|_| TempDir::new().unwrap()).collect();
        let pool = VolumePool::new(
            dirs.iter()
                .zip(capacities)
                .map(|(d, c)| (d.path().to_path_buf(), *c))
                .collect(),
            vec!["._*".to_string()],
        )
        .unwrap();
        Fixture {
            dirs,
            fs: SpanningFs::new(pool),
        }
    }

    fn root(f: &Fixture, index: usize) -> &Path {
        f.dirs[index].path()
    }

    fn rw() -> OpenRequest {
        OpenRequest::file(AccessIntent::READ_DATA | AccessIntent::WRITE_DATA, CreationDisposition::OpenOrCreate)
    }

    #[tokio::test]
    async fn test_spanning_write_and_read_through_handle() {
        let f = fixture(&[Some(10), Some(100)]);
        let path = Path::new("/foo.bin");
        let opened = f.fs.open(path, rw()).await.unwrap();
        assert_eq!(opened.status, Status::Success);
        assert!(opened.handle.bound().is_none());

        let data: Vec<u8> = (0..15u8).collect();
        let written = f.fs.write(path, Some(&opened.handle), &data, 0, false).await.unwrap();
        assert_eq!(written, 15);

        let back = f.fs.read(path, Some(&opened.handle), 15, 0).await.unwrap();
        assert_eq!(back, data);
        assert_eq!(std::fs::metadata(root(&f, 0).join("foo.bin")).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(root(&f, 1).join("foo.bin")).unwrap().len(), 5);

        let view = f.fs.get_attributes(path).await.unwrap();
        assert_eq!(view.length, 15);
        f.fs.cleanup(&opened.handle).await.unwrap();
        f.fs.close(&opened.handle).await;
    }

    #[tokio::test]
    async fn test_disk_full_reports_bytes_written() {
        let f = fixture(&[Some(5), Some(5)]);
        let err = f.fs.write(Path::new("/big"), None, &[1u8; 20], -1, false).await.unwrap_err();
        assert_eq!(err.status(), Status::DiskFull);
        assert!(matches!(err, FsError::DiskFull { written: 10, .. }));
    }

    #[tokio::test]
    async fn test_open_error_policy() {
        let f = fixture(&[None, None]);
        std::fs::write(root(&f, 1).join("a.txt"), b"x").unwrap();

        let open = OpenRequest::file(AccessIntent::READ_DATA, CreationDisposition::Open);
        let err = f.fs.open(Path::new("/missing"), open).await.unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);

        let truncate = OpenRequest::file(AccessIntent::WRITE_DATA, CreationDisposition::Truncate);
        let err = f.fs.open(Path::new("/missing"), truncate).await.unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);

        let create_new = OpenRequest::file(AccessIntent::WRITE_DATA, CreationDisposition::CreateNew);
        let err = f.fs.open(Path::new("/A.TXT"), create_new).await.unwrap_err();
        assert_eq!(err.status(), Status::FileExists);

        let opened = f.fs.open(Path::new("/a.txt"), rw()).await.unwrap();
        assert_eq!(opened.status, Status::AlreadyExists);
    }

    #[tokio::test]
    async fn test_new_file_lands_on_first_volume() {
        let f = fixture(&[None, None]);
        let request = OpenRequest::file(AccessIntent::WRITE_DATA, CreationDisposition::CreateNew).with_mode(0o600);
        let opened = f.fs.open(Path::new("/new.txt"), request).await.unwrap();
        assert_eq!(opened.status, Status::Success);
        assert!(root(&f, 0).join("new.txt").is_file());
        assert!(!root(&f, 1).join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_on_close_removes_every_fragment() {
        let f = fixture(&[Some(4), Some(4), None]);
        let path = Path::new("/doomed");
        f.fs.write(path, None, b"0123456789", 0, false).await.unwrap();
        for i in 0..3 {
            assert!(root(&f, i).join("doomed").exists());
        }

        f.fs.delete_file(path).await.unwrap();
        let request = OpenRequest::file(AccessIntent::DELETE, CreationDisposition::Open);
        let opened = f.fs.open(path, request).await.unwrap();
        opened.handle.set_delete_on_close(true);
        f.fs.cleanup(&opened.handle).await.unwrap();

        for i in 0..3 {
            assert!(!root(&f, i).join("doomed").exists());
        }
        let err = f.fs.get_attributes(path).await.unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);
    }

    #[tokio::test]
    async fn test_nested_file_spans_without_touching_root_namesake() {
        let f = fixture(&[Some(8), None]);
        std::fs::write(root(&f, 0).join("a.txt"), b"ROOT").unwrap();
        f.fs.open(Path::new("/docs"), OpenRequest::directory(CreationDisposition::CreateNew))
            .await
            .unwrap();

        let path = Path::new("/docs/a.txt");
        let written = f.fs.write(path, None, b"NESTED", 0, false).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(std::fs::read(root(&f, 0).join("docs").join("a.txt")).unwrap(), b"NEST");
        assert_eq!(std::fs::read(root(&f, 1).join("docs").join("a.txt")).unwrap(), b"ED");

        assert_eq!(f.fs.read(path, None, 16, 0).await.unwrap(), b"NESTED");
        assert_eq!(f.fs.get_attributes(path).await.unwrap().length, 6);
        assert_eq!(f.fs.read(Path::new("/a.txt"), None, 16, 0).await.unwrap(), b"ROOT");

        let request = OpenRequest::file(AccessIntent::DELETE, CreationDisposition::Open);
        let opened = f.fs.open(path, request).await.unwrap();
        opened.handle.set_delete_on_close(true);
        f.fs.cleanup(&opened.handle).await.unwrap();

        assert!(!root(&f, 0).join("docs").join("a.txt").exists());
        assert!(!root(&f, 1).join("docs").join("a.txt").exists());
        assert_eq!(std::fs::read(root(&f, 0).join("a.txt")).unwrap(), b"ROOT");
    }

    #[tokio::test]
    async fn test_nested_file_attributes_and_read() {
        let f = fixture(&[None, None]);
        std::fs::create_dir(root(&f, 1).join("docs")).unwrap();
        std::fs::write(root(&f, 1).join("docs").join("b.txt"), b"bee").unwrap();

        let path = Path::new("/docs/b.txt");
        let view = f.fs.get_attributes(path).await.unwrap();
        assert_eq!(view.length, 3);
        assert!(!view.is_dir);
        assert_eq!(f.fs.read(path, None, 8, 0).await.unwrap(), b"bee");
    }

    #[tokio::test]
    async fn test_directory_lifecycle() {
        let f = fixture(&[None, None]);
        let dir = Path::new("/docs");

        let opened = f.fs.open(dir, OpenRequest::directory(CreationDisposition::CreateNew)).await.unwrap();
        assert!(opened.handle.is_directory());
        assert!(root(&f, 0).join("docs").is_dir());
        assert!(root(&f, 1).join("docs").is_dir());

        let err = f.fs.open(dir, OpenRequest::directory(CreationDisposition::CreateNew)).await.unwrap_err();
        assert_eq!(err.status(), Status::FileExists);

        let err = f.fs.delete_file(dir).await.unwrap_err();
        assert_eq!(err.status(), Status::AccessDenied);
        let err = f.fs.delete_directory(dir).await.unwrap_err();
        assert_eq!(err.status(), Status::NotImplemented);

        std::fs::write(root(&f, 1).join("docs").join("keep"), b"k").unwrap();
        let handle = f.fs.open(dir, OpenRequest::directory(CreationDisposition::Open)).await.unwrap().handle;
        handle.set_delete_on_close(true);
        let err = f.fs.cleanup(&handle).await.unwrap_err();
        assert_eq!(err.status(), Status::DirectoryNotEmpty);
        assert!(root(&f, 0).join("docs").is_dir());

        std::fs::remove_file(root(&f, 1).join("docs").join("keep")).unwrap();
        f.fs.cleanup(&handle).await.unwrap();
        assert!(!root(&f, 0).join("docs").exists());
        assert!(!root(&f, 1).join("docs").exists());
    }

    #[tokio::test]
    async fn test_open_file_as_directory() {
        let f = fixture(&[None]);
        std::fs::write(root(&f, 0).join("plain"), b"p").unwrap();
        let err = f
            .fs
            .open(Path::new("/plain"), OpenRequest::directory(CreationDisposition::Open))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::NotADirectory);
    }

    #[tokio::test]
    async fn test_truncate_is_logical() {
        let f = fixture(&[Some(4), None]);
        let path = Path::new("/t.bin");
        f.fs.write(path, None, b"abcdefgh", 0, false).await.unwrap();

        let request = OpenRequest::file(AccessIntent::WRITE_DATA, CreationDisposition::Truncate);
        f.fs.open(path, request).await.unwrap();

        assert_eq!(std::fs::metadata(root(&f, 0).join("t.bin")).unwrap().len(), 0);
        assert!(!root(&f, 1).join("t.bin").exists());
        assert_eq!(f.fs.get_attributes(path).await.unwrap().length, 0);
    }

    #[tokio::test]
    async fn test_move_file() {
        let f = fixture(&[None, None]);
        std::fs::write(root(&f, 1).join("old.txt"), b"data").unwrap();
        std::fs::write(root(&f, 0).join("other.txt"), b"other").unwrap();

        let err = f
            .fs
            .move_file(Path::new("/old.txt"), Path::new("/other.txt"), false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::FileExists);

        f.fs.move_file(Path::new("/old.txt"), Path::new("/new.txt"), false).await.unwrap();
        assert_eq!(std::fs::read(root(&f, 1).join("new.txt")).unwrap(), b"data".to_vec());
        assert!(!root(&f, 1).join("old.txt").exists());

        f.fs.move_file(Path::new("/new.txt"), Path::new("/other.txt"), true).await.unwrap();
        assert!(!root(&f, 0).join("other.txt").exists());
        assert_eq!(std::fs::read(root(&f, 1).join("other.txt")).unwrap(), b"data".to_vec());

        f.fs.move_file(Path::new("/other.txt"), Path::new("/OTHER.txt"), false).await.unwrap();
        assert!(root(&f, 1).join("OTHER.txt").is_file());
        assert!(!root(&f, 1).join("other.txt").exists());
    }

    #[tokio::test]
    async fn test_move_refuses_directory_destination() {
        let f = fixture(&[None]);
        std::fs::write(root(&f, 0).join("a"), b"a").unwrap();
        std::fs::create_dir(root(&f, 0).join("d")).unwrap();
        let err = f.fs.move_file(Path::new("/a"), Path::new("/d"), true).await.unwrap_err();
        assert_eq!(err.status(), Status::AccessDenied);

        let err = f.fs.move_file(Path::new("/nope"), Path::new("/x"), true).await.unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);
    }

    #[tokio::test]
    async fn test_metadata_handle_is_bound() {
        let f = fixture(&[None, None]);
        std::fs::write(root(&f, 1).join("m.txt"), b"hello world").unwrap();

        let request = OpenRequest::file(
            AccessIntent::READ_ATTRIBUTES | AccessIntent::WRITE_ATTRIBUTES,
            CreationDisposition::Open,
        );
        let opened = f.fs.open(Path::new("/m.txt"), request).await.unwrap();
        let bound = opened.handle.bound().unwrap();
        assert_eq!(bound.physical(), root(&f, 1).join("m.txt").as_path());

        f.fs.flush(&opened.handle).await.unwrap();
        f.fs.set_end_of_file(&opened.handle, 5).await.unwrap();
        assert_eq!(std::fs::read(root(&f, 1).join("m.txt")).unwrap(), b"hello".to_vec());

        f.fs.cleanup(&opened.handle).await.unwrap();
        let err = f.fs.set_end_of_file(&opened.handle, 2).await.unwrap_err();
        assert_eq!(err.status(), Status::Error);
    }

    #[tokio::test]
    async fn test_range_locks() {
        let f = fixture(&[None]);
        std::fs::write(root(&f, 0).join("l.txt"), b"0123456789").unwrap();
        let first = f.fs.open(Path::new("/l.txt"), rw()).await.unwrap().handle;
        let second = f.fs.open(Path::new("/l.txt"), rw()).await.unwrap().handle;

        f.fs.lock(&first, 0, 5).await.unwrap();
        let err = f.fs.lock(&second, 2, 5).await.unwrap_err();
        assert_eq!(err.status(), Status::AccessDenied);
        let err = f.fs.unlock(&second, 0, 5).await.unwrap_err();
        assert_eq!(err.status(), Status::AccessDenied);

        f.fs.cleanup(&first).await.unwrap();
        f.fs.lock(&second, 2, 5).await.unwrap();
        f.fs.unlock(&second, 2, 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_attributes_and_times_apply_to_every_fragment() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let f = fixture(&[Some(3), None]);
        let path = Path::new("/attr");
        f.fs.write(path, None, b"abcdef", 0, false).await.unwrap();

        f.fs.set_attributes(path, 0o600).await.unwrap();
        f.fs.set_attributes(path, 0).await.unwrap();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_234_567);
        f.fs.set_times(path, None, Some(when), Some(when)).await.unwrap();

        for i in 0..2 {
            let metadata = std::fs::metadata(root(&f, i).join("attr")).unwrap();
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
            assert_eq!(metadata.modified().unwrap(), when);
        }
        let view = f.fs.get_attributes(path).await.unwrap();
        assert_eq!(view.modified, when);
    }

    #[tokio::test]
    async fn test_list_and_space_and_hooks() {
        let f = fixture(&[Some(1000), Some(1000)]);
        std::fs::write(root(&f, 0).join("a.txt"), b"aa").unwrap();
        std::fs::write(root(&f, 1).join("a.txt"), b"aaa").unwrap();
        std::fs::write(root(&f, 1).join("b.log"), b"b").unwrap();

        let entries = f.fs.list(Path::new("/"), "*.txt").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].length, 5);

        let space = f.fs.get_space().await.unwrap();
        assert_eq!(space.total, 2000);
        assert_eq!(space.free_available, 2000 - 6);

        let info = f.fs.volume_info();
        assert_eq!(info.label, "SPANFS");
        assert_eq!(info.max_component_length, 255);

        f.fs.mounted(Path::new("/mnt/span")).await.unwrap();
        assert_eq!(f.fs.mount_point(), Some(PathBuf::from("/mnt/span")));
        f.fs.unmounted().await.unwrap();
        assert_eq!(f.fs.mount_point(), None);
    }
}
