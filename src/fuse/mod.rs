use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use libc::{c_int, ENOENT};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use crate::error::FsError;
use crate::fs::{
    AccessIntent, ChangeEvent, ChangeKind, CreationDisposition, LogicalFileSystem, LogicalFileView,
    OpenRequest,
};
use crate::lifecycle::OpenHandle;
use crate::notify::NotificationSink;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u64 = 4096;
/// 页缓存回写标志
const FUSE_WRITE_CACHE: u32 = 1;

/// inode 与逻辑路径的双向映射
#[derive(Debug)]
pub struct InodeTable {
    path_to_ino: Mutex<HashMap<PathBuf, u64>>,
    ino_to_path: Mutex<HashMap<u64, PathBuf>>,
    next_ino: Mutex<u64>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        let root_path = PathBuf::from("/");
        path_to_ino.insert(root_path.clone(), FUSE_ROOT_ID);
        ino_to_path.insert(FUSE_ROOT_ID, root_path);

        Self {
            path_to_ino: Mutex::new(path_to_ino),
            ino_to_path: Mutex::new(ino_to_path),
            next_ino: Mutex::new(FUSE_ROOT_ID + 1),
        }
    }

    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.ino_to_path.lock().unwrap_or_else(|e| e.into_inner()).get(&ino).cloned()
    }

    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let mut path = self.path(parent)?;
        path.push(name);
        debug!("child_path: parent={}, name={:?} -> {:?}", parent, name, path);
        Some(path)
    }

    pub fn allocate(&self, path: PathBuf) -> u64 {
        let mut path_to_ino = self.path_to_ino.lock().unwrap_or_else(|e| e.into_inner());
        let mut ino_to_path = self.ino_to_path.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(&ino) = path_to_ino.get(&path) {
            return ino;
        }

        let mut next_ino = self.next_ino.lock().unwrap_or_else(|e| e.into_inner());
        let ino = *next_ino;
        *next_ino += 1;
        path_to_ino.insert(path.clone(), ino);
        ino_to_path.insert(ino, path.clone());
        debug!("allocate: new ino={} for path={:?}", ino, path);
        ino
    }

    pub fn remove(&self, path: &Path) -> Option<u64> {
        let mut path_to_ino = self.path_to_ino.lock().unwrap_or_else(|e| e.into_inner());
        let mut ino_to_path = self.ino_to_path.lock().unwrap_or_else(|e| e.into_inner());
        let ino = path_to_ino.remove(path)?;
        ino_to_path.remove(&ino);
        Some(ino)
    }

    /// 重命名后保留 inode，并把所有子路径一起改写
    pub fn rename(&self, old_path: &Path, new_path: &Path) {
        let mut path_to_ino = self.path_to_ino.lock().unwrap_or_else(|e| e.into_inner());
        let mut ino_to_path = self.ino_to_path.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(stale) = path_to_ino.remove(new_path) {
            ino_to_path.remove(&stale);
        }

        let moved: Vec<(PathBuf, u64)> = path_to_ino
            .iter()
            .filter(|(path, _)| path.starts_with(old_path))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (path, ino) in moved {
            let renamed = match path.strip_prefix(old_path) {
                Ok(rest) if rest.as_os_str().is_empty() => new_path.to_path_buf(),
                Ok(rest) => new_path.join(rest),
                Err(_) => continue,
            };
            path_to_ino.remove(&path);
            path_to_ino.insert(renamed.clone(), ino);
            ino_to_path.insert(ino, renamed);
        }
    }
}

/// 把通知桥的事件应用到 inode 表：删除与重命名会让旧路径的 inode 失效
#[derive(Debug, Clone)]
pub struct InodeInvalidator {
    inodes: Arc<InodeTable>,
    mount_point: PathBuf,
}

impl InodeInvalidator {
    pub fn new(inodes: Arc<InodeTable>, mount_point: PathBuf) -> Self {
        Self { inodes, mount_point }
    }

    fn logical(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.mount_point)
            .ok()
            .map(|rel| Path::new("/").join(rel))
    }
}

impl NotificationSink for InodeInvalidator {
    fn publish(&self, event: ChangeEvent) {
        let path = match self.logical(&event.path) {
            Some(path) => path,
            None => return,
        };
        match event.kind {
            ChangeKind::Delete { .. } => {
                if let Some(ino) = self.inodes.remove(&path) {
                    debug!("invalidate: {:?} (ino={})", path, ino);
                }
            }
            ChangeKind::Rename { old_path, .. } => {
                if let Some(old) = self.logical(&old_path) {
                    self.inodes.rename(&old, &path);
                }
            }
            ChangeKind::Create { .. } | ChangeKind::Update => {}
        }
    }
}

/// open(2) 的访问模式 -> 访问意图
pub fn access_from_flags(flags: i32) -> AccessIntent {
    let mut access = match flags & libc::O_ACCMODE {
        libc::O_WRONLY => AccessIntent::WRITE_DATA,
        libc::O_RDWR => AccessIntent::READ_DATA | AccessIntent::WRITE_DATA,
        _ => AccessIntent::READ_DATA,
    };
    if flags & libc::O_APPEND != 0 {
        access |= AccessIntent::APPEND_DATA;
    }
    access
}

/// open(2)/creat(2) 的标志 -> 创建方式
pub fn disposition_from_flags(flags: i32, creating: bool) -> CreationDisposition {
    match (creating, flags & libc::O_EXCL != 0, flags & libc::O_TRUNC != 0) {
        (true, true, _) => CreationDisposition::CreateNew,
        (true, false, true) => CreationDisposition::Create,
        (true, false, false) if flags & libc::O_APPEND != 0 => CreationDisposition::Append,
        (true, false, false) => CreationDisposition::OpenOrCreate,
        (false, _, true) => CreationDisposition::Truncate,
        (false, _, false) => CreationDisposition::Open,
    }
}

fn to_file_attr(ino: u64, view: &LogicalFileView) -> FileAttr {
    FileAttr {
        ino,
        size: view.length,
        blocks: (view.length + 511) / 512,
        atime: view.accessed,
        mtime: view.modified,
        ctime: view.modified,
        crtime: view.created,
        kind: if view.is_dir { FileType::Directory } else { FileType::RegularFile },
        perm: (view.mode & 0o7777) as u16,
        nlink: if view.is_dir { 2 } else { 1 },
        uid: rustix::process::getuid().as_raw(),
        gid: rustix::process::getgid().as_raw(),
        rdev: 0,
        flags: 0,
        blksize: BLOCK_SIZE as u32,
    }
}

fn to_system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// FUSE 前端：把内核请求分派到 [`LogicalFileSystem`]
pub struct FuseAdapter {
    fs: Arc<dyn LogicalFileSystem>,
    inodes: Arc<InodeTable>,
    handles: Mutex<HashMap<u64, Arc<OpenHandle>>>,
    runtime: Handle,
    mount_point: PathBuf,
}

impl FuseAdapter {
    /// 必须在 tokio 运行时中创建；回调通过该运行时执行异步操作
    pub fn new(fs: Arc<dyn LogicalFileSystem>) -> Self {
        Self::with_runtime(fs, Handle::current())
    }

    pub fn with_runtime(fs: Arc<dyn LogicalFileSystem>, runtime: Handle) -> Self {
        Self {
            fs,
            inodes: Arc::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            runtime,
            mount_point: PathBuf::new(),
        }
    }

    pub fn inodes(&self) -> Arc<InodeTable> {
        Arc::clone(&self.inodes)
    }

    /// 阻塞直到文件系统被卸载
    pub fn mount(mut self, mount_point: &Path) -> std::io::Result<()> {
        info!("Mounting FUSE filesystem at {:?}", mount_point);
        self.mount_point = mount_point.to_path_buf();
        let options = [
            MountOption::FSName(crate::lifecycle::FILESYSTEM_NAME.to_string()),
            MountOption::DefaultPermissions,
        ];
        fuser::mount2(self, mount_point, &options)
    }

    fn run_async<F, T>(&self, f: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(f)
    }

    fn handle(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).get(&fh).cloned()
    }

    fn register(&self, handle: OpenHandle) -> u64 {
        let fh = handle.id();
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fh, Arc::new(handle));
        fh
    }

    fn take_handle(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).remove(&fh)
    }

    /// cleanup + close；释放失败只记录日志
    fn finish(&self, handle: &OpenHandle) -> Result<(), FsError> {
        self.run_async(async {
            let result = self.fs.cleanup(handle).await;
            self.fs.close(handle).await;
            result
        })
    }

    fn attr_of(&self, path: &Path) -> Result<FileAttr, FsError> {
        let view = self.run_async(self.fs.get_attributes(path))?;
        let ino = if path == Path::new("/") {
            FUSE_ROOT_ID
        } else {
            self.inodes.allocate(path.to_path_buf())
        };
        Ok(to_file_attr(ino, &view))
    }

    /// 以 delete-on-close 方式删除：打开、标记、清理
    fn delete_on_close(&self, path: &Path, request: OpenRequest) -> Result<(), FsError> {
        let opened = self.run_async(self.fs.open(path, request))?;
        opened.handle.set_delete_on_close(true);
        self.finish(&opened.handle)?;
        self.inodes.remove(path);
        Ok(())
    }

    fn set_length(&self, path: &Path, size: u64) -> Result<(), FsError> {
        let request = OpenRequest::file(
            AccessIntent::READ_ATTRIBUTES | AccessIntent::WRITE_ATTRIBUTES,
            CreationDisposition::Open,
        );
        let opened = self.run_async(self.fs.open(path, request))?;
        let result = self.run_async(self.fs.set_end_of_file(&opened.handle, size));
        let finished = self.finish(&opened.handle);
        result.and(finished)
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        if let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_POSIX_LOCKS) {
            warn!("kernel does not support capabilities {:#x}", unsupported);
        }
        let mount_point = self.mount_point.clone();
        if let Err(e) = self.run_async(self.fs.mounted(&mount_point)) {
            error!("mounted hook failed: {}", e);
            return Err(e.errno());
        }
        Ok(())
    }

    fn destroy(&mut self) {
        let open: Vec<Arc<OpenHandle>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in open {
            if let Err(e) = self.finish(&handle) {
                warn!("destroy: cleanup of {:?} failed: {}", handle.path(), e);
            }
        }
        if let Err(e) = self.run_async(self.fs.unmounted()) {
            error!("unmounted hook failed: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                error!("lookup: failed to get path for parent={}, name={:?}", parent, name);
                reply.error(ENOENT);
                return;
            }
        };
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                debug!("lookup error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                error!("getattr: failed to get path for ino={}", ino);
                reply.error(ENOENT);
                return;
            }
        };
        match self.run_async(self.fs.get_attributes(&path)) {
            Ok(view) => reply.attr(&TTL, &to_file_attr(ino, &view)),
            Err(e) => {
                debug!("getattr error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("setattr: {:?}, mode={:?}, size={:?}", path, mode, size);

        let mut result = Ok(());
        if let Some(mode) = mode {
            result = self.run_async(self.fs.set_attributes(&path, mode));
        }
        if result.is_ok() && (atime.is_some() || mtime.is_some()) {
            result = self.run_async(self.fs.set_times(
                &path,
                None,
                atime.map(to_system_time),
                mtime.map(to_system_time),
            ));
        }
        if let Some(size) = size {
            if result.is_ok() {
                result = self.set_length(&path, size);
            }
        }

        match result.and_then(|_| self.run_async(self.fs.get_attributes(&path))) {
            Ok(view) => reply.attr(&TTL, &to_file_attr(ino, &view)),
            Err(e) => {
                warn!("setattr error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("mkdir: {:?}, mode={:o}", path, mode);
        let request = OpenRequest::directory(CreationDisposition::CreateNew).with_mode(mode & !umask);
        let result = self
            .run_async(self.fs.open(&path, request))
            .and_then(|opened| self.finish(&opened.handle))
            .and_then(|_| self.attr_of(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                warn!("mkdir error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let request = OpenRequest::file(access_from_flags(flags), disposition_from_flags(flags, true))
            .with_mode(mode & !umask);
        debug!("create: {:?}, {:?}", path, request);

        let opened = match self.run_async(self.fs.open(&path, request)) {
            Ok(opened) => opened,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        match self.attr_of(&path) {
            Ok(attr) => {
                let fh = self.register(opened.handle);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => {
                if let Err(cleanup) = self.finish(&opened.handle) {
                    warn!("create: cleanup of {:?} failed: {}", path, cleanup);
                }
                reply.error(e.errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let request = OpenRequest::file(access_from_flags(flags), disposition_from_flags(flags, false));
        match self.run_async(self.fs.open(&path, request)) {
            Ok(opened) => reply.opened(self.register(opened.handle), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let handle = self.handle(fh);
        let result = self.run_async(self.fs.read(&path, handle.as_deref(), size as usize, offset.max(0) as u64));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let handle = self.handle(fh);
        let paging_io = write_flags & FUSE_WRITE_CACHE != 0;
        match self.run_async(self.fs.write(&path, handle.as_deref(), data, offset, paging_io)) {
            Ok(written) => reply.written(written as u32),
            // 短写：已写入的部分照常返回，下一次写入才会得到 ENOSPC
            Err(FsError::DiskFull { written, .. }) if written > 0 => reply.written(written as u32),
            Err(e) => {
                error!("write error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.handle(fh) {
            Some(handle) => match self.run_async(self.fs.flush(&handle)) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            None => reply.ok(),
        }
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.flush(req, ino, fh, 0, reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.take_handle(fh) {
            Some(handle) => match self.finish(&handle) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            None => reply.ok(),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("unlink: {:?}", path);
        let request = OpenRequest::file(AccessIntent::DELETE, CreationDisposition::Open);
        let result = self
            .run_async(self.fs.delete_file(&path))
            .and_then(|_| self.delete_on_close(&path, request));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("unlink error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("rmdir: {:?}", path);
        match self.delete_on_close(&path, OpenRequest::directory(CreationDisposition::Open)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("rmdir error for path={:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_path, new_path) = match (
            self.inodes.child_path(parent, name),
            self.inodes.child_path(newparent, newname),
        ) {
            (Some(old), Some(new)) => (old, new),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };
        let replace = flags & libc::RENAME_NOREPLACE == 0;
        match self.run_async(self.fs.move_file(&old_path, &new_path, replace)) {
            Ok(()) => {
                self.inodes.rename(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => {
                warn!("rename error {:?} -> {:?}: {}", old_path, new_path, e);
                reply.error(e.errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.run_async(self.fs.open(&path, OpenRequest::directory(CreationDisposition::Open))) {
            Ok(opened) => reply.opened(self.register(opened.handle), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                error!("readdir: failed to get path for ino={}", ino);
                reply.error(ENOENT);
                return;
            }
        };
        debug!("readdir: {:?}, offset={}", path, offset);
        let entries = match self.run_async(self.fs.list(&path, "*")) {
            Ok(entries) => entries,
            Err(e) => {
                error!("readdir error for path={:?}: {}", path, e);
                reply.error(e.errno());
                return;
            }
        };

        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for view in entries {
            let entry_ino = self.inodes.allocate(path.join(&view.name));
            let kind = if view.is_dir { FileType::Directory } else { FileType::RegularFile };
            listing.push((entry_ino, kind, view.name));
        }

        for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        self.release(req, ino, fh, flags, None, false, reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let max_name = self.fs.volume_info().max_component_length;
        match self.run_async(self.fs.get_space()) {
            Ok(space) => reply.statfs(
                space.total / BLOCK_SIZE,
                space.total_free / BLOCK_SIZE,
                space.free_available / BLOCK_SIZE,
                0,
                0,
                BLOCK_SIZE as u32,
                max_name,
                BLOCK_SIZE as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        let handle = match self.handle(fh) {
            Some(handle) => handle,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        // `end` 为闭区间
        let length = end.saturating_sub(start).saturating_add(1);
        let result = if typ == libc::F_UNLCK {
            self.run_async(self.fs.unlock(&handle, start, length))
        } else {
            self.run_async(self.fs.lock(&handle, start, length))
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_allocation_is_stable() {
        let table = InodeTable::new();
        assert_eq!(table.path(FUSE_ROOT_ID), Some(PathBuf::from("/")));

        let a = table.allocate(PathBuf::from("/a"));
        assert_eq!(table.allocate(PathBuf::from("/a")), a);
        assert_ne!(table.allocate(PathBuf::from("/b")), a);
        assert_eq!(table.child_path(FUSE_ROOT_ID, OsStr::new("a")), Some(PathBuf::from("/a")));

        assert_eq!(table.remove(Path::new("/a")), Some(a));
        assert_eq!(table.path(a), None);
    }

    #[test]
    fn test_rename_moves_descendants() {
        let table = InodeTable::new();
        let dir = table.allocate(PathBuf::from("/docs"));
        let file = table.allocate(PathBuf::from("/docs/x.md"));
        let stale = table.allocate(PathBuf::from("/archive"));

        table.rename(Path::new("/docs"), Path::new("/archive"));
        assert_eq!(table.path(dir), Some(PathBuf::from("/archive")));
        assert_eq!(table.path(file), Some(PathBuf::from("/archive/x.md")));
        assert_eq!(table.path(stale), None);
    }

    #[test]
    fn test_invalidator_applies_events() {
        let table = Arc::new(InodeTable::new());
        let ino = table.allocate(PathBuf::from("/gone.txt"));
        let moved = table.allocate(PathBuf::from("/old.txt"));
        let sink = InodeInvalidator::new(table.clone(), PathBuf::from("/mnt/span"));

        sink.publish(ChangeEvent {
            path: PathBuf::from("/mnt/span/gone.txt"),
            kind: ChangeKind::Delete { is_dir: false },
        });
        assert_eq!(table.path(ino), None);

        sink.publish(ChangeEvent {
            path: PathBuf::from("/mnt/span/new.txt"),
            kind: ChangeKind::Rename {
                old_path: PathBuf::from("/mnt/span/old.txt"),
                is_dir: false,
                same_dir: true,
            },
        });
        assert_eq!(table.path(moved), Some(PathBuf::from("/new.txt")));
    }

    #[test]
    fn test_flag_mapping() {
        assert_eq!(access_from_flags(libc::O_RDONLY), AccessIntent::READ_DATA);
        assert_eq!(
            access_from_flags(libc::O_RDWR | libc::O_APPEND),
            AccessIntent::READ_DATA | AccessIntent::WRITE_DATA | AccessIntent::APPEND_DATA
        );

        assert_eq!(
            disposition_from_flags(libc::O_CREAT | libc::O_EXCL, true),
            CreationDisposition::CreateNew
        );
        assert_eq!(disposition_from_flags(libc::O_TRUNC, true), CreationDisposition::Create);
        assert_eq!(disposition_from_flags(0, true), CreationDisposition::OpenOrCreate);
        assert_eq!(disposition_from_flags(libc::O_TRUNC, false), CreationDisposition::Truncate);
        assert_eq!(disposition_from_flags(libc::O_WRONLY, false), CreationDisposition::Open);
    }

    #[test]
    fn test_file_attr_from_view() {
        let view = LogicalFileView {
            name: "a".to_string(),
            is_dir: false,
            mode: 0o100644,
            created: SystemTime::UNIX_EPOCH,
            accessed: SystemTime::UNIX_EPOCH,
            modified: SystemTime::UNIX_EPOCH,
            length: 1000,
        };
        let attr = to_file_attr(7, &view);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn test_finish_surfaces_cleanup_failure() {
        use crate::lifecycle::SpanningFs;
        use crate::volume::VolumePool;

        let dir = tempfile::TempDir::new().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = VolumePool::new(vec![(dir.path().to_path_buf(), None)], vec![]).unwrap();
        let adapter = FuseAdapter::with_runtime(Arc::new(SpanningFs::new(pool)), runtime.handle().clone());

        let docs = Path::new("/docs");
        let opened = adapter
            .run_async(adapter.fs.open(docs, OpenRequest::directory(CreationDisposition::CreateNew)))
            .unwrap();
        std::fs::write(dir.path().join("docs").join("keep"), b"k").unwrap();
        opened.handle.set_delete_on_close(true);

        let err = adapter.finish(&opened.handle).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);
        assert!(dir.path().join("docs").is_dir());
    }
}
