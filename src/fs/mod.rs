use std::path::{Path, PathBuf};
use std::time::SystemTime;
use async_trait::async_trait;
use bitflags::bitflags;
use crate::error::{Result, Status};
use crate::lifecycle::OpenHandle;

/// 某个卷上的一个物理分片
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// 所属卷在池中的位置
    pub volume: usize,
    pub path: PathBuf,
    pub length: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub mode: u32,
}

impl Fragment {
    pub fn from_metadata(volume: usize, path: PathBuf, metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            volume,
            path,
            length: metadata.len(),
            // 部分文件系统不记录创建时间
            created: metadata.created().unwrap_or(modified),
            accessed: metadata.accessed().unwrap_or(modified),
            modified,
            mode: metadata.mode(),
        }
    }
}

/// 逻辑文件视图：由各分片聚合而来，每次查询重新计算，不缓存
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalFileView {
    pub name: String,
    pub is_dir: bool,
    pub mode: u32,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub length: u64,
}

impl LogicalFileView {
    pub fn from_metadata(name: impl Into<String>, metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            name: name.into(),
            is_dir: metadata.is_dir(),
            mode: metadata.mode(),
            created: metadata.created().unwrap_or(modified),
            accessed: metadata.accessed().unwrap_or(modified),
            modified,
            length: if metadata.is_dir() { 0 } else { metadata.len() },
        }
    }

    /// 以第一个分片为种子，属性取自第一个分片
    pub fn from_fragment(name: impl Into<String>, fragment: &Fragment) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            mode: fragment.mode,
            created: fragment.created,
            accessed: fragment.accessed,
            modified: fragment.modified,
            length: fragment.length,
        }
    }

    /// 合并同名条目：创建时间取最早，访问/修改时间取最晚，长度累加
    pub fn fold(&mut self, created: SystemTime, accessed: SystemTime, modified: SystemTime, length: u64) {
        if created < self.created {
            self.created = created;
        }
        if accessed > self.accessed {
            self.accessed = accessed;
        }
        if modified > self.modified {
            self.modified = modified;
        }
        self.length += length;
    }

    pub fn fold_fragment(&mut self, fragment: &Fragment) {
        self.fold(fragment.created, fragment.accessed, fragment.modified, fragment.length);
    }
}

/// 磁盘空间统计（字节）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpace {
    pub free_available: u64,
    pub total: u64,
    pub total_free: u64,
}

impl std::ops::AddAssign for DiskSpace {
    fn add_assign(&mut self, other: Self) {
        self.free_available += other.free_available;
        self.total += other.total;
        self.total_free += other.total_free;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub label: String,
    pub filesystem_name: String,
    pub max_component_length: u32,
}

bitflags! {
    /// 打开文件时的访问意图
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessIntent: u32 {
        const READ_DATA = 1 << 0;
        const WRITE_DATA = 1 << 1;
        const APPEND_DATA = 1 << 2;
        const EXECUTE = 1 << 3;
        const READ_ATTRIBUTES = 1 << 4;
        const WRITE_ATTRIBUTES = 1 << 5;
        const DELETE = 1 << 6;
        const SYNCHRONIZE = 1 << 7;
    }
}

impl AccessIntent {
    pub fn has_data_access(self) -> bool {
        self.intersects(Self::READ_DATA | Self::WRITE_DATA | Self::APPEND_DATA | Self::EXECUTE)
    }

    pub fn writes(self) -> bool {
        self.intersects(Self::WRITE_DATA | Self::APPEND_DATA | Self::WRITE_ATTRIBUTES | Self::DELETE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationDisposition {
    Open,
    OpenOrCreate,
    Create,
    CreateNew,
    Truncate,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub access: AccessIntent,
    pub disposition: CreationDisposition,
    pub directory: bool,
    /// 新建文件时使用的权限位
    pub mode: Option<u32>,
}

impl OpenRequest {
    pub fn file(access: AccessIntent, disposition: CreationDisposition) -> Self {
        Self {
            access,
            disposition,
            directory: false,
            mode: None,
        }
    }

    pub fn directory(disposition: CreationDisposition) -> Self {
        Self {
            access: AccessIntent::READ_ATTRIBUTES,
            disposition,
            directory: true,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// `open` 的结果；目标已存在且以 Create/OpenOrCreate 打开时状态为 `AlreadyExists`
#[derive(Debug)]
pub struct Opened {
    pub handle: OpenHandle,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Create { is_dir: bool },
    Update,
    Delete { is_dir: bool },
    Rename { old_path: PathBuf, is_dir: bool, same_dir: bool },
}

/// 通知桥发布的变更事件，路径已重新挂到挂载点之下
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// 文件系统驱动前端调用的逻辑操作集合
#[async_trait]
pub trait LogicalFileSystem: Send + Sync + std::fmt::Debug {
    async fn open<'a>(&'a self, path: &'a Path, request: OpenRequest) -> Result<Opened>;
    async fn cleanup<'a>(&'a self, handle: &'a OpenHandle) -> Result<()>;
    async fn close<'a>(&'a self, handle: &'a OpenHandle);
    async fn read<'a>(&'a self, path: &'a Path, handle: Option<&'a OpenHandle>, len: usize, offset: u64) -> Result<Vec<u8>>;
    /// `offset` 为 -1 表示追加；`paging_io` 对应页缓存回写
    async fn write<'a>(
        &'a self,
        path: &'a Path,
        handle: Option<&'a OpenHandle>,
        data: &'a [u8],
        offset: i64,
        paging_io: bool,
    ) -> Result<u64>;
    async fn flush<'a>(&'a self, handle: &'a OpenHandle) -> Result<()>;
    async fn get_attributes<'a>(&'a self, path: &'a Path) -> Result<LogicalFileView>;
    async fn set_attributes<'a>(&'a self, path: &'a Path, mode: u32) -> Result<()>;
    async fn set_times<'a>(
        &'a self,
        path: &'a Path,
        created: Option<SystemTime>,
        accessed: Option<SystemTime>,
        written: Option<SystemTime>,
    ) -> Result<()>;
    async fn delete_file<'a>(&'a self, path: &'a Path) -> Result<()>;
    async fn delete_directory<'a>(&'a self, path: &'a Path) -> Result<()>;
    async fn move_file<'a>(&'a self, old_path: &'a Path, new_path: &'a Path, replace: bool) -> Result<()>;
    async fn set_end_of_file<'a>(&'a self, handle: &'a OpenHandle, length: u64) -> Result<()>;
    async fn set_allocation_size<'a>(&'a self, handle: &'a OpenHandle, length: u64) -> Result<()>;
    async fn lock<'a>(&'a self, handle: &'a OpenHandle, offset: u64, length: u64) -> Result<()>;
    async fn unlock<'a>(&'a self, handle: &'a OpenHandle, offset: u64, length: u64) -> Result<()>;
    async fn list<'a>(&'a self, directory: &'a Path, pattern: &'a str) -> Result<Vec<LogicalFileView>>;
    async fn get_space(&self) -> Result<DiskSpace>;
    fn volume_info(&self) -> VolumeInfo;
    async fn mounted<'a>(&'a self, mount_point: &'a Path) -> Result<()>;
    async fn unmounted(&self) -> Result<()>;
}
