use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// 没有任何卷包含该名字
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    /// 中间路径不存在
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("File exists: {0}")]
    FileExists(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// 跨卷写入耗尽了所有卷，`written` 为已经落盘的字节数
    #[error("Disk full: {path} ({written} bytes written)")]
    DiskFull { path: String, written: u64 },

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// 前端（文件系统驱动）看到的状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    NotFound,
    FileNotFound,
    PathNotFound,
    AlreadyExists,
    FileExists,
    AccessDenied,
    NotADirectory,
    DiskFull,
    DirectoryNotEmpty,
    SharingViolation,
    NotImplemented,
    Error,
}

impl Status {
    /// 转换为 POSIX errno，供 FUSE 前端回复使用
    pub fn errno(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::NotFound | Status::FileNotFound | Status::PathNotFound => libc::ENOENT,
            Status::AlreadyExists | Status::FileExists => libc::EEXIST,
            Status::AccessDenied => libc::EACCES,
            Status::NotADirectory => libc::ENOTDIR,
            Status::DiskFull => libc::ENOSPC,
            Status::DirectoryNotEmpty => libc::ENOTEMPTY,
            Status::SharingViolation => libc::EBUSY,
            Status::NotImplemented => libc::ENOSYS,
            Status::Error => libc::EIO,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound(path.into())
    }

    pub fn access_denied(path: impl Into<String>) -> Self {
        Self::AccessDenied(path.into())
    }

    /// 映射到前端状态码；无法识别的 IO 错误保持为 `Status::Error`
    pub fn status(&self) -> Status {
        match self {
            FsError::Io(e) => io_status(e),
            FsError::NotFound(_) => Status::NotFound,
            FsError::FileNotFound(_) => Status::FileNotFound,
            FsError::PathNotFound(_) => Status::PathNotFound,
            FsError::FileExists(_) => Status::FileExists,
            FsError::AccessDenied(_) => Status::AccessDenied,
            FsError::NotADirectory(_) => Status::NotADirectory,
            FsError::DiskFull { .. } => Status::DiskFull,
            FsError::DirectoryNotEmpty(_) => Status::DirectoryNotEmpty,
            FsError::NotImplemented(_) => Status::NotImplemented,
            FsError::Storage(_) | FsError::InvalidOperation(_) | FsError::Config(_) => Status::Error,
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            // 未映射的系统错误原样透传 errno
            FsError::Io(e) if self.status() == Status::Error => e.raw_os_error().unwrap_or(libc::EIO),
            _ => self.status().errno(),
        }
    }
}

fn io_status(e: &io::Error) -> Status {
    if let Some(code) = e.raw_os_error() {
        match code {
            libc::ENOENT => return Status::FileNotFound,
            libc::EACCES | libc::EPERM => return Status::AccessDenied,
            libc::EEXIST => return Status::FileExists,
            libc::ENOSPC | libc::EDQUOT => return Status::DiskFull,
            libc::ENOTDIR => return Status::NotADirectory,
            libc::ENOTEMPTY => return Status::DirectoryNotEmpty,
            libc::EBUSY | libc::ETXTBSY => return Status::SharingViolation,
            _ => {}
        }
    }
    match e.kind() {
        io::ErrorKind::NotFound => Status::FileNotFound,
        io::ErrorKind::PermissionDenied => Status::AccessDenied,
        io::ErrorKind::AlreadyExists => Status::FileExists,
        _ => Status::Error,
    }
}
