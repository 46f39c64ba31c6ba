use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use crate::error::{FsError, Result};

/// 绑定到单个物理文件的原生句柄。
///
/// 定位读写必须持有锁完成 seek + IO，避免同一句柄上的并发请求看到被撕裂的位置。
#[derive(Debug)]
pub struct BoundFile {
    physical: PathBuf,
    file: Mutex<Option<File>>,
}

impl BoundFile {
    pub(crate) fn new(physical: PathBuf, file: File) -> Self {
        Self {
            physical,
            file: Mutex::new(Some(file)),
        }
    }

    pub fn physical(&self) -> &Path {
        &self.physical
    }

    pub async fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().await
    }

    pub(crate) fn released(&self) -> FsError {
        FsError::InvalidOperation(format!("handle already released: {:?}", self.physical))
    }

    /// 先 flush 再释放；重复调用无副作用
    pub async fn release(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            debug!("release: flushing {:?}", self.physical);
            file.flush().await?;
        }
        Ok(())
    }
}

/// 调用方会话持有的打开句柄。
///
/// 目录与跨卷读写的文件不绑定物理句柄，每次调用重新解析；
/// 只做元数据操作的文件绑定到第一个匹配卷上的物理文件。
#[derive(Debug)]
pub struct OpenHandle {
    id: u64,
    path: PathBuf,
    is_directory: bool,
    delete_on_close: AtomicBool,
    bound: Option<BoundFile>,
}

impl OpenHandle {
    pub(crate) fn new(id: u64, path: PathBuf, is_directory: bool, bound: Option<BoundFile>) -> Self {
        Self {
            id,
            path,
            is_directory,
            delete_on_close: AtomicBool::new(false),
            bound,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn bound(&self) -> Option<&BoundFile> {
        self.bound.as_ref()
    }

    pub fn set_delete_on_close(&self, delete: bool) {
        self.delete_on_close.store(delete, Ordering::SeqCst);
    }

    pub fn delete_on_close(&self) -> bool {
        self.delete_on_close.load(Ordering::SeqCst)
    }

    pub(crate) async fn release(&self) -> Result<()> {
        match &self.bound {
            Some(bound) => bound.release().await,
            None => Ok(()),
        }
    }
}
