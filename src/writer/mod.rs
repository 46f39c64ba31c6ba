use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use crate::error::{FsError, Result, Status};
use crate::lifecycle::BoundFile;
use crate::resolver::PathResolver;

/// 一次跨卷写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanWrite {
    pub bytes_written: u64,
    /// 所有卷都已写满但仍有剩余字节
    pub exhausted: bool,
}

impl SpanWrite {
    pub fn status(&self) -> Status {
        if self.exhausted {
            Status::DiskFull
        } else {
            Status::Success
        }
    }

    /// 短写转换为携带已写字节数的 `DiskFull`
    pub fn into_result(self, logical: &Path) -> Result<u64> {
        if self.exhausted {
            Err(FsError::DiskFull {
                path: logical.to_string_lossy().into_owned(),
                written: self.bytes_written,
            })
        } else {
            Ok(self.bytes_written)
        }
    }
}

/// 分页 IO 不允许越过当前文件末尾
pub fn bytes_to_copy(buffer_len: usize, offset: u64, file_len: u64, paging_io: bool) -> usize {
    if !paging_io {
        return buffer_len;
    }
    let distance_to_end = file_len.saturating_sub(offset);
    if distance_to_end < buffer_len as u64 {
        distance_to_end as usize
    } else {
        buffer_len
    }
}

/// 按剩余空间把写入分布到各卷
#[derive(Debug, Clone)]
pub struct SpanningWriter {
    resolver: Arc<PathResolver>,
}

impl SpanningWriter {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// 追加式跨卷写入，`requested_offset` 被忽略。
    ///
    /// 空间快照在调用开始时取一次，调用内部不再刷新；快照为 0 的卷被跳过。
    /// 已写入的分片在 `DiskFull` 时不回滚。
    pub async fn write(&self, logical: &Path, data: &[u8], requested_offset: i64) -> Result<SpanWrite> {
        let targets = self.resolver.write_targets(logical).await?;
        let free_space = self.resolver.pool().free_space_snapshot().await?;

        debug!(
            "write: {:?}, size={}, requested_offset={}, free={:?}",
            logical,
            data.len(),
            requested_offset,
            free_space
        );

        if data.is_empty() {
            return Ok(SpanWrite { bytes_written: 0, exhausted: false });
        }

        let mut written = 0usize;
        for target in &targets {
            let free = free_space[target.volume];
            if free == 0 {
                debug!("write: volume #{} is full, skipping", target.volume);
                continue;
            }

            let remaining = data.len() - written;
            let chunk = (remaining as u64).min(free) as usize;

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target.path)
                .await?;
            file.write_all(&data[written..written + chunk]).await?;
            file.flush().await?;

            debug!("write: volume #{} <- {} bytes ({:?})", target.volume, chunk, target.path);
            written += chunk;

            if written == data.len() {
                return Ok(SpanWrite {
                    bytes_written: written as u64,
                    exhausted: false,
                });
            }
        }

        warn!(
            "write: pool exhausted for {:?}, wrote {} of {} bytes",
            logical,
            written,
            data.len()
        );
        Ok(SpanWrite {
            bytes_written: written as u64,
            exhausted: true,
        })
    }

    /// 对已绑定句柄的原位写入；`offset` 为 -1 时追加到末尾
    pub async fn write_at(&self, bound: &BoundFile, data: &[u8], offset: i64, paging_io: bool) -> Result<u64> {
        let mut guard = bound.lock().await;
        let file = guard.as_mut().ok_or_else(|| bound.released())?;

        let position = if offset < 0 {
            file.seek(SeekFrom::End(0)).await?
        } else {
            file.seek(SeekFrom::Start(offset as u64)).await?
        };

        let file_len = file.metadata().await?.len();
        let count = bytes_to_copy(data.len(), position, file_len, paging_io);
        file.write_all(&data[..count]).await?;
        file.flush().await?;

        debug!("write_at: {:?} offset={} -> {} bytes", bound.physical(), position, count);
        Ok(count as u64)
    }
}
