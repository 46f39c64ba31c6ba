use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use crate::error::Result;
use crate::lifecycle::BoundFile;
use crate::resolver::PathResolver;

/// 按池顺序遍历分片，重组逻辑文件内容
#[derive(Debug, Clone)]
pub struct FragmentReader {
    resolver: Arc<PathResolver>,
}

impl FragmentReader {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// 读取最多 `len` 字节；到达文件末尾时返回的字节数可以小于 `len`
    pub async fn read(&self, logical: &Path, len: usize, offset: u64) -> Result<Vec<u8>> {
        let fragments = self.resolver.fragments(logical).await?;
        let mut buffer = Vec::with_capacity(len.min(1 << 20));
        let mut offset = offset;

        for fragment in &fragments {
            if buffer.len() >= len {
                break;
            }
            if offset >= fragment.length {
                offset -= fragment.length;
                continue;
            }

            let want = ((len - buffer.len()) as u64).min(fragment.length - offset);
            let mut file = File::open(&fragment.path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let got = file.take(want).read_to_end(&mut buffer).await?;

            debug!(
                "read: {:?} volume #{} offset={} -> {} bytes",
                logical, fragment.volume, offset, got
            );
            offset = 0;
        }

        Ok(buffer)
    }

    /// 在已绑定句柄上的定位读；seek 与读取在同一把锁内完成
    pub async fn read_at(&self, bound: &BoundFile, len: usize, offset: u64) -> Result<Vec<u8>> {
        let mut guard = bound.lock().await;
        let file = guard.as_mut().ok_or_else(|| bound.released())?;

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::with_capacity(len.min(1 << 20));
        file.take(len as u64).read_to_end(&mut buffer).await?;

        debug!("read_at: {:?} offset={} -> {} bytes", bound.physical(), offset, buffer.len());
        Ok(buffer)
    }
}
