//! 变更通知桥：每个卷一个文件系统监视器，把物理路径上的事件翻译成挂载点下的逻辑路径事件。
//!
//! 只依赖 [`PathResolver`] 的反向映射，不与读写路径共享任何状态。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use ::notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use ::notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use crate::error::{FsError, Result};
use crate::fs::{ChangeEvent, ChangeKind};
use crate::resolver::PathResolver;

/// 前端的通知接口
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// 把事件转发到一个 tokio 通道
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn publish(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

/// 运行中的通知桥；drop 或 `stop` 后停止监视
pub struct NotificationBridge {
    _watchers: Vec<RecommendedWatcher>,
    shutdown_tx: oneshot::Sender<()>,
}

impl NotificationBridge {
    /// 为池中每个卷启动递归监视，并在后台任务中翻译、发布事件
    pub fn start(
        resolver: Arc<PathResolver>,
        mount_point: PathBuf,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let mut watchers = Vec::with_capacity(resolver.pool().len());

        for volume in resolver.pool().volumes() {
            let tx = event_tx.clone();
            let mut watcher = RecommendedWatcher::new(
                move |result: std::result::Result<Event, ::notify::Error>| match result {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(e) => warn!("watch error: {}", e),
                },
                ::notify::Config::default(),
            )
            .map_err(|e| FsError::Storage(format!("无法创建监视器: {}", e)))?;

            watcher
                .watch(volume.root(), RecursiveMode::Recursive)
                .map_err(|e| FsError::Storage(format!("无法监视卷 {:?}: {}", volume.root(), e)))?;
            debug!("watching volume #{} at {:?}", volume.index(), volume.root());
            watchers.push(watcher);
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = event_rx.recv() => match received {
                        Some(event) => {
                            for change in translate(&resolver, &mount_point, &event) {
                                debug!("notify: {:?}", change);
                                sink.publish(change);
                            }
                        }
                        None => break,
                    },
                }
            }
            info!("通知桥已停止");
        });

        info!("通知桥已启动，监视 {} 个卷", watchers.len());
        Ok(Self {
            _watchers: watchers,
            shutdown_tx,
        })
    }

    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// 物理路径 -> 挂载点下的逻辑路径；不属于任何卷或被忽略的名字返回 `None`
fn to_mount_path(resolver: &PathResolver, mount_point: &Path, physical: &Path) -> Option<PathBuf> {
    let (_, logical) = resolver.to_logical(physical)?;
    if let Some(leaf) = PathResolver::leaf_name(&logical) {
        if resolver.pool().is_ignored(&leaf) {
            return None;
        }
    }
    let relative = logical.strip_prefix("/").unwrap_or(&logical);
    Some(mount_point.join(relative))
}

/// 把一个底层事件翻译成零个或多个逻辑事件
pub fn translate(resolver: &PathResolver, mount_point: &Path, event: &Event) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();

    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if let [from, to] = event.paths.as_slice() {
            if let (Some(old_path), Some(path)) = (
                to_mount_path(resolver, mount_point, from),
                to_mount_path(resolver, mount_point, to),
            ) {
                changes.push(ChangeEvent {
                    kind: ChangeKind::Rename {
                        is_dir: to.is_dir(),
                        same_dir: from.parent() == to.parent(),
                        old_path,
                    },
                    path,
                });
            }
        }
        return changes;
    }

    for physical in &event.paths {
        let path = match to_mount_path(resolver, mount_point, physical) {
            Some(path) => path,
            None => continue,
        };
        let kind = match event.kind {
            EventKind::Create(kind) => ChangeKind::Create {
                is_dir: kind == CreateKind::Folder || physical.is_dir(),
            },
            EventKind::Remove(kind) => ChangeKind::Delete {
                is_dir: kind == RemoveKind::Folder,
            },
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Delete { is_dir: false },
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Create {
                is_dir: physical.is_dir(),
            },
            EventKind::Modify(ModifyKind::Name(_)) => {
                if physical.exists() {
                    ChangeKind::Create { is_dir: physical.is_dir() }
                } else {
                    ChangeKind::Delete { is_dir: false }
                }
            }
            EventKind::Modify(_) => ChangeKind::Update,
            _ => continue,
        };
        changes.push(ChangeEvent { path, kind });
    }
    changes
}
