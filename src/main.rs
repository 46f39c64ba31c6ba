use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use spanfs::config::PoolConfig;
use spanfs::fuse::{FuseAdapter, InodeInvalidator};
use spanfs::lifecycle::SpanningFs;
use spanfs::lock::PoolLock;
use spanfs::notify::NotificationBridge;
use spanfs::volume::VolumePool;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "把多个目录合并为一个可跨卷追加写入的文件系统", long_about = None)]
struct Args {
    /// 挂载点路径（覆盖配置文件）
    #[arg(short, long)]
    mount: Option<PathBuf>,

    /// 卷根目录，按池顺序给出；可重复
    #[arg(short, long = "volume")]
    volumes: Vec<PathBuf>,

    /// 卷容量上限（字节），按位置对应 --volume；可重复
    #[arg(long = "capacity")]
    capacities: Vec<u64>,

    /// JSON 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 删除现有锁文件后强制启动
    #[arg(long)]
    force: bool,

    /// 不在卷根目录写入锁文件
    #[arg(long)]
    no_lock: bool,
}

const MAX_UNMOUNT_RETRIES: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PoolConfig::from_file(path)?,
        None => PoolConfig::new(),
    };
    if let Some(mount) = args.mount.clone() {
        config.mount_point = Some(mount);
    }
    config.override_volumes(&args.volumes, &args.capacities);
    config.validate()?;

    let mount_point = config
        .mount_point
        .clone()
        .ok_or_else(|| anyhow!("未指定挂载点，请使用 --mount 或在配置文件中设置 mount_point"))?;
    info!("初始化文件系统，挂载点={:?}, 卷={:?}", mount_point, config.volume_paths());

    // 确保挂载点目录存在
    if !mount_point.exists() {
        info!("创建挂载点目录: {:?}", mount_point);
        std::fs::create_dir_all(&mount_point).with_context(|| format!("创建挂载点目录失败: {:?}", mount_point))?;
    }

    let mut pool_lock = PoolLock::new(&config.volume_paths());
    if config.lock && !args.no_lock {
        if args.force {
            pool_lock.force_lock()?;
        } else {
            pool_lock.try_lock()?;
        }
    } else {
        warn!("未启用卷锁，请确保没有其他进程同时使用这些卷");
    }

    let pool = VolumePool::from_config(&config)?;
    let fs = Arc::new(SpanningFs::new(pool));
    let adapter = FuseAdapter::new(fs.clone());

    let sink = Arc::new(InodeInvalidator::new(adapter.inodes(), mount_point.clone()));
    let bridge = NotificationBridge::start(fs.resolver().clone(), mount_point.clone(), sink)?;

    // 在单独的线程中运行挂载，挂载结束（出错或被外部卸载）时通知主任务
    let (done_tx, mut done_rx) = oneshot::channel();
    let mount_point_for_mount = mount_point.clone();
    let mount_handle = std::thread::spawn(move || {
        info!("正在挂载文件系统到 {:?}", mount_point_for_mount);
        let result = adapter.mount(&mount_point_for_mount);
        let _ = done_tx.send(result);
    });

    info!("等待中断信号...");
    let mount_result = tokio::select! {
        received = signal::ctrl_c() => {
            received.context("无法监听 Ctrl+C 信号")?;
            info!("接收到中断信号，准备卸载文件系统...");
            None
        }
        finished = &mut done_rx => finished.ok(),
    };
    bridge.stop();

    match mount_result {
        Some(Ok(())) => info!("文件系统已被外部卸载"),
        Some(Err(e)) => error!("挂载文件系统失败: {}", e),
        None => {
            unmount_with_retry(&mount_point).await?;
        }
    }

    if mount_handle.join().is_err() {
        error!("挂载线程异常退出");
    }
    pool_lock.unlock()?;
    Ok(())
}

async fn unmount_with_retry(mount_point: &Path) -> Result<()> {
    for attempt in 1..=MAX_UNMOUNT_RETRIES {
        info!("尝试卸载文件系统...");
        match unmount_fuse(mount_point, false) {
            Ok(()) => {
                info!("文件系统已正常卸载");
                return Ok(());
            }
            Err(e) => error!("普通卸载失败，尝试强制卸载: {}", e),
        }
        match unmount_fuse(mount_point, true) {
            Ok(()) => {
                info!("文件系统已强制卸载");
                return Ok(());
            }
            Err(e) => error!("强制卸载也失败了: {}", e),
        }
        if attempt < MAX_UNMOUNT_RETRIES {
            info!("等待 1 秒后重试...");
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        }
    }
    Err(anyhow!("无法卸载文件系统 {:?}，请手动卸载", mount_point))
}

fn unmount_fuse(mount_point: &Path, force: bool) -> std::io::Result<()> {
    use std::process::Command;

    #[cfg(target_os = "macos")]
    let mut command = {
        let full_path = std::env::current_dir()?.join(mount_point);
        let mut command = if force {
            let mut c = Command::new("diskutil");
            c.arg("unmount").arg("force");
            c
        } else {
            Command::new("umount")
        };
        command.arg(full_path);
        command
    };

    #[cfg(not(target_os = "macos"))]
    let mut command = {
        let mut command = Command::new("fusermount");
        command.arg(if force { "-uz" } else { "-u" }).arg(mount_point);
        command
    };

    let output = command.output()?;
    if !output.status.success() {
        let error_msg = String::from_utf8_lossy(&output.stderr);
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("unmount failed: {}", error_msg),
        ));
    }
    Ok(())
}
