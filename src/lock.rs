use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// 每个卷根目录下的锁文件名；该名字默认对逻辑视图隐藏
pub const LOCK_FILE_NAME: &str = ".spanfs.lock";

/// 超过这个时长的锁视为异常残留
const STALE_AFTER_HOURS: i64 = 24;

/// 锁文件信息
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    /// 进程 ID
    pid: u32,
    /// 主机名
    hostname: String,
    /// 锁创建时间
    created_at: DateTime<Utc>,
    /// 程序版本
    version: String,
}

/// 卷池独占锁：每个卷根目录一个锁文件，防止两个进程同时挂载同一组卷
#[derive(Debug)]
pub struct PoolLock {
    lock_files: Vec<PathBuf>,
    /// 本进程已经创建的锁文件
    acquired: Vec<PathBuf>,
    locked: bool,
}

impl PoolLock {
    pub fn new(volume_roots: &[PathBuf]) -> Self {
        Self {
            lock_files: volume_roots.iter().map(|root| root.join(LOCK_FILE_NAME)).collect(),
            acquired: Vec::new(),
            locked: false,
        }
    }

    pub fn lock_files(&self) -> &[PathBuf] {
        &self.lock_files
    }

    /// 尝试获取所有卷上的锁；任何一个失败都会撤销已创建的锁文件
    pub fn try_lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }

        for lock_file in self.lock_files.clone() {
            if let Err(e) = self.acquire_one(&lock_file) {
                self.release_acquired();
                return Err(e);
            }
        }

        self.locked = true;
        Ok(())
    }

    fn acquire_one(&mut self, lock_file: &Path) -> Result<()> {
        check_and_clean_stale_lock(lock_file)?;

        match OpenOptions::new().write(true).create_new(true).open(lock_file) {
            Ok(mut file) => {
                let lock_info = LockInfo {
                    pid: process::id(),
                    hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
                    created_at: Utc::now(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                let json = serde_json::to_string_pretty(&lock_info)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;

                self.acquired.push(lock_file.to_path_buf());
                info!("成功获取卷锁: {:?}", lock_file);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match read_lock_info(lock_file) {
                Ok(info) => Err(anyhow!(
                    "卷已被锁定！\n\
                    锁定进程: PID {} @ {}\n\
                    锁定时间: {} 秒前\n\
                    锁文件: {:?}\n\
                    \n\
                    如果确定该进程已经退出，可以手动删除锁文件或使用 --force 参数强制启动",
                    info.pid,
                    info.hostname,
                    (Utc::now() - info.created_at).num_seconds(),
                    lock_file
                )),
                Err(_) => Err(anyhow!("卷已被锁定，但无法读取锁信息: {:?}", lock_file)),
            },
            Err(e) => Err(anyhow!("创建锁文件失败 {:?}: {}", lock_file, e)),
        }
    }

    /// 强制获取锁（删除现有锁文件）
    pub fn force_lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }

        for lock_file in &self.lock_files {
            if lock_file.exists() {
                warn!("强制删除现有锁文件: {:?}", lock_file);
                std::fs::remove_file(lock_file)?;
            }
        }

        self.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// 释放锁；只删除属于当前进程的锁文件
    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }

        for lock_file in &self.acquired {
            if !lock_file.exists() {
                continue;
            }
            match read_lock_info(lock_file) {
                Ok(info) if info.pid == process::id() => {
                    std::fs::remove_file(lock_file)?;
                    info!("已释放卷锁: {:?}", lock_file);
                }
                _ => warn!("锁文件不属于当前进程，跳过: {:?}", lock_file),
            }
        }

        self.acquired.clear();
        self.locked = false;
        Ok(())
    }

    fn release_acquired(&mut self) {
        for lock_file in self.acquired.drain(..) {
            if let Err(e) = std::fs::remove_file(&lock_file) {
                warn!("撤销锁文件失败 {:?}: {}", lock_file, e);
            }
        }
    }
}

impl Drop for PoolLock {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.unlock() {
                error!("释放卷锁失败: {}", e);
            }
        }
    }
}

/// 进程已退出、超过时限或内容损坏的锁文件直接清理
fn check_and_clean_stale_lock(lock_file: &Path) -> Result<()> {
    if !lock_file.exists() {
        return Ok(());
    }

    match read_lock_info(lock_file) {
        Ok(info) => {
            if !is_process_running(info.pid) {
                warn!("检测到过期锁文件（进程 {} 已退出），正在清理...", info.pid);
                std::fs::remove_file(lock_file)?;
                return Ok(());
            }

            if Utc::now() - info.created_at > Duration::hours(STALE_AFTER_HOURS) {
                warn!("检测到超过{}小时的锁文件，可能是异常情况，正在清理...", STALE_AFTER_HOURS);
                std::fs::remove_file(lock_file)?;
            }
        }
        Err(e) => {
            warn!("无法读取锁文件信息，可能已损坏: {:?}", e);
            std::fs::remove_file(lock_file)?;
        }
    }
    Ok(())
}

fn read_lock_info(lock_file: &Path) -> Result<LockInfo> {
    let mut file = File::open(lock_file)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let info: LockInfo = serde_json::from_str(&contents)?;
    Ok(info)
}

/// 发送信号 0 检查进程是否存在
fn is_process_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
