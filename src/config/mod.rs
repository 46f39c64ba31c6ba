use std::collections::HashSet;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::error::{FsError, Result};
use crate::lock::LOCK_FILE_NAME;

/// 卷池中一个卷的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub path: PathBuf,
    /// 容量上限（字节）；不设置时使用卷所在文件系统的真实可用空间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
}

impl VolumeConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "._*".to_string(), // macOS 元数据文件
        LOCK_FILE_NAME.to_string(),
    ]
}

fn default_lock() -> bool {
    true
}

/// 启动配置；卷的顺序即池顺序，运行期间不可修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
    /// 是否在每个卷根目录写入锁文件
    #[serde(default = "default_lock")]
    pub lock: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mount_point: None,
            volumes: Vec::new(),
            ignore_patterns: default_ignore_patterns(),
            lock: default_lock(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FsError::Config(format!("无法读取配置文件 {:?}: {}", path, e)))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| FsError::Config(format!("配置文件格式错误: {}", e)))
    }

    pub fn with_mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }

    pub fn with_volume(mut self, volume: VolumeConfig) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// 实际生效的忽略规则：锁文件名始终在内，即使配置里给出了自己的列表
    pub fn effective_ignore_patterns(&self) -> Vec<String> {
        let mut patterns = self.ignore_patterns.clone();
        if !patterns.iter().any(|p| p == LOCK_FILE_NAME) {
            patterns.push(LOCK_FILE_NAME.to_string());
        }
        patterns
    }

    /// 命令行给出的卷整体替换配置文件中的卷；`capacities` 按位置对应
    pub fn override_volumes(&mut self, paths: &[PathBuf], capacities: &[u64]) {
        if paths.is_empty() {
            for (volume, capacity) in self.volumes.iter_mut().zip(capacities) {
                volume.capacity = Some(*capacity);
            }
            return;
        }
        self.volumes = paths
            .iter()
            .enumerate()
            .map(|(i, path)| VolumeConfig {
                path: path.clone(),
                capacity: capacities.get(i).copied(),
            })
            .collect();
    }

    /// 启动前的校验：至少一个卷，卷根必须是已存在的目录且不能重复
    pub fn validate(&self) -> Result<()> {
        if self.volumes.is_empty() {
            return Err(FsError::Config("至少需要配置一个卷".to_string()));
        }

        let mut seen = HashSet::new();
        for volume in &self.volumes {
            if !volume.path.is_dir() {
                return Err(FsError::Config(format!("卷根目录不存在或不是目录: {:?}", volume.path)));
            }
            let canonical = volume.path.canonicalize()?;
            if !seen.insert(canonical) {
                return Err(FsError::Config(format!("卷根目录重复: {:?}", volume.path)));
            }
            if let Some(mount_point) = &self.mount_point {
                if mount_point.starts_with(&volume.path) {
                    return Err(FsError::Config(format!(
                        "挂载点 {:?} 不能位于卷 {:?} 之内",
                        mount_point, volume.path
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn volume_paths(&self) -> Vec<PathBuf> {
        self.volumes.iter().map(|v| v.path.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_with_defaults() {
        let config = PoolConfig::from_json(
            r#"{
                "mount_point": "/mnt/span",
                "volumes": [{"path": "/a", "capacity": 1024}, {"path": "/b"}]
            }"#,
        )
        .unwrap();

        assert_eq!(config.mount_point, Some(PathBuf::from("/mnt/span")));
        assert_eq!(config.volumes[0], VolumeConfig::new("/a").with_capacity(1024));
        assert_eq!(config.volumes[1].capacity, None);
        assert!(config.lock);
        assert!(config.ignore_patterns.contains(&LOCK_FILE_NAME.to_string()));
    }

    #[test]
    fn test_custom_ignore_patterns_keep_lock_file() {
        let config = PoolConfig::from_json(r#"{"volumes": [{"path": "/a"}], "ignore_patterns": ["*.tmp"]}"#).unwrap();
        assert_eq!(config.ignore_patterns, vec!["*.tmp".to_string()]);
        assert_eq!(
            config.effective_ignore_patterns(),
            vec!["*.tmp".to_string(), LOCK_FILE_NAME.to_string()]
        );

        let defaults = PoolConfig::new();
        assert_eq!(defaults.effective_ignore_patterns(), defaults.ignore_patterns);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = PoolConfig::from_json("{ volumes: ").unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = PoolConfig::new()
            .with_volume(VolumeConfig::new("/a"))
            .with_volume(VolumeConfig::new("/b"));

        config.override_volumes(&[], &[10]);
        assert_eq!(config.volumes[0].capacity, Some(10));
        assert_eq!(config.volumes[1].capacity, None);

        config.override_volumes(&[PathBuf::from("/x")], &[]);
        assert_eq!(config.volume_paths(), vec![PathBuf::from("/x")]);
    }

    #[test]
    fn test_validate() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        assert!(PoolConfig::new().validate().is_err());

        let ok = PoolConfig::new()
            .with_volume(VolumeConfig::new(a.path()))
            .with_volume(VolumeConfig::new(b.path()));
        assert!(ok.validate().is_ok());

        let duplicate = ok.clone().with_volume(VolumeConfig::new(a.path()));
        assert!(duplicate.validate().is_err());

        let missing = PoolConfig::new().with_volume(VolumeConfig::new(a.path().join("nope")));
        assert!(missing.validate().is_err());

        let nested_mount = ok.with_mount_point(a.path().join("mnt"));
        assert!(nested_mount.validate().is_err());
    }
}
