use std::path::PathBuf;
use std::time::SystemTime;
use anyhow::Result;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use spanfs::config::PoolConfig;
use spanfs::fs::LogicalFileSystem;
use spanfs::lifecycle::SpanningFs;
use spanfs::volume::VolumePool;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "在不挂载的情况下查看卷池", long_about = None)]
struct Args {
    /// 卷根目录，按池顺序给出；可重复
    #[arg(short, long = "volume", global = true)]
    volumes: Vec<PathBuf>,

    /// 卷容量上限（字节），按位置对应 --volume
    #[arg(long = "capacity", global = true)]
    capacities: Vec<u64>,

    /// JSON 配置文件
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 每个卷及整个池的空间
    Space,
    /// 列出逻辑文件在各卷上的分片
    Fragments {
        /// 逻辑路径，例如 /movie.mkv
        path: PathBuf,
    },
    /// 合并后的目录列表
    List {
        #[arg(default_value = "/")]
        directory: PathBuf,
        /// 通配符，支持 * 和 ?
        #[arg(short, long, default_value = "*")]
        pattern: String,
    },
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PoolConfig::from_file(path)?,
        None => PoolConfig::new(),
    };
    config.override_volumes(&args.volumes, &args.capacities);
    config.validate()?;

    let fs = SpanningFs::new(VolumePool::from_config(&config)?);

    match args.command {
        Command::Space => {
            println!("{:<4} {:<40} {:>12} {:>12}", "#", "卷", "可用", "总量");
            for volume in fs.pool().volumes() {
                let space = fs.pool().volume_space(volume).await?;
                println!(
                    "{:<4} {:<40} {:>12} {:>12}",
                    volume.index(),
                    volume.root().display(),
                    format_size(space.space.free_available),
                    format_size(space.space.total),
                );
            }
            let pooled = fs.get_space().await?;
            println!(
                "卷池合计: 可用 {}, 空闲 {}, 总量 {}",
                format_size(pooled.free_available),
                format_size(pooled.total_free),
                format_size(pooled.total)
            );
        }
        Command::Fragments { path } => {
            let fragments = fs.resolver().fragments(&path).await?;
            if fragments.is_empty() {
                println!("{:?}: 没有分片", path);
            }
            let mut offset = 0u64;
            for fragment in &fragments {
                println!(
                    "卷 #{} [{}..{}) {:>12}  修改于 {}  {}",
                    fragment.volume,
                    offset,
                    offset + fragment.length,
                    format_size(fragment.length),
                    format_time(fragment.modified),
                    fragment.path.display()
                );
                offset += fragment.length;
            }
            if fragments.len() > 1 {
                println!("逻辑长度: {} 字节, {} 个分片", offset, fragments.len());
            }
        }
        Command::List { directory, pattern } => {
            for view in fs.list(&directory, &pattern).await? {
                println!(
                    "{} {:>12}  {}  {}",
                    if view.is_dir { "d" } else { "-" },
                    format_size(view.length),
                    format_time(view.modified),
                    view.name
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.00 MB");
    }
}
