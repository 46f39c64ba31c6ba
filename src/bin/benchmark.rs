use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use clap::Parser;
use spanfs::config::{PoolConfig, VolumeConfig};
use spanfs::fs::{AccessIntent, CreationDisposition, LogicalFileSystem, OpenRequest};
use spanfs::lifecycle::SpanningFs;
use spanfs::volume::VolumePool;

#[derive(Parser, Debug)]
#[command(author, version, about = "spanfs Benchmark Tool", long_about = None)]
struct Args {
    /// 卷根目录，按池顺序给出；可重复
    #[arg(short, long = "volume", required = true)]
    volumes: Vec<PathBuf>,

    /// 卷容量上限（字节），按位置对应 --volume；用于触发跨卷写入
    #[arg(long = "capacity")]
    capacities: Vec<u64>,

    /// 测试文件数量
    #[arg(short, long, default_value = "100")]
    num_files: usize,

    /// 小文件大小（字节）
    #[arg(long, default_value = "1024")]
    small_size: usize,

    /// 大文件大小（字节）
    #[arg(long, default_value = "10485760")]
    large_size: usize,

    /// 每次写入的块大小（字节）
    #[arg(long, default_value = "131072")]
    chunk_size: usize,
}

struct BenchmarkResult {
    operation: String,
    duration: Duration,
    ops_per_sec: f64,
    mb_per_sec: Option<f64>,
}

impl BenchmarkResult {
    fn new(operation: &str, duration: Duration, ops: usize, bytes: Option<usize>) -> Self {
        let ops_per_sec = ops as f64 / duration.as_secs_f64();
        let mb_per_sec = bytes.map(|b| (b as f64 / 1_048_576.0) / duration.as_secs_f64());

        Self {
            operation: operation.to_string(),
            duration,
            ops_per_sec,
            mb_per_sec,
        }
    }

    fn print(&self) {
        print!("  {:<30} {:>10.3} ms", self.operation, self.duration.as_secs_f64() * 1000.0);
        print!(" | {:>8.1} ops/s", self.ops_per_sec);
        if let Some(mb_per_sec) = self.mb_per_sec {
            print!(" | {:>8.2} MB/s", mb_per_sec);
        }
        println!();
    }
}

/// 按块追加写入整个文件
async fn write_file(fs: &dyn LogicalFileSystem, path: &Path, data: &[u8], chunk_size: usize) -> Result<()> {
    let request = OpenRequest::file(AccessIntent::WRITE_DATA, CreationDisposition::Create);
    let opened = fs.open(path, request).await?;
    for chunk in data.chunks(chunk_size.max(1)) {
        fs.write(path, Some(&opened.handle), chunk, -1, false).await?;
    }
    fs.cleanup(&opened.handle).await?;
    fs.close(&opened.handle).await;
    Ok(())
}

async fn read_file(fs: &dyn LogicalFileSystem, path: &Path, len: usize) -> Result<Vec<u8>> {
    let request = OpenRequest::file(AccessIntent::READ_DATA, CreationDisposition::Open);
    let opened = fs.open(path, request).await?;
    let data = fs.read(path, Some(&opened.handle), len, 0).await;
    fs.cleanup(&opened.handle).await?;
    fs.close(&opened.handle).await;
    Ok(data?)
}

async fn delete_file(fs: &dyn LogicalFileSystem, path: &Path) -> Result<()> {
    fs.delete_file(path).await?;
    let opened = fs
        .open(path, OpenRequest::file(AccessIntent::DELETE, CreationDisposition::Open))
        .await?;
    opened.handle.set_delete_on_close(true);
    fs.cleanup(&opened.handle).await?;
    fs.close(&opened.handle).await;
    Ok(())
}

async fn benchmark_pool(fs: &SpanningFs, args: &Args) -> Result<Vec<BenchmarkResult>> {
    let mut results = Vec::new();

    let small_data = vec![b'a'; args.small_size];
    let large_data = vec![b'b'; args.large_size];
    let small_path = |i: usize| PathBuf::from(format!("/bench_small_{}.dat", i));
    let large_path = |i: usize| PathBuf::from(format!("/bench_large_{}.dat", i));

    // 1. 小文件写入测试
    println!("\n测试小文件写入 ({} 个文件, 每个 {} 字节)...", args.num_files, args.small_size);
    let start = Instant::now();
    for i in 0..args.num_files {
        write_file(fs, &small_path(i), &small_data, args.chunk_size)
            .await
            .context("写入小文件失败")?;
    }
    results.push(BenchmarkResult::new(
        "小文件写入",
        start.elapsed(),
        args.num_files,
        Some(args.num_files * args.small_size),
    ));

    // 2. 小文件读取测试
    println!("测试小文件读取...");
    let start = Instant::now();
    for i in 0..args.num_files {
        read_file(fs, &small_path(i), args.small_size)
            .await
            .context("读取小文件失败")?;
    }
    results.push(BenchmarkResult::new(
        "小文件读取",
        start.elapsed(),
        args.num_files,
        Some(args.num_files * args.small_size),
    ));

    // 3. 大文件写入测试：卷空间不足时会跨卷
    let large_count = 10.min(args.num_files);
    println!("\n测试大文件写入 ({} 个文件, 每个 {} 字节)...", large_count, args.large_size);
    let start = Instant::now();
    let mut written = 0;
    for i in 0..large_count {
        match write_file(fs, &large_path(i), &large_data, args.chunk_size).await {
            Ok(()) => written += 1,
            Err(e) => {
                println!("大文件写入中止（卷池已满？）: {:?}", e);
                break;
            }
        }
    }
    if written > 0 {
        results.push(BenchmarkResult::new(
            "大文件写入",
            start.elapsed(),
            written,
            Some(written * args.large_size),
        ));
    }

    let mut spanned = 0;
    for i in 0..written {
        if fs.resolver().fragments(&large_path(i)).await?.len() > 1 {
            spanned += 1;
        }
    }
    println!("跨卷文件数: {}/{}", spanned, written);

    // 4. 大文件读取测试
    println!("测试大文件读取...");
    let start = Instant::now();
    for i in 0..written {
        let data = read_file(fs, &large_path(i), args.large_size)
            .await
            .context("读取大文件失败")?;
        if data.len() != args.large_size {
            println!("警告：{:?} 只读到 {} 字节", large_path(i), data.len());
        }
    }
    if written > 0 {
        results.push(BenchmarkResult::new(
            "大文件读取",
            start.elapsed(),
            written,
            Some(written * args.large_size),
        ));
    }

    // 5. 目录列表测试
    println!("\n测试目录列表...");
    let start = Instant::now();
    for _ in 0..100 {
        fs.list(Path::new("/"), "bench_*").await.context("列出目录失败")?;
    }
    results.push(BenchmarkResult::new("目录列表（100次）", start.elapsed(), 100, None));

    // 6. 元数据获取测试
    println!("测试元数据获取...");
    let start = Instant::now();
    for i in 0..args.num_files {
        fs.get_attributes(&small_path(i)).await.context("获取元数据失败")?;
    }
    results.push(BenchmarkResult::new("元数据获取", start.elapsed(), args.num_files, None));

    // 7. 文件删除测试
    println!("测试文件删除...");
    let start = Instant::now();
    let mut delete_count = 0;
    for i in 0..args.num_files {
        if delete_file(fs, &small_path(i)).await.is_ok() {
            delete_count += 1;
        }
    }
    if delete_count > 0 {
        results.push(BenchmarkResult::new("文件删除", start.elapsed(), delete_count, None));
    }

    // 清理
    for i in 0..large_count {
        let _ = delete_file(fs, &large_path(i)).await;
    }

    Ok(results)
}

fn print_results(results: &[BenchmarkResult]) {
    println!("\n📊 性能测试结果:");
    println!("  {:<30} {:>10} | {:>8} | {:>8}", "操作", "耗时", "吞吐量", "带宽");
    println!("  {}", "-".repeat(70));
    for result in results {
        result.print();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    println!("🚀 spanfs 性能基准测试");
    println!("配置：");
    for (i, volume) in args.volumes.iter().enumerate() {
        println!("  卷 #{}: {:?} 容量上限: {:?}", i, volume, args.capacities.get(i));
    }
    println!("  测试文件数: {}", args.num_files);
    println!("  小文件大小: {} 字节", args.small_size);
    println!("  大文件大小: {} 字节", args.large_size);

    let mut config = PoolConfig::new();
    for volume in &args.volumes {
        config = config.with_volume(VolumeConfig::new(volume));
    }
    config.override_volumes(&[], &args.capacities);
    config.validate()?;

    let fs = SpanningFs::new(VolumePool::from_config(&config)?);
    let results = benchmark_pool(&fs, &args).await?;
    print_results(&results);

    println!("\n✅ 基准测试完成！");
    Ok(())
}
