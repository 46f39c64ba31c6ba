pub mod error;
pub mod fs;
pub mod volume;
pub mod resolver;
pub mod writer;
pub mod reader;
pub mod merger;
pub mod lifecycle;
pub mod notify;
pub mod fuse;
pub mod config;
pub mod lock;

pub use error::{FsError, Result, Status};
pub use fs::{LogicalFileSystem, LogicalFileView, DiskSpace, OpenRequest, AccessIntent, CreationDisposition};
pub use volume::VolumePool;
pub use resolver::PathResolver;
pub use lifecycle::{SpanningFs, OpenHandle};
pub use fuse::FuseAdapter;
pub use config::{PoolConfig, VolumeConfig};
pub use lock::PoolLock;
