//! File system operations abstraction for testing
//!
//! The audit log and the cleanup action touch the local disk through this
//! trait so tests can swap in `MockFileSystemOperations` (generated by
//! `mockall`) or point the real implementation at a temp directory.
//!
//! # Examples
//!
//! ```rust,no_run
//! use merge_conductor::fs::{FileSystemOperations, StandardFileSystem};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fs_ops: Arc<dyn FileSystemOperations> = Arc::new(StandardFileSystem);
//!
//!     fs_ops.create_dir_all(".merge-conductor/artifacts").await?;
//!     fs_ops.append(".merge-conductor/audit.jsonl", b"{}\n").await?;
//!
//!     if fs_ops.exists(".merge-conductor/audit.jsonl") {
//!         println!("Audit log was created");
//!     }
//!
//!     Ok(())
//! }
//! ```
use anyhow::Result;
use std::path::Path;
use tokio::io::AsyncWriteExt;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Trait for file system operations that can be mocked in tests
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait::async_trait]
pub trait FileSystemOperations: Send + Sync {
    /// Create a directory and all its parent directories
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Write data to a file, replacing any previous contents
    async fn write(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Append data to a file, creating it if it doesn't exist
    async fn append(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Check if a path exists
    fn exists(&self, path: &str) -> bool;

    /// Remove a directory and everything below it
    async fn remove_dir_all(&self, path: &str) -> Result<()>;
}

/// Standard implementation that uses actual file system operations
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardFileSystem;

#[async_trait::async_trait]
impl FileSystemOperations for StandardFileSystem {
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await.map_err(Into::into)
    }

    async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        tokio::fs::write(path, contents).await.map_err(Into::into)
    }

    async fn append(&self, path: &str, contents: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        tokio::fs::remove_dir_all(path).await.map_err(Into::into)
    }
}
