//! 临时写入、不覆盖提交与原子替换的辅助方法。

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::debug;
use uuid::Uuid;

use crate::naming::truncate_on_char_boundary;

const STAGING_MARKER: &str = ".tmp.";
/// 暂存名中保留的原始文件名字节数上限。
pub const STAGING_NAME_MAX_BYTES: usize = 64;

/// 隐藏的暂存文件名：`.{name}.tmp.{uuid}`，`name` 截断到 64 字节。
pub fn staging_name(name: &str) -> String {
    let name = truncate_on_char_boundary(name, STAGING_NAME_MAX_BYTES);
    format!(".{name}{STAGING_MARKER}{}", Uuid::new_v4())
}

/// 判断文件名是否为暂存文件。
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(STAGING_MARKER)
}

/// 在目标目录中写入中的暂存文件。
pub struct AtomicFile {
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在 `dir` 中创建暂存文件，`name` 仅用于生成可读的临时名。
    pub async fn new(dir: &Path, name: &str) -> io::Result<Self> {
        let temp_path = dir.join(staging_name(name));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        Ok(Self { temp_path, file })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步落盘并关闭句柄，得到可提交的暂存文件。
    pub async fn finish(self) -> io::Result<StagedFile> {
        if let Err(err) = self.file.sync_all().await {
            drop(self.file);
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        drop(self.file);
        Ok(StagedFile {
            temp_path: self.temp_path,
        })
    }
}

/// 已完整写入且已同步的暂存文件，等待以最终名称提交。
#[derive(Debug)]
pub struct StagedFile {
    temp_path: PathBuf,
}

impl StagedFile {
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.temp_path
    }

    /// 以 `target` 提交，目标已存在时返回 `AlreadyExists` 且不覆盖。
    ///
    /// 优先使用硬链接（原子的“存在即失败”）。文件系统不支持硬链接时退回
    /// “检查后重命名”，此时调用方必须持有目录锁。
    pub async fn persist_noclobber(&self, target: &Path) -> io::Result<()> {
        match fs::hard_link(&self.temp_path, target).await {
            Ok(()) => {
                let _ = fs::remove_file(&self.temp_path).await;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Err(err),
            Err(err) => {
                debug!(error = %err, target = ?target, "hard link unavailable, falling back to rename");
                if fs::try_exists(target).await? {
                    return Err(io::Error::from(ErrorKind::AlreadyExists));
                }
                fs::rename(&self.temp_path, target).await?;
            }
        }

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 放弃暂存文件。
    pub async fn discard(self) {
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

/// 用 `source` 原子替换 `target`（同目录内重命名）。
pub async fn replace_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Err(err) = fs::rename(source, target).await {
        #[cfg(windows)]
        {
            if fs::remove_file(target).await.is_ok() {
                fs::rename(source, target).await?;
            } else {
                let _ = fs::remove_file(source).await;
                return Err(err);
            }
        }
        #[cfg(not(windows))]
        {
            let _ = fs::remove_file(source).await;
            return Err(err);
        }
    }

    if let Some(parent) = target.parent() {
        let _ = sync_dir(parent).await;
    }
    Ok(())
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    async fn stage(dir: &Path, bytes: &[u8]) -> StagedFile {
        let mut atomic = AtomicFile::new(dir, "photo.jpg").await.expect("create staging");
        atomic.file_mut().write_all(bytes).await.expect("write");
        atomic.finish().await.expect("finish")
    }

    #[test]
    fn staging_names_are_hidden() {
        let name = staging_name("clip.mov");
        assert!(name.starts_with(".clip.mov.tmp."));
        assert!(is_staging_name(&name));
        assert!(!is_staging_name("clip.mov"));
        assert!(!is_staging_name(".profile"));
    }

    #[tokio::test]
    async fn long_names_stage_within_name_limit() {
        let temp = tempdir().expect("tempdir");
        let long = format!("{}.jpg", "a".repeat(240));
        let name = staging_name(&long);
        assert!(name.len() < 120, "staging name is {} bytes", name.len());
        assert!(is_staging_name(&name));

        let mut atomic = AtomicFile::new(temp.path(), &long).await.expect("create staging");
        atomic.file_mut().write_all(b"jpg").await.expect("write");
        let staged = atomic.finish().await.expect("finish");
        staged
            .persist_noclobber(&temp.path().join(&long))
            .await
            .expect("persist long name");
        assert_eq!(std::fs::read(temp.path().join(&long)).expect("read"), b"jpg");
    }

    #[tokio::test]
    async fn persist_noclobber_refuses_existing_target() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("photo.jpg");
        std::fs::write(&target, b"first").expect("write existing");

        let staged = stage(temp.path(), b"second").await;
        let err = staged
            .persist_noclobber(&target)
            .await
            .expect_err("must not overwrite");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&target).expect("read"), b"first");
        assert!(staged.path().exists(), "staging file kept for retry");
        staged.discard().await;
    }

    #[tokio::test]
    async fn persist_noclobber_moves_staging_away() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("photo.jpg");
        let staged = stage(temp.path(), b"bytes").await;
        staged.persist_noclobber(&target).await.expect("persist");

        assert_eq!(std::fs::read(&target).expect("read"), b"bytes");
        assert!(!staged.path().exists());
    }

    #[tokio::test]
    async fn cleanup_removes_staging_file() {
        let temp = tempdir().expect("tempdir");
        let atomic = AtomicFile::new(temp.path(), "x.png").await.expect("create");
        let path = atomic.temp_path.clone();
        atomic.cleanup().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn replace_file_swaps_content() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("clip.mov");
        let source = temp.path().join(".clip.converted.mp4");
        std::fs::write(&target, b"old").expect("write target");
        std::fs::write(&source, b"new").expect("write source");

        replace_file(&source, &target).await.expect("replace");
        assert_eq!(std::fs::read(&target).expect("read"), b"new");
        assert!(!source.exists());
    }
}
