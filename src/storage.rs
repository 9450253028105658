//! 用户沙箱内的目录与文件操作。所有路径先经 `PathResolver` 解析，
//! 再逐段检查，拒绝经由符号链接逃出用户目录。

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt::Display;
use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::atomic::{AtomicFile, is_temp_name};
use crate::identity::Identity;
use crate::paths::{PathResolver, StorageError, normalize, single_segment};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Storage {
    resolver: Arc<PathResolver>,
}

impl Storage {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// 解析并检查路径中不存在符号链接；`allow_missing_leaf` 允许尾部尚未创建。
    pub async fn resolve_checked(
        &self,
        identity: &Identity,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let suffix = normalize(relative)?;
        let user_root = self.resolver.user_root(identity)?;
        let mut current = user_root.clone();
        let mut components = suffix.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => break,
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(user_root.join(suffix))
    }

    /// 递归创建目录，已存在时视为成功。
    pub async fn create_dir(
        &self,
        identity: &Identity,
        relative: &str,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve_checked(identity, relative, true).await?;
        fs::create_dir_all(&target).await?;
        Ok(target)
    }

    /// 列出目录：目录在前，名称不区分大小写排序。用户根目录尚未创建时返回空列表。
    pub async fn list_dir(
        &self,
        identity: &Identity,
        relative: &str,
    ) -> Result<Vec<FileEntry>, StorageError> {
        let is_root = normalize(relative)?.as_os_str().is_empty();
        let target = self.resolve_checked(identity, relative, false).await?;
        let mut dir = match fs::read_dir(&target).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound && is_root => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_temp_name(&name) {
                continue;
            }
            let metadata = entry.metadata().await?;
            let path = self
                .resolver
                .relative_to_user(&entry.path(), identity)
                .ok_or(StorageError::InvalidPath)?;

            entries.push(FileEntry {
                name,
                path,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified: format_modified(&metadata),
            });
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    /// 同目录内改名，目标已存在时返回 `AlreadyExists`。
    pub async fn rename(
        &self,
        identity: &Identity,
        relative: &str,
        new_name: &str,
    ) -> Result<PathBuf, StorageError> {
        let new_name = single_segment(new_name)?;
        let source = self.resolve_non_root(identity, relative).await?;
        fs::symlink_metadata(&source).await?;
        let parent = source.parent().ok_or(StorageError::InvalidPath)?;
        let target = parent.join(new_name);
        if target == source {
            return Ok(target);
        }
        ensure_absent(&target).await?;
        fs::rename(&source, &target).await?;
        Ok(target)
    }

    /// 递归删除目录；用户根目录不可删除。
    pub async fn delete_dir(&self, identity: &Identity, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_non_root(identity, relative).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(io::Error::from(ErrorKind::NotADirectory).into());
        }
        fs::remove_dir_all(&target).await?;
        Ok(())
    }

    pub async fn delete_file(
        &self,
        identity: &Identity,
        relative: &str,
    ) -> Result<(), StorageError> {
        let target = self.resolve_non_root(identity, relative).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            return Err(io::Error::from(ErrorKind::IsADirectory).into());
        }
        fs::remove_file(&target).await?;
        Ok(())
    }

    /// 在用户沙箱内移动文件或目录，不覆盖已有目标。
    pub async fn move_entry(
        &self,
        identity: &Identity,
        from: &str,
        to: &str,
    ) -> Result<PathBuf, StorageError> {
        let source = self.resolve_non_root(identity, from).await?;
        let target = self.resolve_non_root_missing(identity, to).await?;
        fs::symlink_metadata(&source).await?;
        if target.starts_with(&source) {
            return Err(StorageError::InvalidPath);
        }
        ensure_absent(&target).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        Ok(target)
    }

    /// 非分片直接写入：流式写入临时文件后原子替换目标。
    pub async fn write_file<S, E>(
        &self,
        identity: &Identity,
        relative: &str,
        mut body: S,
    ) -> Result<PathBuf, StorageError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let target = self.resolve_non_root_missing(identity, relative).await?;
        if fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            return Err(io::Error::from(ErrorKind::IsADirectory).into());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let written: io::Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| io::Error::other(err.to_string()))?;
                if !chunk.is_empty() {
                    atomic.file_mut().write_all(&chunk).await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(err) = written {
            atomic.cleanup().await;
            return Err(err.into());
        }
        atomic.finalize().await?;
        Ok(target)
    }

    /// 打开待下载的文件，目录返回 `IsADirectory`。
    pub async fn open_file(
        &self,
        identity: &Identity,
        relative: &str,
    ) -> Result<(File, Metadata), StorageError> {
        let target = self.resolve_non_root(identity, relative).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            return Err(io::Error::from(ErrorKind::IsADirectory).into());
        }
        let file = File::open(&target).await?;
        Ok((file, metadata))
    }

    async fn resolve_non_root(
        &self,
        identity: &Identity,
        relative: &str,
    ) -> Result<PathBuf, StorageError> {
        if normalize(relative)?.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath);
        }
        self.resolve_checked(identity, relative, false).await
    }

    async fn resolve_non_root_missing(
        &self,
        identity: &Identity,
        relative: &str,
    ) -> Result<PathBuf, StorageError> {
        if normalize(relative)?.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath);
        }
        self.resolve_checked(identity, relative, true).await
    }
}

async fn ensure_absent(target: &Path) -> Result<(), StorageError> {
    match fs::symlink_metadata(target).await {
        Ok(_) => Err(io::Error::from(ErrorKind::AlreadyExists).into()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn format_modified(metadata: &Metadata) -> Option<String> {
    let modified = metadata.modified().ok()?;
    let datetime: DateTime<Utc> = modified.into();
    Some(datetime.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use futures_util::stream;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, Storage::new(Arc::new(PathResolver::new(root))))
    }

    fn alice() -> Identity {
        Identity::new(1, "alice", Role::User)
    }

    fn body(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn listing_missing_user_root_is_empty() {
        let (_temp, storage) = make_storage();
        let entries = storage.list_dir(&alice(), "").await.expect("list");
        assert!(entries.is_empty());

        let missing = storage.list_dir(&alice(), "nope").await;
        assert!(matches!(missing, Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn list_orders_directories_first_then_by_name() {
        let (_temp, storage) = make_storage();
        let identity = alice();
        storage.create_dir(&identity, "docs/zeta").await.expect("mkdir");
        storage.create_dir(&identity, "docs/Alpha").await.expect("mkdir");
        storage
            .write_file(&identity, "docs/b.txt", body(&["bb"]))
            .await
            .expect("write");
        storage
            .write_file(&identity, "docs/A.txt", body(&["a"]))
            .await
            .expect("write");

        let entries = storage.list_dir(&identity, "/docs").await.expect("list");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "zeta", "A.txt", "b.txt"]);
        assert_eq!(entries[3].path, "docs/b.txt");
        assert_eq!(entries[3].size, 2);
        assert!(entries[0].is_dir);
    }

    #[tokio::test]
    async fn create_dir_is_idempotent() {
        let (_temp, storage) = make_storage();
        let first = storage.create_dir(&alice(), "a/b/c").await.expect("mkdir");
        let second = storage.create_dir(&alice(), "a/b/c").await.expect("again");
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[tokio::test]
    async fn rename_stays_in_parent_and_refuses_overwrite() {
        let (_temp, storage) = make_storage();
        let identity = alice();
        storage.create_dir(&identity, "p/old").await.expect("mkdir");
        storage.create_dir(&identity, "p/taken").await.expect("mkdir");

        let renamed = storage.rename(&identity, "p/old", "new").await.expect("rename");
        assert!(renamed.ends_with("p/new"));
        assert!(renamed.is_dir());

        let clash = storage.rename(&identity, "p/new", "taken").await;
        assert!(
            matches!(clash, Err(StorageError::Io(err)) if err.kind() == ErrorKind::AlreadyExists)
        );
        for bad in ["../x", "a/b", ""] {
            assert!(matches!(
                storage.rename(&identity, "p/new", bad).await,
                Err(StorageError::InvalidPath)
            ));
        }
        assert!(matches!(
            storage.rename(&identity, "/", "other").await,
            Err(StorageError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn delete_dir_refuses_root_and_files() {
        let (_temp, storage) = make_storage();
        let identity = alice();
        storage.create_dir(&identity, "gone/inner").await.expect("mkdir");
        storage
            .write_file(&identity, "f.txt", body(&["x"]))
            .await
            .expect("write");

        assert!(matches!(
            storage.delete_dir(&identity, "").await,
            Err(StorageError::InvalidPath)
        ));
        assert!(matches!(
            storage.delete_dir(&identity, "f.txt").await,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotADirectory
        ));
        storage.delete_dir(&identity, "gone").await.expect("delete");
        assert!(matches!(
            storage.delete_dir(&identity, "gone").await,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound
        ));
    }

    #[tokio::test]
    async fn write_then_open_then_delete_file() {
        let (_temp, storage) = make_storage();
        let identity = alice();
        let target = storage
            .write_file(&identity, "deep/new/file.bin", body(&["he", "llo"]))
            .await
            .expect("write");
        assert_eq!(std::fs::read(&target).expect("read"), b"hello");

        let (_file, metadata) = storage
            .open_file(&identity, "deep/new/file.bin")
            .await
            .expect("open");
        assert_eq!(metadata.len(), 5);
        assert!(matches!(
            storage.open_file(&identity, "deep").await,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::IsADirectory
        ));

        storage
            .delete_file(&identity, "deep/new/file.bin")
            .await
            .expect("delete");
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn failed_body_leaves_previous_content() {
        let (_temp, storage) = make_storage();
        let identity = alice();
        let target = storage
            .write_file(&identity, "keep.txt", body(&["original"]))
            .await
            .expect("write");

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("connection reset")),
        ]);
        let result = storage.write_file(&identity, "keep.txt", broken).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read(&target).expect("read"), b"original");
        let leftovers = std::fs::read_dir(target.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn move_entry_stays_in_sandbox() {
        let (_temp, storage) = make_storage();
        let identity = alice();
        storage
            .write_file(&identity, "a.txt", body(&["a"]))
            .await
            .expect("write");
        storage.create_dir(&identity, "dir").await.expect("mkdir");

        let moved = storage
            .move_entry(&identity, "a.txt", "archive/2024/a.txt")
            .await
            .expect("move");
        assert_eq!(std::fs::read(&moved).expect("read"), b"a");

        assert!(matches!(
            storage.move_entry(&identity, "dir", "dir/inside").await,
            Err(StorageError::InvalidPath)
        ));
        assert!(matches!(
            storage.move_entry(&identity, "dir", "../../8/bob/dir").await,
            Err(StorageError::InvalidPath)
        ));
        assert!(matches!(
            storage.move_entry(&identity, "dir", "archive/2024/a.txt").await,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::AlreadyExists
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_rejected() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage();
        let identity = alice();
        let user_root = storage.create_dir(&identity, "").await.expect("root");
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("outside");
        std::fs::write(outside.join("secret.txt"), b"secret").expect("secret");
        symlink(&outside, user_root.join("link")).expect("symlink");

        assert!(matches!(
            storage.open_file(&identity, "link/secret.txt").await,
            Err(StorageError::InvalidPath)
        ));
        assert!(matches!(
            storage.list_dir(&identity, "link").await,
            Err(StorageError::InvalidPath)
        ));
    }
}
