//! 沙箱路径解析：把用户提供的相对路径映射到 data/ 与 tmp/ 命名空间。
//!
//! 除启动时定位存储根目录外，解析过程是纯路径运算，不做任何文件系统 I/O。

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use crate::config::{DATA_DIR, STAGING_DIR};
use crate::identity::Identity;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 启动时创建并规范化存储根目录，失败视为配置错误。
    pub async fn bootstrap(configured: &Path) -> Result<Self, StorageError> {
        if configured.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath);
        }
        fs::create_dir_all(configured).await?;
        let root = fs::canonicalize(configured)
            .await
            .map_err(|_| StorageError::InvalidPath)?;
        Ok(Self::new(root))
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn data_root(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// `data/<user_id>/<nickname>`
    pub fn user_root(&self, identity: &Identity) -> Result<PathBuf, StorageError> {
        let nickname = single_segment(&identity.nickname)?;
        Ok(self
            .data_root()
            .join(identity.user_id.to_string())
            .join(nickname))
    }

    /// `tmp/<user_id>`
    pub fn user_staging_root(&self, identity: &Identity) -> PathBuf {
        self.staging_root().join(identity.user_id.to_string())
    }

    /// 解析持久存储路径；空路径指向用户根目录。
    pub fn resolve(&self, relative: &str, identity: &Identity) -> Result<PathBuf, StorageError> {
        let suffix = normalize(relative)?;
        Ok(self.user_root(identity)?.join(suffix))
    }

    /// 解析上传会话的暂存目录 `tmp/<user_id>/<file_id>`。
    pub fn resolve_staging(
        &self,
        file_id: &str,
        identity: &Identity,
    ) -> Result<PathBuf, StorageError> {
        let file_id = single_segment(file_id)?;
        Ok(self.user_staging_root(identity).join(file_id))
    }

    /// 把用户根目录下的绝对路径还原为以 `/` 分隔的相对路径。
    pub fn relative_to_user(&self, path: &Path, identity: &Identity) -> Option<String> {
        let user_root = self.user_root(identity).ok()?;
        let relative = path.strip_prefix(&user_root).ok()?;
        Some(
            relative
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/"),
        )
    }
}

/// 规范化相对路径：去掉开头分隔符与 `.`，拒绝 `..`、根与盘符前缀。
pub fn normalize(relative: &str) -> Result<PathBuf, StorageError> {
    if relative.contains('\0') {
        return Err(StorageError::InvalidPath);
    }
    let unified = relative.replace('\\', "/");
    let trimmed = unified.trim_start_matches('/');
    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    Ok(normalized)
}

/// 校验单个路径段（昵称、file_id、重命名目标）。
pub fn single_segment(value: &str) -> Result<&str, StorageError> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidPath);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn alice() -> Identity {
        Identity::new(7, "alice", Role::User)
    }

    #[test]
    fn resolve_places_paths_in_user_partition() {
        let resolver = PathResolver::new(PathBuf::from("/srv/storage"));
        let path = resolver
            .resolve("/project/readme.txt", &alice())
            .expect("resolve");
        assert_eq!(
            path,
            PathBuf::from("/srv/storage/data/7/alice/project/readme.txt")
        );

        let staging = resolver.resolve_staging("upload-1", &alice()).expect("staging");
        assert_eq!(staging, PathBuf::from("/srv/storage/tmp/7/upload-1"));
    }

    #[test]
    fn resolve_drops_current_dir_segments() {
        let resolver = PathResolver::new(PathBuf::from("/srv/storage"));
        let path = resolver.resolve("./a/./b", &alice()).expect("resolve");
        assert_eq!(path, PathBuf::from("/srv/storage/data/7/alice/a/b"));
    }

    #[test]
    fn traversal_is_rejected_without_touching_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("never-created");
        let resolver = PathResolver::new(root.clone());

        for candidate in [
            "..",
            "../secret.txt",
            "project/../../other/file",
            "..\\windows\\file",
            "a/b/../../../c",
            "with\0nul",
        ] {
            assert!(
                matches!(
                    resolver.resolve(candidate, &alice()),
                    Err(StorageError::InvalidPath)
                ),
                "{candidate:?} should be rejected"
            );
        }
        assert!(!root.exists(), "resolver must not create anything");
    }

    #[test]
    fn staging_ids_and_nicknames_must_be_single_segments() {
        let resolver = PathResolver::new(PathBuf::from("/srv/storage"));
        for file_id in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(
                resolver.resolve_staging(file_id, &alice()),
                Err(StorageError::InvalidPath)
            ));
        }

        let sneaky = Identity::new(7, "../8/bob", Role::User);
        assert!(matches!(
            resolver.resolve("file.txt", &sneaky),
            Err(StorageError::InvalidPath)
        ));
    }

    #[test]
    fn relative_to_user_round_trips_listing_paths() {
        let resolver = PathResolver::new(PathBuf::from("/srv/storage"));
        let path = resolver.resolve("docs/a.txt", &alice()).expect("resolve");
        assert_eq!(
            resolver.relative_to_user(&path, &alice()).as_deref(),
            Some("docs/a.txt")
        );
        let other = Identity::new(8, "bob", Role::User);
        assert_eq!(resolver.relative_to_user(&path, &other), None);
    }

    #[tokio::test]
    async fn bootstrap_creates_and_canonicalizes_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let configured = temp.path().join("nested").join("storage");
        let resolver = PathResolver::bootstrap(&configured)
            .await
            .expect("bootstrap");
        assert!(resolver.root_path().is_absolute());
        assert!(resolver.root_path().is_dir());
    }
}
