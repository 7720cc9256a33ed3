use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid record id {id:?}")]
    InvalidId { id: String },
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// File-backed store for credential blobs: one file per record under the
/// auth directory, file name equal to the record id.
///
/// Writes go through a temp file plus rename so a concurrent reader never
/// observes a torn blob, and a failed write never clobbers the previous one.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                op: "create auth dir",
                path: self.dir.clone(),
                source,
            })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|source| StoreError::Io {
                    op: "chmod auth dir",
                    path: self.dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub async fn read(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                op: "read",
                path,
                source,
            }),
        }
    }

    pub async fn write(&self, id: &str, blob: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        self.ensure_dir().await?;

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let temp = self
            .dir
            .join(format!(".{id}.{}-{nanos}.tmp", std::process::id()));
        tokio::fs::write(&temp, blob)
            .await
            .map_err(|source| StoreError::Io {
                op: "write temp",
                path: temp.clone(),
                source,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|source| StoreError::Io {
                    op: "chmod temp",
                    path: temp.clone(),
                    source,
                })?;
        }

        if let Err(source) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::Io {
                op: "rename",
                path,
                source,
            });
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                op: "delete",
                path,
                source,
            }),
        }
    }

    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    op: "list",
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            op: "list",
            path: self.dir.clone(),
            source,
        })? {
            let Ok(kind) = entry.file_type().await else {
                continue;
            };
            if !kind.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            ids.push(name.to_string());
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty()
            || id.starts_with('.')
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
        {
            return Err(StoreError::InvalidId { id: id.to_string() });
        }
        Ok(self.dir.join(id))
    }
}
