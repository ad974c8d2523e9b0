use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fortsync_core::{ApiErrorClass, DriveClient, DriveError, FolderId, padded_folder_name};
use thiserror::Error;

use super::task::TaskSpec;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("local root {path} is not readable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("local root {0} is not a directory")]
    RootNotDirectory(PathBuf),
}

/// A subtree that was skipped; siblings keep enumerating.
#[derive(Debug, Clone)]
pub struct MapperIssue {
    pub relative_path: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct MapperOutcome {
    pub tasks: Vec<TaskSpec>,
    pub issues: Vec<MapperIssue>,
}

/// Walks a local tree and mirrors its directories onto the remote side,
/// memoizing resolved folder ids for the lifetime of one enumeration pass.
pub struct PathMapper<'a> {
    client: &'a DriveClient,
    folders: HashMap<String, FolderId>,
}

impl<'a> PathMapper<'a> {
    pub fn new(client: &'a DriveClient) -> Self {
        Self {
            client,
            folders: HashMap::new(),
        }
    }

    /// Enumerates every regular file under `root` into a `TaskSpec` bound to
    /// its parent's remote folder. Each call performs a fresh walk. Symlinks
    /// are never followed. `cancelled` is consulted between directories so a
    /// stop issued mid-enumeration does not keep creating remote folders.
    pub async fn enumerate<F>(
        &mut self,
        root: &Path,
        destination: FolderId,
        cancelled: F,
    ) -> Result<MapperOutcome, MapperError>
    where
        F: Fn() -> bool,
    {
        let meta =
            tokio::fs::metadata(root)
                .await
                .map_err(|source| MapperError::RootUnreadable {
                    path: root.to_path_buf(),
                    source,
                })?;
        if !meta.is_dir() {
            return Err(MapperError::RootNotDirectory(root.to_path_buf()));
        }

        let mut outcome = MapperOutcome::default();
        self.folders.insert(String::new(), destination);

        // Depth-first over (absolute dir, relative path); children sorted by
        // name so task order is stable across runs.
        let mut stack = vec![(root.to_path_buf(), String::new())];
        while let Some((dir, rel)) = stack.pop() {
            if cancelled() {
                break;
            }
            let folder_id = self.folders[&rel];

            let mut entries = match read_dir_sorted(&dir).await {
                Ok(entries) => entries,
                Err(source) => {
                    if rel.is_empty() {
                        return Err(MapperError::RootUnreadable {
                            path: root.to_path_buf(),
                            source,
                        });
                    }
                    outcome.issues.push(MapperIssue {
                        relative_path: rel,
                        detail: format!("directory unreadable: {source}"),
                    });
                    continue;
                }
            };

            let mut subdirs = Vec::new();
            for (path, name, file_type) in entries {
                if file_type.is_symlink() {
                    continue;
                }
                let child_rel = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                if file_type.is_dir() {
                    match self.resolve_folder(folder_id, &name).await {
                        Ok(child_id) => {
                            self.folders.insert(child_rel.clone(), child_id);
                            subdirs.push((path, child_rel));
                        }
                        Err(err) => outcome.issues.push(MapperIssue {
                            relative_path: child_rel,
                            detail: format!("remote folder unavailable: {err}"),
                        }),
                    }
                } else if file_type.is_file() {
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) => outcome.tasks.push(TaskSpec {
                            local_path: path,
                            relative_path: child_rel,
                            remote_folder_id: folder_id,
                            size_bytes: meta.len(),
                        }),
                        Err(err) => outcome.issues.push(MapperIssue {
                            relative_path: child_rel,
                            detail: format!("file unreadable: {err}"),
                        }),
                    }
                }
                // Sockets, fifos and other specials produce nothing.
            }
            // Reversed so the stack pops subdirectories in name order.
            for entry in subdirs.into_iter().rev() {
                stack.push(entry);
            }
        }

        Ok(outcome)
    }

    /// Create-or-get: reuse an existing remote folder by name, create it
    /// otherwise, and adopt a folder another client created in between when
    /// the create comes back as a conflict.
    async fn resolve_folder(&self, parent: FolderId, name: &str) -> Result<FolderId, DriveError> {
        let wire_name = padded_folder_name(name);
        let existing = self.client.list_folders(Some(parent)).await?;
        if let Some(entry) = existing.iter().find(|entry| entry.name == wire_name) {
            return Ok(entry.id);
        }
        match self.client.create_folder(name, Some(parent)).await {
            Ok(id) => Ok(id),
            Err(err) if err.classification() == Some(ApiErrorClass::Conflict) => {
                let entries = self.client.list_folders(Some(parent)).await?;
                entries
                    .iter()
                    .find(|entry| entry.name == wire_name)
                    .map(|entry| entry.id)
                    .ok_or(err)
            }
            Err(err) => Err(err),
        }
    }
}

async fn read_dir_sorted(
    dir: &Path,
) -> std::io::Result<Vec<(PathBuf, String, std::fs::FileType)>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let file_type = entry.file_type().await?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((entry.path(), name, file_type));
    }
    entries.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(entries)
}
