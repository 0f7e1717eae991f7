use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{Catalog, DbDirectory};
use crate::error::{Error, Result};

/// Creates or retrieves directories in a project.
///
/// Directory paths are project-relative, forward-slash normalized, and
/// always start with the project name.
#[derive(Debug, Clone)]
pub struct DirService {
    catalog: Catalog,
}

impl DirService {
    pub fn new(catalog: Catalog) -> Self {
        DirService { catalog }
    }

    /// Look up a directory path in a project, creating it (and any missing
    /// parents) when absent. Returns the directory in both cases.
    pub async fn create(&self, project_id: &str, path: &str) -> Result<DbDirectory> {
        let project = self
            .catalog
            .project_by_id(project_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {}", project_id)))?;

        let path = normalize_path(path);
        if !valid_dir_path(&project.name, &path) {
            return Err(Error::invalid(format!(
                "directory path {:?} does not belong to project {:?}",
                path, project.name
            )));
        }

        if let Some(dir) = self.catalog.directory_by_path(&path, project_id).await? {
            return Ok(dir);
        }

        // Create every missing level from the project root down so a
        // child never ends up pointing at an absent parent.
        let mut parent_id = String::new();
        let mut current = String::new();
        let mut dir = None;
        for segment in path.split('/') {
            if current.is_empty() {
                current = segment.to_string();
            } else {
                current = format!("{}/{}", current, segment);
            }

            let existing = self.catalog.directory_by_path(&current, project_id).await?;
            let level = match existing {
                Some(d) => d,
                None => {
                    let d = DbDirectory {
                        id: Uuid::new_v4().to_string(),
                        path: current.clone(),
                        project_id: project_id.to_string(),
                        parent_id: parent_id.clone(),
                        owner: project.owner.clone(),
                        created_at: Utc::now(),
                    };
                    debug!(path = %d.path, id = %d.id, "creating directory");
                    match self.catalog.insert_directory(&d).await {
                        Ok(()) => d,
                        // A concurrent create can win the insert; take
                        // whatever landed.
                        Err(_) => self
                            .catalog
                            .directory_by_path(&current, project_id)
                            .await?
                            .ok_or_else(|| {
                                Error::invalid(format!("could not create directory {}", current))
                            })?,
                    }
                }
            };
            parent_id = level.id.clone();
            dir = Some(level);
        }

        // The loop always runs at least once for a valid path.
        dir.ok_or_else(|| Error::invalid("empty directory path"))
    }
}

/// Normalize a directory path: forward slashes only, no `.` segments, no
/// empty segments, no trailing slash. Idempotent.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// A directory path is valid for a project when its first segment is the
/// project name and it never climbs out of the tree.
pub fn valid_dir_path(project_name: &str, path: &str) -> bool {
    if path.is_empty() || path.split('/').any(|segment| segment == "..") {
        return false;
    }
    match path.split('/').next() {
        Some(first) => first == project_name,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_converts_backslashes_and_drops_dot_segments() {
        assert_eq!(normalize_path(r"proj\a\b"), "proj/a/b");
        assert_eq!(normalize_path("proj/./a//b/"), "proj/a/b");
        assert_eq!(normalize_path("proj"), "proj");
    }

    #[test]
    fn normalize_is_idempotent() {
        for path in ["proj/./a//b/", r"proj\x\.\y", "a/b/c", ""] {
            let once = normalize_path(path);
            assert_eq!(normalize_path(&once), once);
        }
    }

    #[test]
    fn normalized_paths_contain_no_dot_segments_or_backslashes() {
        let normalized = normalize_path(r"p\.\q/./r");
        assert!(!normalized.contains('\\'));
        assert!(normalized.split('/').all(|segment| segment != "."));
    }

    #[test]
    fn paths_must_start_with_the_project_name() {
        assert!(valid_dir_path("proj", "proj"));
        assert!(valid_dir_path("proj", "proj/data/runs"));
        assert!(!valid_dir_path("proj", "other/data"));
        assert!(!valid_dir_path("proj", ""));
    }

    #[test]
    fn parent_escapes_are_rejected() {
        assert!(!valid_dir_path("proj", "proj/../other"));
        assert!(!valid_dir_path("proj", "proj/a/../../etc"));
    }
}
