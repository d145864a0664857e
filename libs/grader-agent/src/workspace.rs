// Per-job working directory: tmp/<id>/{task,sockets}, task/student writable
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const STUDENT_DIR: &str = "student";

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    pub root: PathBuf,
    /// Copy of the task files, mounted at `/task`
    pub task: PathBuf,
    /// Control channel sockets, mounted at `/sockets`
    pub sockets: PathBuf,
    /// Files produced by the sandboxed program, shared with sub-containers
    pub student: PathBuf,
}

#[cfg(unix)]
fn open_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn open_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)
                .with_context(|| format!("Failed to create {}", destination.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &destination)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

impl JobWorkspace {
    /// Build a fresh workspace, purging any stale directory with the same id
    pub fn prepare(tmp_dir: &Path, internal_id: u64, task_source: &Path) -> Result<Self> {
        fs::create_dir_all(tmp_dir)
            .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;
        let root = tmp_dir.join(internal_id.to_string());
        if root.exists() {
            fs::remove_dir_all(&root)
                .with_context(|| format!("Failed to purge stale {}", root.display()))?;
        }
        fs::create_dir(&root).with_context(|| format!("Failed to create {}", root.display()))?;
        // Bind mounts and socket paths need the resolved absolute path
        let root = fs::canonicalize(&root)?;

        let task = root.join("task");
        let sockets = root.join("sockets");
        let student = task.join(STUDENT_DIR);

        copy_tree(task_source, &task)?;
        fs::create_dir(&sockets)?;
        if !student.exists() {
            fs::create_dir(&student)?;
        }
        for dir in [&root, &task, &sockets, &student] {
            open_permissions(dir)?;
        }

        Ok(Self {
            root,
            task,
            sockets,
            student,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task_source() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("task.json"), "{}").unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib").join("helper.py"), "pass").unwrap();
        dir
    }

    #[test]
    fn test_prepare_layout() {
        let source = task_source();
        let tmp = TempDir::new().unwrap();

        let workspace = JobWorkspace::prepare(tmp.path(), 7, source.path()).unwrap();
        assert!(workspace.root.ends_with("7"));
        assert!(workspace.task.join("task.json").is_file());
        assert!(workspace.task.join("lib/helper.py").is_file());
        assert!(workspace.student.is_dir());
        assert!(workspace.sockets.is_dir());
        assert!(workspace.root.is_absolute());
    }

    #[test]
    fn test_stale_directory_is_purged() {
        let source = task_source();
        let tmp = TempDir::new().unwrap();
        let stale = tmp.path().join("3").join("task");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("leftover"), "old run").unwrap();

        let workspace = JobWorkspace::prepare(tmp.path(), 3, source.path()).unwrap();
        assert!(!workspace.task.join("leftover").exists());
        assert!(workspace.task.join("task.json").exists());
    }
}
