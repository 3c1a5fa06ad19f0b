use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Base name of the source file written into every working directory
pub const ENTRY_STEM: &str = "main";

/// Sibling file holding the request's stdin
pub const STDIN_FILE: &str = "input.txt";

/// Ephemeral per-request directory under the temp root.
///
/// Owned by exactly one execution and removed when dropped, on every exit path.
#[derive(Debug)]
pub struct WorkingDirectory {
    path: PathBuf,
}

impl WorkingDirectory {
    /// Create `<temp_root>/<execution_id>`; fails if it already exists
    pub fn create(temp_root: &Path, execution_id: &str) -> io::Result<Self> {
        if execution_id.is_empty()
            || !execution_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid execution id {:?}", execution_id),
            ));
        }

        fs::create_dir_all(temp_root)?;
        let path = temp_root.join(execution_id);
        fs::create_dir(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // Readable by the unprivileged container user, writable by nobody else
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }

        debug!("Created working directory {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry filename for the given extension, e.g. `main.py`
    pub fn entry_filename(extension: &str) -> String {
        if extension.is_empty() {
            ENTRY_STEM.to_string()
        } else {
            format!("{}.{}", ENTRY_STEM, extension)
        }
    }

    /// Write the program source; returns the entry filename
    pub fn write_source(&self, extension: &str, source: &str) -> io::Result<String> {
        let filename = Self::entry_filename(extension);
        self.write_file(&filename, source)?;
        Ok(filename)
    }

    /// Write stdin next to the source; returns the filename
    pub fn write_stdin(&self, stdin: &str) -> io::Result<&'static str> {
        self.write_file(STDIN_FILE, stdin)?;
        Ok(STDIN_FILE)
    }

    fn write_file(&self, filename: &str, content: &str) -> io::Result<()> {
        let path = self.path.join(filename);
        fs::write(&path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        }

        Ok(())
    }
}

impl Drop for WorkingDirectory {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed working directory {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove working directory {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_named_by_execution_id_and_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let dir = WorkingDirectory::create(root.path(), "exec-123").unwrap();
            assert_eq!(dir.path(), root.path().join("exec-123"));

            let entry = dir.write_source("py", "print('hello')").unwrap();
            assert_eq!(entry, "main.py");
            assert_eq!(dir.write_stdin("42\n").unwrap(), "input.txt");

            assert_eq!(
                fs::read_to_string(dir.path().join("main.py")).unwrap(),
                "print('hello')"
            );
            assert_eq!(fs::read_to_string(dir.path().join("input.txt")).unwrap(), "42\n");
            dir.path().to_path_buf()
        };

        assert!(!path.exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_removed_when_execution_panics() {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().to_path_buf();

        let result = std::panic::catch_unwind(move || {
            let dir = WorkingDirectory::create(&root_path, "exec-panic").unwrap();
            dir.write_source("c", "int main() {}").unwrap();
            panic!("executor blew up");
        });

        assert!(result.is_err());
        assert!(!root.path().join("exec-panic").exists());
    }

    #[test]
    fn test_collision_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let _first = WorkingDirectory::create(root.path(), "same-id").unwrap();
        let second = WorkingDirectory::create(root.path(), "same-id");
        assert_eq!(second.unwrap_err().kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let root = tempfile::tempdir().unwrap();
        for id in ["", "../escape", "a/b", "."] {
            assert!(WorkingDirectory::create(root.path(), id).is_err(), "{:?}", id);
        }
    }

    #[test]
    fn test_creates_missing_temp_root() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("does").join("not").join("exist");
        let dir = WorkingDirectory::create(&nested, "abc").unwrap();
        assert!(dir.path().is_dir());
    }
}
