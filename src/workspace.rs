//! Workspace store
//!
//! A flat directory holding one file per workspace entry. Writes go through a
//! temporary file in the same directory and are renamed into place, so readers
//! never observe a partially written file.

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

/// Prefix of in-flight temporary files; never listed and never accepted as a name
const TEMP_PREFIX: &str = ".polyrun-tmp-";

const MAX_FILE_NAME_LEN: usize = 255;

const NEW_FILE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file name '{name}': {reason}")]
    InvalidFileName { name: String, reason: &'static str },

    #[error("Storage failure on '{name}': {source}")]
    Storage {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn storage(name: impl Into<String>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            WorkspaceError::NotFound(name.into())
        } else {
            WorkspaceError::Storage {
                name: name.into(),
                source,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// One file of the workspace, as served to the editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub language: String,
    pub content: String,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            language: language_tag(&name),
            name,
            content: content.into(),
        }
    }
}

/// Handle to the workspace directory
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open the workspace, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| WorkspaceError::storage(root.display().to_string(), e))?;
        info!("Workspace ready at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All regular files, sorted by name
    pub async fn list(&self) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();
        for name in self.names().await? {
            match self.read(&name).await {
                Ok(content) => records.push(FileRecord::new(name, content)),
                // Deleted between the directory scan and the read
                Err(WorkspaceError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Names of all regular files, sorted
    pub async fn names(&self) -> Result<Vec<String>> {
        let root_name = self.root.display().to_string();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| WorkspaceError::storage(root_name.clone(), e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::storage(root_name.clone(), e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // Temp files and names the API could never address again
            if validate_file_name(&name).is_err() {
                debug!("Skipping unaddressable entry {:?}", name);
                continue;
            }
            match entry.file_type().await {
                Ok(file_type) if file_type.is_file() => names.push(name),
                _ => continue,
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn read(&self, name: &str) -> Result<String> {
        let path = self.path_of(name)?;
        let bytes = fs::read(&path)
            .await
            .map_err(|e| WorkspaceError::storage(name, e))?;
        Ok(match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    pub async fn get(&self, name: &str) -> Result<FileRecord> {
        let content = self.read(name).await?;
        Ok(FileRecord::new(name, content))
    }

    /// Create or fully overwrite a file
    pub async fn write(&self, name: &str, content: &str) -> Result<()> {
        let path = self.path_of(name)?;
        let root = self.root.clone();
        let bytes = content.as_bytes().to_vec();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut temp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&root)?;
            temp.write_all(&bytes)?;
            // Keep the mode of the file being replaced
            let permissions = match std::fs::metadata(&path) {
                Ok(meta) => meta.permissions(),
                Err(_) => std::fs::Permissions::from_mode(NEW_FILE_MODE),
            };
            temp.as_file().set_permissions(permissions)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| WorkspaceError::storage(name, io::Error::other(e)))?
        .map_err(|e| WorkspaceError::storage(name, e))?;

        debug!("Saved {} ({} bytes)", name, content.len());
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_of(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| WorkspaceError::storage(name, e))?;
        info!("Deleted {}", name);
        Ok(())
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.root.join(name))
    }
}

/// Reject names that would escape the flat workspace or confuse the shell
pub fn validate_file_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        Some("name is empty")
    } else if name.len() > MAX_FILE_NAME_LEN {
        Some("name is too long")
    } else if name == "." || name == ".." {
        Some("name is reserved")
    } else if name.contains(['/', '\\', '\0']) {
        Some("subdirectories are not supported")
    } else if name.starts_with('-') {
        Some("name must not start with '-'")
    } else if name.starts_with(TEMP_PREFIX) {
        Some("name is reserved")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(WorkspaceError::InvalidFileName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Editor language tag for a file name, from its extension
pub fn language_tag(name: &str) -> String {
    let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) else {
        return "plaintext".to_string();
    };
    let ext = ext.to_lowercase();
    let tag = match ext.as_str() {
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" => "typescript",
        "c" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "h" => "cpp",
        "rs" => "rust",
        "java" => "java",
        "go" => "go",
        "php" => "php",
        "rb" => "ruby",
        "pl" => "perl",
        "lua" => "lua",
        "sh" | "bash" => "bash",
        "html" | "htm" => "html",
        "css" => "css",
        "json" => "json",
        "yml" | "yaml" => "yaml",
        "md" => "markdown",
        _ => return ext,
    };
    tag.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path().join("workspace")).await.unwrap();
        (dir, ws)
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let (dir, _ws) = workspace().await;
        assert!(dir.path().join("workspace").is_dir());
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (_dir, ws) = workspace().await;
        let content = "print('héllo, 世界 🚀')\n\nline three\r\n\ttabbed\n";
        ws.write("main.py", content).await.unwrap();
        assert_eq!(ws.read("main.py").await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_write_overwrites() {
        let (_dir, ws) = workspace().await;
        ws.write("a.txt", "a much longer first version").await.unwrap();
        ws.write("a.txt", "short").await.unwrap();
        assert_eq!(ws.read("a.txt").await.unwrap(), "short");
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let (_dir, ws) = workspace().await;
        ws.write("a.txt", "x").await.unwrap();
        let mut entries = std::fs::read_dir(ws.root()).unwrap();
        let only = entries.next().unwrap().unwrap();
        assert_eq!(only.file_name(), "a.txt");
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let (_dir, ws) = workspace().await;
        assert!(matches!(
            ws.read("nope.py").await,
            Err(WorkspaceError::NotFound(name)) if name == "nope.py"
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, ws) = workspace().await;
        ws.write("a.py", "1").await.unwrap();
        ws.delete("a.py").await.unwrap();
        assert!(matches!(ws.read("a.py").await, Err(WorkspaceError::NotFound(_))));
        assert!(matches!(ws.delete("a.py").await, Err(WorkspaceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_stable() {
        let (_dir, ws) = workspace().await;
        ws.write("main.py", "print(1)").await.unwrap();
        ws.write("bot.js", "console.log(1)").await.unwrap();
        std::fs::create_dir(ws.root().join("subdir")).unwrap();
        std::fs::write(ws.root().join(format!("{}abc", TEMP_PREFIX)), "partial").unwrap();

        let first = ws.list().await.unwrap();
        let second = ws.list().await.unwrap();
        assert_eq!(first, second);

        let names: Vec<_> = first.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["bot.js", "main.py"]);
        assert_eq!(first[1].id, "main.py");
        assert_eq!(first[1].language, "python");
        assert_eq!(first[1].content, "print(1)");
    }

    #[tokio::test]
    async fn test_write_keeps_file_mode() {
        let (_dir, ws) = workspace().await;
        let path = ws.root().join("run.sh");
        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;

        ws.write("run.sh", "echo 1").await.unwrap();
        assert_eq!(mode(path.as_path()), 0o644);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ws.write("run.sh", "echo 2").await.unwrap();
        assert_eq!(mode(path.as_path()), 0o755);
        assert_eq!(ws.read("run.sh").await.unwrap(), "echo 2");
    }

    #[tokio::test]
    async fn test_list_skips_foreign_unaddressable_files() {
        let (_dir, ws) = workspace().await;
        ws.write("main.py", "print(1)").await.unwrap();
        std::fs::write(ws.root().join("-notes.txt"), "dropped by hand").unwrap();
        std::fs::write(ws.root().join("a\\b"), "odd name").unwrap();

        let first = ws.list().await.unwrap();
        let names: Vec<_> = first.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["main.py"]);
        assert_eq!(ws.list().await.unwrap(), first);
        assert_eq!(ws.names().await.unwrap(), vec!["main.py"]);
    }

    #[tokio::test]
    async fn test_list_reads_binary_files_lossily() {
        let (_dir, ws) = workspace().await;
        std::fs::write(ws.root().join("blob.bin"), [0x66, 0xff, 0x6f]).unwrap();
        let files = ws.list().await.unwrap();
        assert_eq!(files[0].content, "f\u{fffd}o");
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let (_dir, ws) = workspace().await;
        for name in ["", "../escape.py", "a/b.py", "..", "-rf.py", "a\\b"] {
            assert!(
                matches!(
                    ws.write(name, "x").await,
                    Err(WorkspaceError::InvalidFileName { .. })
                ),
                "{:?}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_distinct_files() {
        let (_dir, ws) = workspace().await;
        let mut handles = Vec::new();
        for i in 0..16 {
            let ws = ws.clone();
            handles.push(tokio::spawn(async move {
                ws.write(&format!("f{}.txt", i), &i.to_string()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ws.names().await.unwrap().len(), 16);
        assert_eq!(ws.read("f7.txt").await.unwrap(), "7");
    }

    #[test]
    fn test_language_tag() {
        assert_eq!(language_tag("main.py"), "python");
        assert_eq!(language_tag("a.CPP"), "cpp");
        assert_eq!(language_tag("plugin.yml"), "yaml");
        assert_eq!(language_tag("Makefile"), "plaintext");
        assert_eq!(language_tag("x.cob"), "cob");
    }
}
