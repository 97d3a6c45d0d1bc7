use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;

use crate::utils::validate_id;
use crate::VideoError;

/// Download archive file: one video id per line. Lines that are not
/// 11-character ids are ignored on load; `add` is idempotent.
pub struct DownloadArchive {
    path: PathBuf,
    ids: Mutex<HashSet<String>>,
}

impl DownloadArchive {
    /// Load an archive, tolerating a missing file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path = path.as_ref().to_path_buf();

        let mut ids = HashSet::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if validate_id(line) {
                        ids.insert(line.to_string());
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        Ok(Self {
            path,
            ids: Mutex::new(ids),
        })
    }

    pub fn has(&self, video_id: &str) -> bool {
        self.ids
            .lock()
            .expect("archive poisoned")
            .contains(video_id.trim())
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("archive poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a video id. Returns `false` without touching the file when
    /// the id is already present or not a valid id.
    pub async fn add(&self, video_id: &str) -> Result<bool, VideoError> {
        let video_id = video_id.trim();
        if !validate_id(video_id) {
            return Ok(false);
        }

        {
            let mut ids = self.ids.lock().expect("archive poisoned");
            if !ids.insert(video_id.to_string()) {
                return Ok(false);
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{video_id}\n").as_bytes()).await?;
        file.flush().await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_ignores_junk_lines_and_add_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("ytfetch-archive-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("archive.txt");
        tokio::fs::write(&path, "jNQXAC9IVRw\nnot-a-video-id\n\n")
            .await
            .unwrap();

        let archive = DownloadArchive::load(&path).await.unwrap();
        assert!(archive.has("jNQXAC9IVRw"));
        assert!(!archive.has("not-a-video-id"));
        assert_eq!(archive.len(), 1);

        assert!(!archive.add("jNQXAC9IVRw").await.unwrap());
        assert!(archive.add("dQw4w9WgXcQ").await.unwrap());
        assert!(!archive.add("dQw4w9WgXcQ").await.unwrap());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(
            contents
                .lines()
                .filter(|line| *line == "dQw4w9WgXcQ")
                .count(),
            1
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
