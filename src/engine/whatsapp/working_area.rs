// WhatsApp Connection Manager — Session Working Area
// One ephemeral directory per attempt (generation), owned exclusively by it.
// Removal happens through `remove()` on the normal exit paths; `Drop` is the
// backstop for paths that unwind or bail out early (a failed transport open,
// an aborted task), so a Working Area can never outlive its owner.

use crate::atoms::error::EngineResult;
use log::{info, warn};
use std::path::{Path, PathBuf};

pub struct WorkingArea {
    path: PathBuf,
    generation: u64,
    released: bool,
}

impl WorkingArea {
    /// Create a brand-new directory under `root`, named by a fresh random id.
    /// `create_dir` (not `create_dir_all`) so an existing path is an error
    /// rather than silently shared.
    pub async fn create(root: &Path, bot_id: &str, generation: u64) -> EngineResult<Self> {
        tokio::fs::create_dir_all(root).await?;
        let name = format!("{}-{}", sanitize(bot_id), uuid::Uuid::new_v4().simple());
        let path = root.join(name);
        tokio::fs::create_dir(&path).await?;
        info!("[whatsapp] {} gen {}: working area {}", bot_id, generation, path.display());
        Ok(WorkingArea { path, generation, released: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Remove the directory and everything in it. Already-missing is fine.
    /// Failures are returned, not logged; the caller knows which bot it was.
    pub async fn remove(mut self) -> EngineResult<()> {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WorkingArea {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("[whatsapp] Failed to remove working area {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

/// Remove every directory left under `root` by a previous process.
/// Only call this before any attempt has started; it does not know which
/// areas are live.
pub async fn purge_orphans(root: &Path) -> EngineResult<usize> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("[whatsapp] Could not purge {}: {}", entry.path().display(), e),
            }
        }
    }
    if removed > 0 {
        info!("[whatsapp] Purged {} orphaned working area(s) under {}", removed, root.display());
    }
    Ok(removed)
}

/// Keep bot ids from escaping the root or producing odd directory names.
fn sanitize(bot_id: &str) -> String {
    let cleaned: String = bot_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(48)
        .collect();
    if cleaned.is_empty() { "bot".into() } else { cleaned }
}
