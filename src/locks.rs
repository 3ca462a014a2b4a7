//! Optional file-path lock service: a filesystem-based exclusive lock keyed
//! by a canonicalized repo-relative path. Grounded verbatim on
//! `original_source/core/file_locks.py`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub key: String,
    pub agent_id: String,
    pub acquired_at: f64,
}

pub fn canonicalize_path(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    let p_trimmed = p.trim();
    p = p_trimmed.to_string();
    if let Some(stripped) = p.strip_prefix("./") {
        p = stripped.to_string();
    }
    p.trim_start_matches('/').to_string()
}

fn lock_file_path(lock_dir: &Path, key: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hex_prefix(&hasher.finalize(), 16);
    lock_dir.join(format!("{digest}.lock"))
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()[..n].to_string()
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn get_lock_holder(lock_dir: &Path, path: &str) -> Option<String> {
    let key = canonicalize_path(path);
    read_lock(&lock_file_path(lock_dir, &key)).map(|i| i.agent_id)
}

/// Idempotent acquire: a caller that already holds the lock succeeds as a
/// no-op (SPEC_FULL.md §8 round-trip law).
pub fn try_acquire_lock(lock_dir: &Path, path: &str, agent_id: &str) -> std::io::Result<bool> {
    std::fs::create_dir_all(lock_dir)?;
    let key = canonicalize_path(path);
    let lock_path = lock_file_path(lock_dir, &key);

    if let Some(existing) = read_lock(&lock_path) {
        if existing.agent_id == agent_id {
            return Ok(true);
        }
    }

    let payload = serde_json::to_string(&LockInfo {
        key,
        agent_id: agent_id.to_string(),
        acquired_at: now_epoch(),
    })
    .expect("LockInfo serializes");

    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut f) => {
            f.write_all(payload.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn acquire_lock(
    lock_dir: &Path,
    path: &str,
    agent_id: &str,
    timeout: Duration,
) -> std::io::Result<bool> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if try_acquire_lock(lock_dir, path, agent_id)? {
            return Ok(true);
        }
        if timeout.is_zero() || std::time::Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Refuses to release a lock held by a different agent.
pub fn release_lock(lock_dir: &Path, path: &str, agent_id: &str) -> std::io::Result<bool> {
    let key = canonicalize_path(path);
    let lock_path = lock_file_path(lock_dir, &key);
    if let Some(info) = read_lock(&lock_path) {
        if info.agent_id != agent_id {
            return Ok(false);
        }
    }
    match std::fs::remove_file(&lock_path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

pub fn cleanup_agent_locks(lock_dir: &Path, agent_id: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(lock_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        if let Some(info) = read_lock(&path) {
            if info.agent_id == agent_id && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

pub fn list_locks(lock_dir: &Path) -> Vec<LockInfo> {
    let Ok(entries) = std::fs::read_dir(lock_dir) else {
        return Vec::new();
    };
    let mut out: Vec<LockInfo> = entries
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("lock"))
        .filter_map(|e| read_lock(&e.path()))
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key).then(a.agent_id.cmp(&b.agent_id)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_is_idempotent_for_same_holder() {
        let dir = TempDir::new().unwrap();
        assert!(try_acquire_lock(dir.path(), "src/main.rs", "agent-1").unwrap());
        assert!(try_acquire_lock(dir.path(), "src/main.rs", "agent-1").unwrap());
    }

    #[test]
    fn second_holder_is_refused() {
        let dir = TempDir::new().unwrap();
        assert!(try_acquire_lock(dir.path(), "src/main.rs", "agent-1").unwrap());
        assert!(!try_acquire_lock(dir.path(), "src/main.rs", "agent-2").unwrap());
    }

    #[test]
    fn release_refuses_non_holder() {
        let dir = TempDir::new().unwrap();
        try_acquire_lock(dir.path(), "src/main.rs", "agent-1").unwrap();
        assert!(!release_lock(dir.path(), "src/main.rs", "agent-2").unwrap());
        assert!(release_lock(dir.path(), "src/main.rs", "agent-1").unwrap());
    }

    #[test]
    fn cleanup_agent_locks_removes_only_its_own() {
        let dir = TempDir::new().unwrap();
        try_acquire_lock(dir.path(), "a.rs", "agent-1").unwrap();
        try_acquire_lock(dir.path(), "b.rs", "agent-2").unwrap();
        let removed = cleanup_agent_locks(dir.path(), "agent-1");
        assert_eq!(removed, 1);
        assert_eq!(list_locks(dir.path()).len(), 1);
    }
}
