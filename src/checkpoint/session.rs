//! The checkpoint session engine.
//!
//! One `CheckpointSession` owns one session directory and all in-memory
//! chain state for the working copy it was opened for. Creation and
//! restoration are serialized behind a single lock; the chain invariants
//! (full-content base at position 0, strictly increasing timestamps,
//! reconstruction hash fidelity) are maintained by every mutation,
//! including middle-entry removal, which recomputes the successor's diff
//! against its new predecessor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::diff::{apply_diff, line_diff, DiffEntry};
use super::model::{
    encode_content, hash_content, hash_path, FileCheckpoint, SessionGitInfo, SessionMeta,
};
use super::{
    CheckpointConfig, CheckpointError, CheckpointOptions, RestoreOptions, SESSION_RETENTION_DAYS,
};

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ChainState {
    chains: HashMap<String, Vec<FileCheckpoint>>,
    /// The position currently considered "present" per file.
    current_index: HashMap<String, usize>,
    edit_counts: HashMap<String, u32>,
    storage_bytes: u64,
}

pub struct CheckpointSession {
    id: String,
    dir: PathBuf,
    working_directory: PathBuf,
    start_time: DateTime<Utc>,
    config: CheckpointConfig,
    git: SessionGitInfo,
    state: Mutex<ChainState>,
}

impl CheckpointSession {
    /// Open a fresh session under `config.root`, sweeping stale session
    /// directories past the retention window first.
    pub async fn init(
        config: CheckpointConfig,
        working_directory: impl Into<PathBuf>,
    ) -> Result<Self, CheckpointError> {
        let working_directory = working_directory.into();
        sweep_stale_sessions(&config.root).await;

        let id = Uuid::new_v4().to_string();
        let dir = config.root.join(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let git = read_git_info(&working_directory);
        let session = Self {
            id,
            dir,
            working_directory,
            start_time: Utc::now(),
            config,
            git,
            state: Mutex::new(ChainState::default()),
        };
        session.write_session_meta(&ChainState::default()).await;
        tracing::info!(
            id = %session.id,
            dir = %session.dir.display(),
            "checkpoint session opened"
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn storage_bytes(&self) -> u64 {
        self.state.lock().await.storage_bytes
    }

    pub async fn chain_len(&self, path: &Path) -> usize {
        let key = path_key(path);
        self.state
            .lock()
            .await
            .chains
            .get(&key)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub async fn current_index(&self, path: &Path) -> Option<usize> {
        self.state.lock().await.current_index.get(&path_key(path)).copied()
    }

    // ─── Creation ───────────────────────────────────────────────────────────

    /// Snapshot the current on-disk state of `path` onto its chain.
    pub async fn create_checkpoint(
        &self,
        path: &Path,
        opts: &CheckpointOptions,
    ) -> Result<FileCheckpoint, CheckpointError> {
        let key = path_key(path);
        let content = tokio::fs::read_to_string(path).await?;
        let metadata = tokio::fs::metadata(path).await.ok();
        let hash = hash_content(&content);

        let mut state = self.state.lock().await;

        // Unchanged since the last checkpoint: return it as-is.
        if let Some(last) = state.chains.get(&key).and_then(|c| c.last()) {
            if last.hash == hash && !opts.force_full_content {
                tracing::debug!(file = %key, hash = %hash, "content unchanged — reusing last checkpoint");
                return Ok(last.clone());
            }
        }

        let chain_len = state.chains.get(&key).map(|c| c.len()).unwrap_or(0);
        let edits = state.edit_counts.get(&key).copied().unwrap_or(0);
        let full = chain_len == 0 || opts.force_full_content || edits == 0;

        let timestamp = {
            let now = Utc::now().timestamp_millis();
            match state.chains.get(&key).and_then(|c| c.last()) {
                Some(last) => now.max(last.timestamp + 1),
                None => now,
            }
        };

        let mut cp = FileCheckpoint {
            file_path: key.clone(),
            timestamp,
            hash,
            content: None,
            diff: None,
            compressed: false,
            name: opts.name.clone(),
            description: opts.description.clone(),
            tags: opts.tags.clone(),
            file_mode: metadata.as_ref().map(file_mode_of),
            file_size: metadata.as_ref().map(|m| m.len()),
            git_commit: self.git.git_commit.clone(),
        };

        if full {
            let (stored, compressed) = encode_content(&content);
            cp.content = Some(stored);
            cp.compressed = compressed;
        } else {
            let chain = state.chains.get(&key).expect("non-empty chain");
            let prior = reconstruct_chain(chain, chain_len - 1)?;
            let entries = line_diff(&prior, &content);
            cp.diff = Some(serde_json::to_string(&entries)?);
        }

        let chain = state.chains.entry(key.clone()).or_default();
        chain.push(cp.clone());
        let tail = chain.len() - 1;
        state.current_index.insert(key.clone(), tail);
        state.edit_counts.insert(key.clone(), 0);

        self.write_checkpoint_file(&cp).await?;

        // Chain length cap: drop the oldest non-base entry until we fit.
        while state.chains[&key].len() > self.config.max_checkpoints_per_file {
            self.remove_entry_locked(&mut state, &key, 1).await?;
        }

        self.recompute_storage_locked(&mut state).await?;
        let limit_bytes = self.config.max_storage_mb * 1024 * 1024;
        if state.storage_bytes > limit_bytes {
            if let Err(e) = self.enforce_locked(&mut state).await {
                tracing::warn!(err = %e, "storage enforcement could not reach target");
            }
        }

        self.write_session_meta(&state).await;
        tracing::debug!(
            file = %key,
            index = tail,
            full,
            compressed = cp.compressed,
            "checkpoint created"
        );
        Ok(cp)
    }

    /// Record one edit to `path`; crossing the auto-checkpoint threshold
    /// takes a checkpoint and returns it.
    pub async fn track_file_edit(
        &self,
        path: &Path,
    ) -> Result<Option<FileCheckpoint>, CheckpointError> {
        let key = path_key(path);
        let crossed = {
            let mut state = self.state.lock().await;
            let count = state.edit_counts.entry(key).or_insert(0);
            *count += 1;
            *count >= self.config.auto_checkpoint_edits
        };
        if crossed {
            let cp = self.create_checkpoint(path, &CheckpointOptions::default()).await?;
            return Ok(Some(cp));
        }
        Ok(None)
    }

    // ─── Reconstruction & restoration ───────────────────────────────────────

    /// Reconstruct the content at chain position `index`.
    pub async fn reconstruct(
        &self,
        path: &Path,
        index: usize,
    ) -> Result<String, CheckpointError> {
        let key = path_key(path);
        let state = self.state.lock().await;
        let chain = state
            .chains
            .get(&key)
            .ok_or_else(|| CheckpointError::NotFound(key.clone()))?;
        reconstruct_chain(chain, index)
    }

    /// Restore `path` to a chain position (default: the current restore
    /// index). Returns the restored content.
    pub async fn restore_checkpoint(
        &self,
        path: &Path,
        index: Option<usize>,
        opts: &RestoreOptions,
    ) -> Result<String, CheckpointError> {
        let key = path_key(path);

        let (content, target_ts, file_mode) = {
            let state = self.state.lock().await;
            let chain = state
                .chains
                .get(&key)
                .ok_or_else(|| CheckpointError::NotFound(key.clone()))?;
            let idx = index
                .or_else(|| state.current_index.get(&key).copied())
                .unwrap_or(chain.len() - 1);
            if idx >= chain.len() {
                return Err(CheckpointError::BadIndex { index: idx, len: chain.len() });
            }
            let content = reconstruct_chain(chain, idx)?;
            (content, chain[idx].timestamp, chain[idx].file_mode)
        };

        if opts.dry_run {
            return Ok(content);
        }

        if opts.create_backup && path.exists() {
            let backup_opts = CheckpointOptions {
                name: Some("pre-restore".to_string()),
                ..Default::default()
            };
            self.create_checkpoint(path, &backup_opts).await?;
        }

        tokio::fs::write(path, &content).await?;
        if opts.preserve_metadata {
            restore_file_mode(path, file_mode).await;
        }

        // The backup may have trimmed the chain; locate the target by its
        // timestamp rather than trusting the original index.
        let mut state = self.state.lock().await;
        if let Some(chain) = state.chains.get(&key) {
            if let Some(pos) = chain.iter().position(|c| c.timestamp == target_ts) {
                state.current_index.insert(key, pos);
            }
        }

        Ok(content)
    }

    /// Restore every tracked file to its newest checkpoint at or before
    /// `target_ms`. Files with no checkpoint that early are skipped.
    /// Returns the paths that were restored.
    pub async fn restore_to_timestamp(
        &self,
        target_ms: i64,
        opts: &RestoreOptions,
    ) -> Result<Vec<String>, CheckpointError> {
        let targets: Vec<(String, usize)> = {
            let state = self.state.lock().await;
            state
                .chains
                .iter()
                .filter_map(|(p, chain)| {
                    chain
                        .iter()
                        .rposition(|c| c.timestamp <= target_ms)
                        .map(|idx| (p.clone(), idx))
                })
                .collect()
        };

        let mut restored = Vec::with_capacity(targets.len());
        for (p, idx) in targets {
            self.restore_checkpoint(Path::new(&p), Some(idx), opts).await?;
            restored.push(p);
        }
        Ok(restored)
    }

    /// Move the restore index one step back and restore.
    pub async fn undo(&self, path: &Path) -> Result<String, CheckpointError> {
        let key = path_key(path);
        let idx = {
            let state = self.state.lock().await;
            let chain = state
                .chains
                .get(&key)
                .ok_or_else(|| CheckpointError::NotFound(key.clone()))?;
            let current = state
                .current_index
                .get(&key)
                .copied()
                .unwrap_or(chain.len() - 1);
            if current == 0 {
                return Err(CheckpointError::AtOldest);
            }
            current - 1
        };
        // Undo moves the index without growing history.
        let opts = RestoreOptions { create_backup: false, ..Default::default() };
        self.restore_checkpoint(path, Some(idx), &opts).await
    }

    /// Move the restore index one step forward and restore.
    pub async fn redo(&self, path: &Path) -> Result<String, CheckpointError> {
        let key = path_key(path);
        let idx = {
            let state = self.state.lock().await;
            let chain = state
                .chains
                .get(&key)
                .ok_or_else(|| CheckpointError::NotFound(key.clone()))?;
            let current = state
                .current_index
                .get(&key)
                .copied()
                .unwrap_or(chain.len() - 1);
            if current + 1 >= chain.len() {
                return Err(CheckpointError::AtNewest);
            }
            current + 1
        };
        let opts = RestoreOptions { create_backup: false, ..Default::default() };
        self.restore_checkpoint(path, Some(idx), &opts).await
    }

    // ─── Storage management ─────────────────────────────────────────────────

    /// Recompute on-disk size and, when over the cap, delete checkpoints in
    /// ascending timestamp order (bases and sole survivors excepted) until
    /// usage is at or below 80% of the cap.
    pub async fn enforce_storage_limits(&self) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        self.recompute_storage_locked(&mut state).await?;
        self.enforce_locked(&mut state).await?;
        self.write_session_meta(&state).await;
        Ok(())
    }

    async fn enforce_locked(&self, state: &mut ChainState) -> Result<(), CheckpointError> {
        let limit_bytes = self.config.max_storage_mb * 1024 * 1024;
        if state.storage_bytes <= limit_bytes {
            return Ok(());
        }
        let target = limit_bytes * 8 / 10;

        while state.storage_bytes > target {
            // Oldest deletable checkpoint across all chains.
            let mut candidate: Option<(String, usize, i64)> = None;
            for (path, chain) in &state.chains {
                if chain.len() <= 1 {
                    continue; // the only remaining checkpoint for its file
                }
                for (idx, cp) in chain.iter().enumerate() {
                    if idx == 0 {
                        continue; // never the base
                    }
                    let older = candidate
                        .as_ref()
                        .map(|(_, _, ts)| cp.timestamp < *ts)
                        .unwrap_or(true);
                    if older {
                        candidate = Some((path.clone(), idx, cp.timestamp));
                    }
                }
            }

            let Some((path, idx, _)) = candidate else {
                return Err(CheckpointError::StorageFull {
                    current_bytes: state.storage_bytes,
                    limit_bytes,
                });
            };
            self.remove_entry_locked(state, &path, idx).await?;
            self.recompute_storage_locked(state).await?;
        }

        tracing::info!(
            bytes = state.storage_bytes,
            target,
            "checkpoint storage enforced"
        );
        Ok(())
    }

    /// Reduce a chain to its first, last, and every `keep_every_nth`
    /// element between, then cap to `max_checkpoints` by even sampling.
    /// Returns how many elements were removed.
    pub async fn compact_checkpoints(
        &self,
        path: &Path,
        keep_every_nth: usize,
        max_checkpoints: Option<usize>,
    ) -> Result<usize, CheckpointError> {
        let key = path_key(path);
        let nth = keep_every_nth.max(1);
        let mut state = self.state.lock().await;
        let chain = state
            .chains
            .get(&key)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(key.clone()))?;
        let len = chain.len();
        if len <= 2 {
            return Ok(0);
        }

        let mut keep: Vec<usize> = vec![0];
        for i in 1..len - 1 {
            if i % nth == 0 {
                keep.push(i);
            }
        }
        keep.push(len - 1);

        if let Some(max) = max_checkpoints {
            if max >= 2 && keep.len() > max {
                let mut sampled = Vec::with_capacity(max);
                for j in 0..max {
                    let pos = j * (keep.len() - 1) / (max - 1);
                    sampled.push(keep[pos]);
                }
                sampled.dedup();
                keep = sampled;
            }
        }

        // Contents of the kept elements, computed against the intact chain.
        let mut contents = Vec::with_capacity(keep.len());
        for &i in &keep {
            contents.push(reconstruct_chain(&chain, i)?);
        }

        let mut new_chain = Vec::with_capacity(keep.len());
        for (j, &i) in keep.iter().enumerate() {
            let mut cp = chain[i].clone();
            if j == 0 {
                let (stored, compressed) = encode_content(&contents[0]);
                cp.content = Some(stored);
                cp.compressed = compressed;
                cp.diff = None;
            } else if cp.diff.is_some() {
                let entries = line_diff(&contents[j - 1], &contents[j]);
                cp.diff = Some(serde_json::to_string(&entries)?);
            }
            new_chain.push(cp);
        }

        for (i, cp) in chain.iter().enumerate() {
            if !keep.contains(&i) {
                let _ = tokio::fs::remove_file(self.checkpoint_file(&key, cp.timestamp)).await;
            }
        }
        for cp in &new_chain {
            self.write_checkpoint_file(cp).await?;
        }

        let removed = len - new_chain.len();
        let old_ci = state.current_index.get(&key).copied().unwrap_or(len - 1);
        let new_ci = keep.iter().rposition(|&k| k <= old_ci).unwrap_or(0);
        state.chains.insert(key.clone(), new_chain);
        state.current_index.insert(key, new_ci);

        self.recompute_storage_locked(&mut state).await?;
        self.write_session_meta(&state).await;
        Ok(removed)
    }

    /// Promote every 10th diff element to full content, bounding the replay
    /// depth of later reconstructions. Returns how many were promoted.
    pub async fn optimize_storage(&self, path: &Path) -> Result<usize, CheckpointError> {
        let key = path_key(path);
        let mut state = self.state.lock().await;
        let mut chain = state
            .chains
            .get(&key)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(key.clone()))?;

        let mut promoted = 0;
        for i in 1..chain.len() {
            if i % 10 == 0 && chain[i].diff.is_some() {
                let content = reconstruct_chain(&chain, i)?;
                let (stored, compressed) = encode_content(&content);
                chain[i].content = Some(stored);
                chain[i].compressed = compressed;
                chain[i].diff = None;
                self.write_checkpoint_file(&chain[i]).await?;
                promoted += 1;
            }
        }

        state.chains.insert(key, chain);
        self.recompute_storage_locked(&mut state).await?;
        Ok(promoted)
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    /// Remove chain element `idx` (never the base). A diff successor is
    /// recomputed against its new predecessor so reconstruction hashes stay
    /// intact.
    async fn remove_entry_locked(
        &self,
        state: &mut ChainState,
        key: &str,
        idx: usize,
    ) -> Result<(), CheckpointError> {
        let chain = state
            .chains
            .get_mut(key)
            .ok_or_else(|| CheckpointError::NotFound(key.to_string()))?;
        if idx == 0 || idx >= chain.len() {
            return Err(CheckpointError::BadIndex { index: idx, len: chain.len() });
        }

        if idx + 1 < chain.len() && chain[idx + 1].diff.is_some() {
            let successor_content = reconstruct_chain(chain, idx + 1)?;
            let predecessor_content = reconstruct_chain(chain, idx - 1)?;
            let entries = line_diff(&predecessor_content, &successor_content);
            chain[idx + 1].diff = Some(serde_json::to_string(&entries)?);
            let successor = chain[idx + 1].clone();
            self.write_checkpoint_file(&successor).await?;
        }

        let removed = {
            let chain = state.chains.get_mut(key).expect("chain exists");
            chain.remove(idx)
        };
        let _ = tokio::fs::remove_file(self.checkpoint_file(key, removed.timestamp)).await;

        if let Some(ci) = state.current_index.get_mut(key) {
            if *ci >= idx {
                *ci = ci.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn checkpoint_file(&self, key: &str, timestamp: i64) -> PathBuf {
        self.dir.join(format!("{}-{}.json", hash_path(key), timestamp))
    }

    async fn write_checkpoint_file(&self, cp: &FileCheckpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_file(&cp.file_path, cp.timestamp);
        let json = serde_json::to_string_pretty(cp)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    async fn recompute_storage_locked(
        &self,
        state: &mut ChainState,
    ) -> Result<(), CheckpointError> {
        let mut total = 0u64;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        state.storage_bytes = total;
        Ok(())
    }

    async fn write_session_meta(&self, state: &ChainState) {
        let meta = SessionMeta {
            id: self.id.clone(),
            start_time: self.start_time,
            working_directory: self.working_directory.to_string_lossy().to_string(),
            auto_checkpoint_interval: self.config.auto_checkpoint_edits,
            metadata: SessionGitInfo {
                git_branch: self.git.git_branch.clone(),
                git_commit: self.git.git_commit.clone(),
                total_size: Some(state.storage_bytes),
            },
            files: state.chains.keys().cloned().collect(),
        };
        match serde_json::to_string_pretty(&meta) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(self.dir.join("session.json"), json).await {
                    tracing::warn!(err = %e, "could not write session.json");
                }
            }
            Err(e) => tracing::warn!(err = %e, "could not serialize session.json"),
        }
    }
}

// ─── Free helpers ─────────────────────────────────────────────────────────────

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Best-effort read of the working copy's git HEAD, without a git library.
/// Any missing or unexpected file yields empty info.
fn read_git_info(working_directory: &Path) -> SessionGitInfo {
    let git_dir = working_directory.join(".git");
    let Ok(head) = std::fs::read_to_string(git_dir.join("HEAD")) else {
        return SessionGitInfo::default();
    };
    let head = head.trim();

    if let Some(reference) = head.strip_prefix("ref: ") {
        let branch = reference.rsplit('/').next().map(str::to_string);
        let commit = std::fs::read_to_string(git_dir.join(reference))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| is_hex_commit(s));
        return SessionGitInfo {
            git_branch: branch,
            git_commit: commit,
            total_size: None,
        };
    }

    // Detached HEAD: the file holds the commit hash itself.
    if is_hex_commit(head) {
        return SessionGitInfo {
            git_branch: None,
            git_commit: Some(head.to_string()),
            total_size: None,
        };
    }

    SessionGitInfo::default()
}

fn is_hex_commit(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Walk back from `index` to the nearest full-content element, then replay
/// forward.
fn reconstruct_chain(
    chain: &[FileCheckpoint],
    index: usize,
) -> Result<String, CheckpointError> {
    if index >= chain.len() {
        return Err(CheckpointError::BadIndex { index, len: chain.len() });
    }

    let mut base = index;
    while !chain[base].is_full() {
        if base == 0 {
            return Err(CheckpointError::InternalCorruption(
                "chain has no full-content base".to_string(),
            ));
        }
        base -= 1;
    }

    let mut content = chain[base].decoded_content()?;
    for element in &chain[base + 1..=index] {
        if let Some(diff_json) = &element.diff {
            let entries: Vec<DiffEntry> = serde_json::from_str(diff_json)?;
            content = apply_diff(&content, &entries);
        } else {
            content = element.decoded_content()?;
        }
    }
    Ok(content)
}

#[cfg(unix)]
fn file_mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode_of(_meta: &std::fs::Metadata) -> u32 {
    0
}

async fn restore_file_mode(path: &Path, mode: Option<u32>) {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        if let Err(e) = tokio::fs::set_permissions(path, perms).await {
            tracing::debug!(path = %path.display(), err = %e, "could not restore file mode");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

/// Delete session directories whose last modification is past the retention
/// window.
async fn sweep_stale_sessions(root: &Path) {
    let Ok(mut dir) = tokio::fs::read_dir(root).await else {
        return;
    };
    let retention = Duration::from_secs(SESSION_RETENTION_DAYS * 24 * 60 * 60);
    while let Ok(Some(entry)) = dir.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(meta) = entry.metadata().await else { continue };
        let Ok(modified) = meta.modified() else { continue };
        if modified.elapsed().map(|age| age > retention).unwrap_or(false) {
            tracing::info!(dir = %path.display(), "sweeping stale checkpoint session");
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
    }
}
