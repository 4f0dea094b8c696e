//! Integration tests for the checkpoint engine.
//!
//! Tests cover:
//! 1. Diff chains: five edits of a 200-line file reconstruct exactly and
//!    store less than five full copies
//! 2. Undo then redo returns the restore index to its prior value
//! 3. Dry-run restore leaves disk untouched
//! 4. Bulk restore to a wall-clock instant
//! 5. Storage enforcement stays under the cap

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use agentd::checkpoint::{
    CheckpointConfig, CheckpointOptions, CheckpointSession, RestoreOptions,
};

async fn session(root: &Path) -> CheckpointSession {
    CheckpointSession::init(CheckpointConfig::new(root), "/tmp/workspace")
        .await
        .unwrap()
}

// ─── Test 1: diff chains reconstruct exactly ─────────────────────────────────

#[tokio::test]
async fn test_five_edits_reconstruct_and_beat_full_copies() {
    let dir = TempDir::new().unwrap();
    let s = session(&dir.path().join("cp")).await;
    let file = dir.path().join("module.rs");

    let base: String = (0..200)
        .map(|i| format!("pub fn handler_{i}(input: &str) -> String {{ input.to_uppercase() }}\n"))
        .collect();
    std::fs::write(&file, &base).unwrap();
    s.create_checkpoint(&file, &CheckpointOptions::default()).await.unwrap();

    let mut versions = vec![base.clone()];
    for v in 1..=5 {
        let edited = versions[v - 1].replace(
            &format!("handler_{}(input: &str)", v * 10),
            &format!("handler_{}(raw: &str)", v * 10),
        );
        assert_ne!(edited, versions[v - 1]);
        std::fs::write(&file, &edited).unwrap();
        s.track_file_edit(&file).await.unwrap();
        s.create_checkpoint(&file, &CheckpointOptions::default()).await.unwrap();
        versions.push(edited);
    }

    assert_eq!(s.chain_len(&file).await, 6);
    for (idx, expected) in versions.iter().enumerate() {
        assert_eq!(&s.reconstruct(&file, idx).await.unwrap(), expected, "index {idx}");
    }

    let naive = (base.len() * 5) as u64;
    let stored = s.storage_bytes().await;
    assert!(stored < naive, "stored {stored} bytes, naive five copies {naive}");
}

// ─── Test 2: undo/redo restores the index ────────────────────────────────────

#[tokio::test]
async fn test_undo_then_redo_restores_current_index() {
    let dir = TempDir::new().unwrap();
    let s = session(&dir.path().join("cp")).await;
    let file = dir.path().join("notes.txt");

    for v in ["draft one\n", "draft two\n", "draft three\n"] {
        std::fs::write(&file, v).unwrap();
        s.track_file_edit(&file).await.unwrap();
        s.create_checkpoint(&file, &CheckpointOptions::default()).await.unwrap();
    }

    let before = s.current_index(&file).await.unwrap();
    s.undo(&file).await.unwrap();
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "draft two\n");
    s.redo(&file).await.unwrap();
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "draft three\n");
    assert_eq!(s.current_index(&file).await.unwrap(), before);
}

// ─── Test 3: dry run never writes ────────────────────────────────────────────

#[tokio::test]
async fn test_dry_run_restore_is_read_only() {
    let dir = TempDir::new().unwrap();
    let s = session(&dir.path().join("cp")).await;
    let file = dir.path().join("config.json");

    std::fs::write(&file, "{\"v\":1}\n").unwrap();
    s.create_checkpoint(&file, &CheckpointOptions::default()).await.unwrap();
    std::fs::write(&file, "{\"v\":2}\n").unwrap();

    let chain_before = s.chain_len(&file).await;
    let opts = RestoreOptions { dry_run: true, ..Default::default() };
    let content = s.restore_checkpoint(&file, Some(0), &opts).await.unwrap();

    assert_eq!(content, "{\"v\":1}\n");
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "{\"v\":2}\n");
    assert_eq!(s.chain_len(&file).await, chain_before, "no backup checkpoint taken");
}

// ─── Test 4: restore to an instant ───────────────────────────────────────────

#[tokio::test]
async fn test_restore_to_timestamp_across_files() {
    let dir = TempDir::new().unwrap();
    let s = session(&dir.path().join("cp")).await;
    let file_a = dir.path().join("a.txt");
    let file_b = dir.path().join("b.txt");

    std::fs::write(&file_a, "a1\n").unwrap();
    s.create_checkpoint(&file_a, &CheckpointOptions::default()).await.unwrap();
    std::fs::write(&file_b, "b1\n").unwrap();
    s.create_checkpoint(&file_b, &CheckpointOptions::default()).await.unwrap();

    let instant = chrono::Utc::now().timestamp_millis();
    tokio::time::sleep(Duration::from_millis(10)).await;

    std::fs::write(&file_a, "a2\n").unwrap();
    s.track_file_edit(&file_a).await.unwrap();
    s.create_checkpoint(&file_a, &CheckpointOptions::default()).await.unwrap();
    std::fs::write(&file_b, "b2\n").unwrap();
    s.track_file_edit(&file_b).await.unwrap();
    s.create_checkpoint(&file_b, &CheckpointOptions::default()).await.unwrap();

    let opts = RestoreOptions { create_backup: false, ..Default::default() };
    let restored = s.restore_to_timestamp(instant, &opts).await.unwrap();

    assert_eq!(restored.len(), 2);
    assert_eq!(std::fs::read_to_string(&file_a).unwrap(), "a1\n");
    assert_eq!(std::fs::read_to_string(&file_b).unwrap(), "b1\n");
}

// ─── Test 5: storage cap ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_enforcement_brings_usage_under_the_cap() {
    let dir = TempDir::new().unwrap();
    let config = CheckpointConfig {
        max_storage_mb: 1,
        ..CheckpointConfig::new(dir.path().join("cp"))
    };
    let s = CheckpointSession::init(config, "/tmp/workspace").await.unwrap();
    let file = dir.path().join("generated.txt");

    for v in 0..30u64 {
        let content: String = (0..6000u64)
            .map(|i| format!("{v}:{:x}\n", i.wrapping_mul(2_654_435_761).rotate_left((v % 31) as u32)))
            .collect();
        std::fs::write(&file, &content).unwrap();
        s.create_checkpoint(
            &file,
            &CheckpointOptions { force_full_content: true, ..Default::default() },
        )
        .await
        .unwrap();
    }

    s.enforce_storage_limits().await.unwrap();
    assert!(s.storage_bytes().await <= 1024 * 1024);
    // The base element survives enforcement and still reconstructs.
    assert!(s.chain_len(&file).await >= 1);
    assert!(s.reconstruct(&file, 0).await.is_ok());
}
