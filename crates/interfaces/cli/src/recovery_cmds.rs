use std::io;
use std::io::IsTerminal;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};

use salvage_config::AppConfig;
use salvage_recovery::atomic::write_atomic;
use salvage_recovery::{
    DirtyRegister, DocumentId, DurableWriter, EpochMillis, PreviewError, RecoverableDocument,
    RecoveryManager, RetentionPolicy, VolumeSpaceProbe, now_ms,
};

/// Opens the configured recovery store and reconciles it: crash debris is
/// swept and orphaned records are re-indexed before anything is listed.
pub(crate) async fn open_manager(config: &AppConfig) -> Result<RecoveryManager> {
    let dir = config.recovery_dir();
    let writer = DurableWriter::open(
        dir.clone(),
        Arc::new(VolumeSpaceProbe),
        config.autosave.min_free_space_bytes(),
    )
    .await
    .with_context(|| format!("opening recovery directory {}", dir.display()))?;
    let manager = RecoveryManager::new(Arc::new(writer), Arc::new(DirtyRegister::new()));
    manager
        .startup_maintenance()
        .await
        .context("reconciling recovery directory")?;
    Ok(manager)
}

pub(crate) async fn run_status(manager: &RecoveryManager, config: &AppConfig) {
    let check = manager.check_for_recovery().await;
    let writer = manager.writer();
    let bytes = writer.storage_bytes().await;

    println!("── recovery status ──────────────────────────────────");
    println!("  directory:      {}", writer.dir().display());
    println!("  recoverable:    {}", check.count);
    println!("  storage used:   {}", format_bytes(bytes));
    println!();
    println!("── autosave settings ────────────────────────────────");
    println!("  enabled:        {}", config.autosave.enabled);
    println!("  interval:       {} ms", config.autosave.interval_ms);
    println!("  retention:      {} days", config.autosave.retention_days);
    println!("  max files:      {}", config.autosave.max_files);
    println!("  max storage:    {} MB", config.autosave.max_storage_mb);
    println!("  min free space: {} MB", config.autosave.min_free_space_mb);
    println!("  debounce:       {} ms", config.watcher.debounce_ms);
}

pub(crate) async fn run_list(manager: &RecoveryManager, verify: bool) {
    let documents = manager.list_recoverable().await;
    if documents.is_empty() {
        println!("nothing to recover");
        return;
    }

    println!("recoverable documents ({})", documents.len());
    for (index, doc) in documents.iter().enumerate() {
        let marker = if verify {
            match manager.get_preview(doc.document_id).await {
                Ok(_) => " ok",
                Err(err) if err.is_corrupted() => " CORRUPTED",
                Err(PreviewError::NotFound(_)) => " MISSING",
                Err(_) => " UNREADABLE",
            }
        } else {
            ""
        };
        println!(
            "{}. {} [{}]{marker}",
            index + 1,
            doc.display_name,
            format_timestamp(doc.saved_at_ms)
        );
        println!("   id:     {}", doc.document_id);
        println!("   origin: {}", doc.origin);
    }
}

pub(crate) async fn run_preview(manager: &RecoveryManager, id: DocumentId, lines: Option<usize>) -> Result<()> {
    let preview = manager
        .get_preview(id)
        .await
        .with_context(|| format!("previewing {id}"))?;

    println!("── {} ──", preview.document.display_name);
    println!("origin:   {}", preview.document.origin);
    println!("saved at: {}", format_timestamp(preview.document.saved_at_ms));
    if let Some(conflict) = &preview.conflict {
        let changed_at = conflict
            .on_disk_modified_at_ms
            .map(format_timestamp)
            .unwrap_or_else(|| "unknown".to_string());
        println!("note: {} changed after this snapshot was taken ({changed_at})", conflict.path.display());
    }
    println!();

    match lines {
        Some(limit) => {
            let total = preview.content.lines().count();
            for line in preview.content.lines().take(limit) {
                println!("{line}");
            }
            if total > limit {
                println!("… ({} more lines)", total - limit);
            }
        }
        None => println!("{}", preview.content),
    }
    Ok(())
}

/// Writes each selected document to `output` and only then removes its
/// recovery record. Unreadable records are reported and kept. Fails if a
/// record was written out but could not be removed afterwards.
pub(crate) async fn run_restore(
    manager: &RecoveryManager,
    ids: Vec<DocumentId>,
    all: bool,
    output: &Path,
) -> Result<()> {
    let targets = resolve_targets(manager, ids, all).await?;
    if targets.is_empty() {
        println!("nothing to restore");
        return Ok(());
    }

    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    let mut restored = 0usize;
    let mut failed = 0usize;
    let mut uncleared = 0usize;
    for id in targets {
        let preview = match manager.get_preview(id).await {
            Ok(preview) => preview,
            Err(err) => {
                eprintln!("skipping {id}: {err}");
                failed += 1;
                continue;
            }
        };

        let dest = output.join(restored_file_name(&preview.document));
        write_atomic(&dest, preview.content.as_bytes())
            .await
            .with_context(|| format!("writing {}", dest.display()))?;
        let cleared = manager.discard_recovery([id]).await;
        if let Some((_, err)) = cleared.failed.first() {
            eprintln!(
                "wrote {} -> {} but could not clear its recovery record: {err}",
                preview.document.display_name,
                dest.display()
            );
            uncleared += 1;
            continue;
        }
        println!("restored {} -> {}", preview.document.display_name, dest.display());
        restored += 1;
    }

    println!("restore complete: {restored} restored, {failed} kept");
    if uncleared > 0 {
        bail!("{uncleared} records were written out but are still in recovery storage");
    }
    Ok(())
}

pub(crate) async fn run_discard(
    manager: &RecoveryManager,
    ids: Vec<DocumentId>,
    all: bool,
    yes: bool,
) -> Result<()> {
    let targets = resolve_targets(manager, ids, all).await?;
    if targets.is_empty() {
        println!("nothing to discard");
        return Ok(());
    }

    println!("⚠️  destructive operation: discard recovery data");
    println!("- targeted documents: {}", targets.len());

    if !yes {
        if !io::stdin().is_terminal() {
            bail!("refusing to discard recovery data in non-interactive mode without --yes");
        }
        print!("This permanently deletes unsaved work. Type 'DISCARD' to continue: ");
        io::stdout().flush()?;

        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim() != "DISCARD" {
            println!("discard cancelled");
            return Ok(());
        }
    }

    let outcome = manager.discard_recovery(targets).await;
    for (id, err) in &outcome.failed {
        eprintln!("could not discard {id}: {err}");
    }
    println!("discard complete: removed {} records", outcome.discarded_count);
    if !outcome.failed.is_empty() {
        bail!("{} records could not be discarded", outcome.failed.len());
    }
    Ok(())
}

pub(crate) async fn run_prune(manager: &RecoveryManager, config: &AppConfig) -> Result<()> {
    let policy = RetentionPolicy {
        retention_days: config.autosave.retention_days,
        max_files: config.autosave.max_files,
        max_storage_bytes: config.autosave.max_storage_bytes(),
    };
    let summary = manager
        .writer()
        .prune(policy, &Default::default(), now_ms())
        .await
        .context("pruning recovery data")?;

    println!("prune complete: removed {} records", summary.total());
    println!("- expired:        {}", summary.expired);
    println!("- over file cap:  {}", summary.over_count);
    println!("- over size cap:  {}", summary.over_size);
    Ok(())
}

async fn resolve_targets(manager: &RecoveryManager, ids: Vec<DocumentId>, all: bool) -> Result<Vec<DocumentId>> {
    if all {
        return Ok(manager
            .list_recoverable()
            .await
            .into_iter()
            .map(|doc| doc.document_id)
            .collect());
    }
    if ids.is_empty() {
        bail!("pass one or more document ids, or --all");
    }
    Ok(ids)
}

/// `<short id>-<display name>` with path separators and other awkward
/// characters replaced, so two documents never collide on one name.
fn restored_file_name(doc: &RecoverableDocument) -> PathBuf {
    let id = doc.document_id.as_uuid().simple().to_string();
    let short = &id[..8];
    let name: String = doc
        .display_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let name = name.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if name.is_empty() {
        PathBuf::from(format!("{short}-untitled"))
    } else {
        PathBuf::from(format!("{short}-{name}"))
    }
}

fn format_timestamp(ms: EpochMillis) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{ms} ms"))
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
