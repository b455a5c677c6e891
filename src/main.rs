use std::fs;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use mira_cache::{cache_base_dir_custom, parse_cache_filename, CacheLayout, FileCache};
use mira_core::{parse_args, OutputFormat};
use mira_tree::{read_snapshot_file, render_json, render_tree, write_snapshot_file, EntryStore};

fn main() -> Result<()> {
    env_logger::init();
    let program_start = Instant::now();

    let args = parse_args();

    // ========================================================================
    // Locate Cache Directory & Load Snapshot
    // ========================================================================

    let base = cache_base_dir_custom(args.cache_dir.as_deref())?;
    let layout = CacheLayout::new(base, &args.account);
    let snapshot_path = layout.snapshot_path();

    if !snapshot_path.exists() {
        bail!(
            "no directory tree at {} - has a mirror session run for this account?",
            snapshot_path.display()
        );
    }

    let load_start = Instant::now();
    let mut store = read_snapshot_file(&snapshot_path)
        .with_context(|| format!("cannot load directory tree from {}", snapshot_path.display()))?;
    let load_elapsed = load_start.elapsed();
    log::info!(
        "loaded {} entries at device revision {}",
        store.len(),
        store.revision
    );

    // ========================================================================
    // Tree Output
    // ========================================================================

    if !args.quiet {
        let output = match args.format {
            OutputFormat::Tree => render_tree(&store, args.max_depth),
            OutputFormat::Json => render_json(&store, args.max_depth)?,
        };
        println!("{}", output);
    }

    // ========================================================================
    // Invariant Check & Cache Audit
    // ========================================================================

    let mut check_failed = false;
    if args.check {
        let violations = store.verify();
        if violations.is_empty() {
            println!("tree invariants: ok ({} entries)", store.len());
        } else {
            check_failed = true;
            eprintln!("tree invariants: {} violations", violations.len());
            for violation in &violations {
                eprintln!("  {}", violation);
            }
        }

        audit_cache(&layout, &store)?;
    }

    // ========================================================================
    // Cache Eviction
    // ========================================================================

    if args.evict {
        let files_dir = layout.files_dir();
        if files_dir.is_dir() {
            let cache = FileCache::new(files_dir);
            cache.cleanup(&mut store, args.budget)?;
            // eviction reset local revisions; keep the snapshot in step
            write_snapshot_file(&store, &snapshot_path)?;
            println!("cache evicted to {} bytes", args.budget);
        } else {
            println!("no content cache at {}", layout.files_dir().display());
        }
    }

    // ========================================================================
    // Statistics Output (Final Summary)
    // ========================================================================

    if args.stats {
        print_summary(&store, &snapshot_path, load_elapsed, program_start.elapsed());
    }

    if check_failed {
        std::process::exit(1);
    }

    Ok(())
}

/// Walk the content cache and report how it relates to the tree.
fn audit_cache(layout: &CacheLayout, store: &EntryStore) -> Result<()> {
    let files_dir = layout.files_dir();
    if !files_dir.is_dir() {
        println!("content cache: missing ({})", files_dir.display());
        return Ok(());
    }

    let mut cached = 0usize;
    let mut cached_bytes = 0u64;
    let mut stale = 0usize;
    let mut unknown = 0usize;
    let mut foreign = 0usize;

    for dir_entry in fs::read_dir(&files_dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let Some(name) = file_name.to_str() else {
            foreign += 1;
            continue;
        };

        let Some((key, revision)) = parse_cache_filename(name) else {
            foreign += 1;
            continue;
        };

        match store.lookup(&key).and_then(|id| store.get(id)) {
            Some(entry) if entry.remote_revision == revision => {
                cached += 1;
                cached_bytes += dir_entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
            Some(_) => stale += 1,
            None => unknown += 1,
        }
    }

    println!(
        "content cache: {} current ({} bytes), {} stale, {} unknown, {} foreign",
        cached, cached_bytes, stale, unknown, foreign
    );
    Ok(())
}

/// Print formatted summary block.
fn print_summary(
    store: &EntryStore,
    snapshot_path: &std::path::Path,
    load_time: std::time::Duration,
    total_time: std::time::Duration,
) {
    let mut folders = 0usize;
    let mut files = 0usize;
    for id in store.bucket_scan_ids() {
        match store.get(id) {
            Some(entry) if entry.is_folder() => folders += 1,
            Some(_) => files += 1,
            None => {}
        }
    }

    eprintln!("\n{}", "=".repeat(70));
    eprintln!("{:^70}", "MIRROR SUMMARY");
    eprintln!("{}", "=".repeat(70));

    eprintln!("\n{:<40} {}", "Device Revision:", store.revision);
    eprintln!("{:<40} {}", "Folders:", format_number(folders));
    eprintln!("{:<40} {}", "Files:", format_number(files));

    eprintln!("\n{:<40} {}", "Snapshot Load Time:", format_duration(load_time));
    eprintln!("{:<40} {}", "Total Time:", format_duration(total_time));

    eprintln!("\n{:<40} {}", "Snapshot Location:", snapshot_path.display());
    eprintln!("{}", "=".repeat(70));
    eprintln!();
}

/// Format duration in milliseconds.
fn format_duration(duration: std::time::Duration) -> String {
    format!("{:.3} MS", duration.as_secs_f64() * 1000.0)
}

/// Format large numbers with thousands separator.
fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.insert(0, ',');
        }
        result.insert(0, c);
    }
    result
}
