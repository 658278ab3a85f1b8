//! Expanding user file specs into ordered transfer plans
//!
//! The input list may name plain files, directories (with or without a
//! trailing separator), and URLs. Expansion recurses into directories up
//! to a bounded depth, drops domain sockets, never follows symlinked
//! directories, and never expands URLs. The resulting items carry the
//! total order from `stagehand-types`; the credential file rides outside
//! the ordered list so it always lands before any plugin can need it.

use std::path::{Path, PathBuf};

use stagehand_types::{Error, JobRecord, Result, TransferItem, EXEC_RENAME_BASENAME};
use tracing::{info, warn};

use crate::catalog::FileCatalog;

/// An ordered plan for one direction of one session
#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    /// The job credential, delegated ahead of every ordered item
    pub credential: Option<TransferItem>,
    /// Ordered transfer items
    pub items: Vec<TransferItem>,
}

impl TransferPlan {
    /// Total bytes of framed file payloads, the sandbox-size estimate
    /// advertised in xfer-info
    pub fn framed_bytes(&self) -> u64 {
        self.items
            .iter()
            .filter(|item| item.is_framed() && !item.is_directory)
            .map(|item| item.file_size.max(0) as u64)
            .sum()
    }

    /// Number of ordered items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the plan moves nothing
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.credential.is_none()
    }
}

/// Expand a job's input file list against its working directory
///
/// The executable, when declared, travels under its fixed staging
/// basename so the receiver can exclude it from output change detection.
pub fn build_input_plan(job: &JobRecord, iwd: &Path, max_depth: u32) -> Result<TransferPlan> {
    let mut plan = TransferPlan::default();

    if let Some(cred) = job.credential_path() {
        let full = absolutize(iwd, cred);
        let meta = std::fs::symlink_metadata(&full).map_err(|e| Error::ReadFailed {
            path: full.clone(),
            message: format!("credential file missing: {e}"),
        })?;
        plan.credential = Some(file_item(&full, &meta, Path::new("")));
    }

    for spec in job.input_files() {
        expand_spec(iwd, &spec, Path::new(""), max_depth, &mut plan.items)?;
    }

    if let Some(exec) = job.executable() {
        let full = absolutize(iwd, exec);
        let meta = std::fs::symlink_metadata(&full).map_err(|e| Error::ReadFailed {
            path: full.clone(),
            message: format!("executable missing: {e}"),
        })?;
        let mut item = file_item(&full, &meta, Path::new(""));
        item.dest_name = EXEC_RENAME_BASENAME.to_string();
        plan.items.push(item);
    }

    plan.items.sort();
    Ok(plan)
}

/// Build the output plan for a sandbox
///
/// With an explicit output list, exactly those names are planned. Without
/// one, everything new or changed relative to `baseline` goes (an empty
/// baseline means everything). On a final transfer the spooled
/// intermediate files from previous runs are always included. Remap rules
/// with URL targets and the job's output destination prefix turn items
/// into destination-URL transfers; plain remap targets rename the item on
/// the wire.
pub fn build_output_plan(
    job: &JobRecord,
    sandbox: &Path,
    baseline: Option<&FileCatalog>,
    final_transfer: bool,
) -> Result<TransferPlan> {
    let mut names = if !job.output_files().is_empty() {
        job.output_files()
    } else {
        let empty = FileCatalog::default();
        baseline.unwrap_or(&empty).changed_files(sandbox)?
    };

    if final_transfer {
        for spooled in job.spooled_intermediate_files() {
            if !names.contains(&spooled) {
                names.push(spooled);
            }
        }
    }

    let remaps = job.output_remaps();
    let destination = job.output_destination();

    let mut plan = TransferPlan::default();
    for name in names {
        let full = absolutize(sandbox, &name);
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("declared output {name} missing: {e}");
                continue;
            }
        };
        let mut item = file_item(&full, &meta, Path::new(""));

        let remapped = remaps
            .iter()
            .find(|(source, _)| *source == name)
            .map(|(_, target)| target.clone());
        match remapped {
            Some(target) if target.contains("://") => item.dest_url = target,
            Some(target) => item.dest_name = target,
            None => {
                if let Some(prefix) = destination {
                    item.dest_url = join_url(prefix, &name);
                }
            }
        }
        plan.items.push(item);
    }

    plan.items.sort();
    Ok(plan)
}

fn expand_spec(
    iwd: &Path,
    spec: &str,
    dest_dir: &Path,
    max_depth: u32,
    out: &mut Vec<TransferItem>,
) -> Result<()> {
    if spec.contains("://") {
        let scheme = spec.split("://").next().unwrap_or("").to_ascii_lowercase();
        out.push(TransferItem {
            src_name: spec.to_string(),
            src_scheme: scheme,
            dest_dir: dest_dir.to_path_buf(),
            ..TransferItem::local("")
        });
        return Ok(());
    }

    let contents_only = spec.ends_with('/');
    let trimmed = spec.trim_end_matches('/');
    let full = absolutize(iwd, trimmed);
    let meta = std::fs::symlink_metadata(&full).map_err(|e| Error::ReadFailed {
        path: full.clone(),
        message: e.to_string(),
    })?;

    if meta.is_dir() {
        if contents_only {
            expand_dir_contents(&full, dest_dir, max_depth, out)?;
        } else {
            let name = Path::new(trimmed)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| trimmed.to_string());
            out.push(dir_item(&full, &meta, dest_dir));
            expand_dir_contents(&full, &dest_dir.join(&name), max_depth, out)?;
        }
        return Ok(());
    }

    push_non_dir(&full, &meta, dest_dir, out);
    Ok(())
}

fn expand_dir_contents(
    dir: &Path,
    dest_dir: &Path,
    depth_left: u32,
    out: &mut Vec<TransferItem>,
) -> Result<()> {
    if depth_left == 0 {
        warn!("recursion limit reached under {}", dir.display());
        return Ok(());
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map_err(|e| Error::ReadFailed {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?
        .filter_map(|dent| dent.ok())
        .map(|dent| dent.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();

    for name in names {
        let full = dir.join(&name);
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if meta.is_dir() {
            out.push(dir_item(&full, &meta, dest_dir));
            expand_dir_contents(&full, &dest_dir.join(&name), depth_left - 1, out)?;
        } else {
            push_non_dir(&full, &meta, dest_dir, out);
        }
    }
    Ok(())
}

/// Append a non-directory entry, applying the symlinked-directory and
/// domain-socket exclusions
fn push_non_dir(
    full: &Path,
    meta: &std::fs::Metadata,
    dest_dir: &Path,
    out: &mut Vec<TransferItem>,
) {
    if meta.file_type().is_symlink() && full.metadata().map(|m| m.is_dir()).unwrap_or(false) {
        warn!("not following symlinked directory {}", full.display());
        return;
    }
    if is_domain_socket(meta) {
        info!("excluding domain socket {} from transfer", full.display());
        return;
    }
    out.push(file_item(full, meta, dest_dir));
}

fn file_item(full: &Path, meta: &std::fs::Metadata, dest_dir: &Path) -> TransferItem {
    let is_symlink = meta.file_type().is_symlink();
    // A symlink-to-file travels as its target's bytes; the link metadata
    // only describes the link itself.
    let (size, mode) = if is_symlink {
        match std::fs::metadata(full) {
            Ok(target) => (target.len() as i64, mode_of(&target)),
            Err(_) => (0, None),
        }
    } else {
        (meta.len() as i64, mode_of(meta))
    };
    let mut item = TransferItem::local(full.display().to_string());
    item.dest_dir = dest_dir.to_path_buf();
    item.file_mode = mode;
    item.file_size = size;
    item.is_symlink = is_symlink;
    item
}

fn dir_item(full: &Path, meta: &std::fs::Metadata, dest_dir: &Path) -> TransferItem {
    let mut item = TransferItem::local(full.display().to_string());
    item.dest_dir = dest_dir.to_path_buf();
    item.file_mode = mode_of(meta);
    item.is_directory = true;
    item
}

fn absolutize(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn join_url(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

#[cfg(unix)]
fn is_domain_socket(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_socket()
}

#[cfg(not(unix))]
fn is_domain_socket(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}
