//! Human-readable rendering of sidecars.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    path::{Path, PathBuf},
};

use tracing::warn;

use crate::{
    run::find_sidecars,
    sidecar::{QcResult, SIDECAR_SUBDIR, SidecarRecord, SidecarStore},
};

pub const DEFAULT_MAX_NOTE_LEN: usize = 160;

pub fn status_icon(result: &QcResult) -> &'static str {
    match result {
        QcResult::Pass => "✅",
        QcResult::Fail => "❌",
        QcResult::Pending => "⏳",
        QcResult::Other(_) => "❓",
    }
}

/// Per-status counts. Verdicts written by other tools land in `other`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pass: usize,
    pub fail: usize,
    pub pending: usize,
    pub other: usize,
}

impl StatusCounts {
    pub fn add(&mut self, result: &QcResult) {
        match result {
            QcResult::Pass => self.pass += 1,
            QcResult::Fail => self.fail += 1,
            QcResult::Pending => self.pending += 1,
            QcResult::Other(_) => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.pending + self.other
    }

    /// FAIL outranks PENDING (or anything unrecognised) outranks PASS.
    pub fn overall(&self) -> QcResult {
        if self.fail > 0 {
            QcResult::Fail
        } else if self.pending > 0 || self.other > 0 || self.pass == 0 {
            QcResult::Pending
        } else {
            QcResult::Pass
        }
    }
}

/// `"Summary: 4 items – 1 PASS, 3 PENDING"`.
pub fn format_rollup(counts: &StatusCounts, prefix: &str) -> String {
    let total = counts.total();
    if total == 0 {
        return format!("{prefix}no items.");
    }

    let details: Vec<String> = [
        (counts.pass, "PASS"),
        (counts.fail, "FAIL"),
        (counts.pending, "PENDING"),
        (counts.other, "OTHER"),
    ]
    .into_iter()
    .filter(|(count, _)| *count > 0)
    .map(|(count, label)| format!("{count} {label}"))
    .collect();

    format!(
        "{prefix}{total} item{} – {}",
        if total == 1 { "" } else { "s" },
        details.join(", ")
    )
}

fn truncate_note(note: &str, max_len: Option<usize>) -> String {
    match max_len {
        Some(max) if note.chars().count() > max => {
            let kept: String = note.chars().take(max.saturating_sub(1)).collect();
            format!("{}…", kept.trim_end())
        }
        _ => note.to_string(),
    }
}

/// Multi-line block describing one sidecar.
pub fn render_sidecar(record: &SidecarRecord, path: &Path, max_note_len: Option<usize>) -> String {
    let status = &record.qc_result;
    let asset_path = record
        .asset_path
        .clone()
        .unwrap_or_else(|| path.display().to_string());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} – {}",
        status_icon(status),
        status.as_str().to_uppercase(),
        asset_path
    );
    let _ = writeln!(out, "   Sidecar:      {}", path.display());
    if let Some(asset_id) = &record.asset_id {
        let _ = writeln!(out, "   Trak asset:   {asset_id}");
    }
    let _ = writeln!(
        out,
        "   Operator:     {}",
        record.operator.as_deref().unwrap_or("Unknown")
    );
    let _ = writeln!(
        out,
        "   QC time:      {}",
        record.qc_time.as_deref().unwrap_or("Unknown time")
    );
    let _ = writeln!(
        out,
        "   Policy/tool:  {} / {}",
        record.policy_version.as_deref().unwrap_or("n/a"),
        record.tool_version.as_deref().unwrap_or("n/a")
    );

    if let Some(seq) = &record.sequence {
        let mut parts = Vec::new();
        if let (Some(min), Some(max)) = (seq.frame_min, seq.frame_max) {
            parts.push(format!("{min}–{max}"));
        }
        parts.push(format!("{} frames", seq.frame_count));
        if let Some(holes) = seq.holes {
            parts.push(format!("{holes} holes"));
        }
        if let Some(pad) = seq.pad {
            parts.push(format!("pad={pad}"));
        }
        let base = if seq.base.is_empty() { "<unknown>" } else { seq.base.as_str() };
        let _ = writeln!(out, "   Sequence:");
        let _ = writeln!(out, "      {}.{}  ({})", base, seq.ext, parts.join(", "));
    }

    if !record.notes.is_empty() {
        let _ = writeln!(out, "   Note:         {}", truncate_note(&record.notes, max_note_len));
    }

    out.truncate(out.trim_end().len());
    out
}

/// Directory a sidecar describes: the parent of `.qc/` in subdir mode.
pub fn group_dir(sidecar: &Path) -> PathBuf {
    let parent = sidecar.parent().unwrap_or_else(|| Path::new(""));
    if parent.file_name().is_some_and(|name| name == SIDECAR_SUBDIR) {
        parent.parent().unwrap_or(parent).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

/// Sidecars named by `paths`: files are taken as-is, directories are
/// searched recursively.
pub fn collect_sidecars(store: &SidecarStore, paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for path in paths {
        if path.is_file() {
            let looks_right = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| store.is_sidecar_name(name));
            if looks_right {
                found.push(path.clone());
            } else {
                warn!("File does not look like a sidecar: {}", path.display());
            }
        } else if path.is_dir() {
            found.extend(find_sidecars(store, path));
        } else {
            warn!("Not found or unsupported path: {}", path.display());
        }
    }
    found.sort();
    found.dedup();
    found
}

/// Rendered summary plus the overall counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SummaryReport {
    pub text: String,
    pub counts: StatusCounts,
}

/// Render every readable sidecar under `paths`. `None` when no sidecar
/// files were found at all.
pub fn summarize(
    store: &SidecarStore,
    paths: &[PathBuf],
    max_note_len: Option<usize>,
    by_dir: bool,
) -> Option<SummaryReport> {
    let sidecars = collect_sidecars(store, paths);
    if sidecars.is_empty() {
        return None;
    }

    let records: Vec<(PathBuf, SidecarRecord)> = sidecars
        .into_iter()
        .filter_map(|path| match store.read(&path) {
            Some(record) => Some((path, record)),
            None => {
                warn!("Failed to load sidecar {}", path.display());
                None
            }
        })
        .collect();

    let mut counts = StatusCounts::default();
    let mut blocks = Vec::new();

    if by_dir {
        let mut groups: BTreeMap<String, (PathBuf, Vec<&SidecarRecord>)> = BTreeMap::new();
        for (path, record) in &records {
            counts.add(&record.qc_result);
            let dir = group_dir(path);
            groups
                .entry(dir.display().to_string().to_lowercase())
                .or_insert_with(|| (dir, Vec::new()))
                .1
                .push(record);
        }

        for (dir, members) in groups.values() {
            let mut group_counts = StatusCounts::default();
            for record in members {
                group_counts.add(&record.qc_result);
            }
            let header = members
                .first()
                .map(|record| display_path_for_group(dir, record))
                .unwrap_or_else(|| dir.display().to_string());
            blocks.push(format!(
                "{} {}\n{}",
                status_icon(&group_counts.overall()),
                header,
                format_rollup(&group_counts, "   ")
            ));
        }
    } else {
        for (path, record) in &records {
            counts.add(&record.qc_result);
            blocks.push(render_sidecar(record, path, max_note_len));
        }
    }

    let mut text = blocks.join("\n\n");
    text.push_str("\n\n");
    text.push_str(&format_rollup(&counts, "Summary: "));
    Some(SummaryReport { text, counts })
}

fn display_path_for_group(dir: &Path, record: &SidecarRecord) -> String {
    let Some(raw) = record.asset_path.as_deref() else {
        return dir.display().to_string();
    };
    let asset = Path::new(raw);
    let dir_name = dir.file_name();
    if asset.file_name() == dir_name {
        raw.to_string()
    } else if let Some(parent) = asset.parent()
        && parent.file_name() == dir_name
    {
        parent.display().to_string()
    } else {
        raw.to_string()
    }
}
