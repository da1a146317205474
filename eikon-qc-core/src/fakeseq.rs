//! Zero-byte frame sequence generator for exercising the crawler.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::SystemTime,
};

use tracing::debug;

use crate::error::{QcError, Result};

/// Naming template `<base>.<zero padded frame>.<ext>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameTemplate {
    pub base: String,
    pub pad: usize,
    pub ext: String,
}

impl FrameTemplate {
    /// Infer the template from a sample such as `trailer_las.087469.tif`.
    pub fn from_sample(sample: &str) -> Result<Self> {
        let name = Path::new(sample)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(sample);

        let mut parts = name.rsplitn(3, '.');
        let (Some(ext), Some(frame), Some(base)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(QcError::Config(format!(
                "sample {sample:?} must look like <base>.<frame>.<ext>"
            )));
        };
        if frame.is_empty() || !frame.bytes().all(|b| b.is_ascii_digit()) {
            return Err(QcError::Config(format!(
                "sample {sample:?} frame segment must be all digits"
            )));
        }

        Ok(Self {
            base: base.to_string(),
            pad: frame.len(),
            ext: ext.to_string(),
        })
    }

    pub fn file_name(&self, frame: u64) -> String {
        format!("{}.{:0pad$}.{}", self.base, frame, self.ext, pad = self.pad)
    }
}

/// Inclusive frame range with a positive step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u64,
    pub end: u64,
    pub step: u64,
}

impl FrameRange {
    pub fn frames(&self) -> Result<impl Iterator<Item = u64>> {
        if self.step == 0 {
            return Err(QcError::Config("frame step must be positive".to_string()));
        }
        let step = usize::try_from(self.step)
            .map_err(|_| QcError::Config(format!("frame step {} is too large", self.step)))?;
        Ok((self.start..=self.end).step_by(step))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeSeqReport {
    pub created: usize,
    pub skipped: usize,
    /// Paths that would be written, on a dry run.
    pub planned: Vec<PathBuf>,
}

/// Create the frames in `out_dir`. Existing frames are skipped, or have
/// their mtime bumped when `touch_existing` is set.
pub fn make_sequence(
    out_dir: &Path,
    template: &FrameTemplate,
    range: FrameRange,
    dry_run: bool,
    touch_existing: bool,
) -> Result<FakeSeqReport> {
    let frames = range.frames()?;
    let mut report = FakeSeqReport::default();

    if dry_run {
        report.planned = frames.map(|f| out_dir.join(template.file_name(f))).collect();
        for path in &report.planned {
            debug!("[DRY] {}", path.display());
        }
        return Ok(report);
    }

    fs::create_dir_all(out_dir).map_err(|e| QcError::io(out_dir, e))?;
    for frame in frames {
        let path = out_dir.join(template.file_name(frame));
        if path.exists() {
            if touch_existing {
                File::options()
                    .write(true)
                    .open(&path)
                    .and_then(|file| file.set_modified(SystemTime::now()))
                    .map_err(|e| QcError::io(&path, e))?;
            }
            report.skipped += 1;
            continue;
        }
        File::create(&path).map_err(|e| QcError::io(&path, e))?;
        report.created += 1;
    }
    Ok(report)
}
