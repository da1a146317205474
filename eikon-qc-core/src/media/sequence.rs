use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;

use super::is_sequence_candidate;

/// `base` + `frame digits` + `.` + `ext`, with the shortest possible base.
static FRAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.*?)(?P<frame>\d+)\.(?P<ext>[^.]+)$")
        .expect("frame pattern should compile")
});

struct FrameName<'a> {
    base: &'a str,
    frame: &'a str,
    ext: &'a str,
}

fn parse_frame_name(name: &str) -> Option<FrameName<'_>> {
    let caps = FRAME_PATTERN.captures(name)?;
    Some(FrameName {
        base: caps.name("base")?.as_str(),
        frame: caps.name("frame")?.as_str(),
        ext: caps.name("ext")?.as_str(),
    })
}

/// Identity of one frame sequence: directory plus the raw `base` (usually
/// with its trailing dot) and `ext` captured from frame names.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceKey {
    pub dir: PathBuf,
    pub base: String,
    pub ext: String,
}

impl SequenceKey {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
            ext: ext.into(),
        }
    }

    /// Key for `path` if its name looks like a frame.
    pub fn for_frame(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let parsed = parse_frame_name(name)?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        Some(Self::new(dir, parsed.base, parsed.ext))
    }

    /// Base without its trailing `.`, as stored in sidecars.
    pub fn normalized_base(&self) -> &str {
        self.base.strip_suffix('.').unwrap_or(&self.base)
    }

    /// Extension without a leading `.`.
    pub fn normalized_ext(&self) -> &str {
        self.ext.strip_prefix('.').unwrap_or(&self.ext)
    }

    /// Glob-like path naming the whole sequence, e.g. `dir/shot*.exr`.
    pub fn representative_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}*.{}",
            self.normalized_base(),
            self.normalized_ext()
        ))
    }

    /// Whether `name` is a frame of this sequence.
    pub fn matches(&self, name: &str) -> bool {
        parse_frame_name(name).is_some_and(|f| f.base == self.base && f.ext == self.ext)
    }

    /// Frame number digits of `name`, when it belongs to this sequence.
    pub fn frame_id(&self, name: &str) -> Option<String> {
        parse_frame_name(name)
            .filter(|f| f.base == self.base && f.ext == self.ext)
            .map(|f| f.frame.to_string())
    }
}

/// Output of [`group_sequences`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceGroups {
    /// Frames per sequence, sorted by path.
    pub sequences: BTreeMap<SequenceKey, Vec<PathBuf>>,
    pub singles: Vec<PathBuf>,
}

/// Split `files` into sequences of at least `min_seq` frames and loose files.
pub fn group_sequences(files: &[PathBuf], min_seq: usize) -> SequenceGroups {
    let mut candidates: BTreeMap<SequenceKey, Vec<PathBuf>> = BTreeMap::new();
    let mut singles = Vec::new();

    for path in files {
        match is_sequence_candidate(path)
            .then(|| SequenceKey::for_frame(path))
            .flatten()
        {
            Some(key) => candidates.entry(key).or_default().push(path.clone()),
            None => singles.push(path.clone()),
        }
    }

    let mut sequences = BTreeMap::new();
    for (key, mut frames) in candidates {
        if frames.len() >= min_seq {
            frames.sort();
            sequences.insert(key, frames);
        } else {
            singles.extend(frames);
        }
    }
    singles.sort();

    SequenceGroups { sequences, singles }
}

/// Range statistics over frame file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSummary {
    pub frame_min: u64,
    pub frame_max: u64,
    /// Digit count of the first frame name seen.
    pub pad: usize,
    pub frame_count: usize,
    /// Number of contiguous runs.
    pub range_count: usize,
    /// Frame numbers missing between `frame_min` and `frame_max`.
    pub holes: u64,
}

pub fn summarize_frames<S: AsRef<str>>(names: &[S]) -> Option<FrameSummary> {
    let mut frames = Vec::with_capacity(names.len());
    let mut pad = None;

    for name in names {
        let Some(parsed) = parse_frame_name(name.as_ref()) else {
            continue;
        };
        let Ok(number) = parsed.frame.parse::<u64>() else {
            continue;
        };
        frames.push(number);
        pad.get_or_insert(parsed.frame.len());
    }

    frames.sort_unstable();
    let (&first, &last) = (frames.first()?, frames.last()?);

    let mut range_count = 1;
    let mut holes = 0;
    for pair in frames.windows(2) {
        let gap = pair[1] - pair[0];
        if gap > 1 {
            range_count += 1;
            holes += gap - 1;
        }
    }

    Some(FrameSummary {
        frame_min: first,
        frame_max: last,
        pad: pad.unwrap_or(0),
        frame_count: frames.len(),
        range_count,
        holes,
    })
}
