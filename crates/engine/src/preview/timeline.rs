//! Chunk and section geometry for chunked preview, and the timeline built
//! from whatever is currently on disk.

use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const CHUNKS_DIR: &str = "chunks";
pub const SECTIONS_DIR: &str = "sections";

/// Fixed chunk/section division of one source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLayout {
    entry_dir: PathBuf,
    duration: f64,
    chunk_secs: f64,
    section_chunks: u32,
}

impl ChunkLayout {
    pub fn new(entry_dir: &Path, duration: f64, chunk_secs: f64, section_chunks: u32) -> Self {
        let chunk_secs = if chunk_secs.is_finite() && chunk_secs > 0.0 {
            chunk_secs
        } else {
            15.0
        };
        Self {
            entry_dir: entry_dir.to_path_buf(),
            duration: if duration.is_finite() { duration.max(0.0) } else { 0.0 },
            chunk_secs,
            section_chunks: section_chunks.max(1),
        }
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn chunk_secs(&self) -> f64 {
        self.chunk_secs
    }

    pub fn chunk_count(&self) -> u32 {
        ((self.duration / self.chunk_secs).ceil() as u32).max(1)
    }

    pub fn section_count(&self) -> u32 {
        self.chunk_count().div_ceil(self.section_chunks)
    }

    /// `floor(t / chunk_secs)`, clamped to the chunks that exist.
    pub fn chunk_index(&self, t: f64) -> u32 {
        if !t.is_finite() || t <= 0.0 {
            return 0;
        }
        ((t / self.chunk_secs).floor() as u32).min(self.chunk_count() - 1)
    }

    pub fn section_of(&self, chunk: u32) -> u32 {
        chunk / self.section_chunks
    }

    /// Chunk indices belonging to a section; the last section may be short.
    pub fn chunks_in_section(&self, section: u32) -> Range<u32> {
        let start = section * self.section_chunks;
        start..(start + self.section_chunks).min(self.chunk_count())
    }

    /// Start time and length of a chunk.
    pub fn chunk_span(&self, chunk: u32) -> (f64, f64) {
        let start = f64::from(chunk) * self.chunk_secs;
        let len = (self.duration - start).min(self.chunk_secs).max(0.0);
        (start, len)
    }

    pub fn section_span(&self, section: u32) -> (f64, f64) {
        let chunks = self.chunks_in_section(section);
        let (start, _) = self.chunk_span(chunks.start);
        let len = chunks.map(|c| self.chunk_span(c).1).sum();
        (start, len)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.entry_dir.join(CHUNKS_DIR)
    }

    pub fn sections_dir(&self) -> PathBuf {
        self.entry_dir.join(SECTIONS_DIR)
    }

    pub fn chunk_path(&self, chunk: u32) -> PathBuf {
        self.chunks_dir().join(format!("preview_chunk_{}.mp4", chunk))
    }

    pub fn section_path(&self, section: u32) -> PathBuf {
        self.sections_dir().join(format!("preview_section_{}.mp4", section))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum SegmentSource {
    Chunk(u32),
    Section(u32),
}

/// One file placed on the video track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSegment {
    pub start: f64,
    pub duration: f64,
    pub path: PathBuf,
    pub source: SegmentSource,
}

impl TimelineSegment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    /// Segments in time order, never overlapping
    pub segments: Vec<TimelineSegment>,
    /// Sections marked concatenated whose file is gone
    pub demoted_sections: Vec<u32>,
    /// Resident chunks whose file is gone
    pub missing_chunks: Vec<u32>,
}

impl Timeline {
    pub fn segment_at(&self, t: f64) -> Option<&TimelineSegment> {
        self.segments.iter().find(|s| s.contains(t))
    }
}

/// Lay out the video track from scratch.
///
/// A concatenated section whose file exists covers its whole range. Any
/// other range is covered chunk by chunk from resident files.
pub fn build_timeline(
    layout: &ChunkLayout,
    resident: &BTreeSet<u32>,
    concatenated: &BTreeSet<u32>,
    exists: impl Fn(&Path) -> bool,
) -> Timeline {
    let mut timeline = Timeline::default();

    for section in 0..layout.section_count() {
        if concatenated.contains(&section) {
            let path = layout.section_path(section);
            if exists(&path) {
                let (start, duration) = layout.section_span(section);
                timeline.segments.push(TimelineSegment {
                    start,
                    duration,
                    path,
                    source: SegmentSource::Section(section),
                });
                continue;
            }
            timeline.demoted_sections.push(section);
        }

        for chunk in layout.chunks_in_section(section) {
            if !resident.contains(&chunk) {
                continue;
            }
            let path = layout.chunk_path(chunk);
            if !exists(&path) {
                timeline.missing_chunks.push(chunk);
                continue;
            }
            let (start, duration) = layout.chunk_span(chunk);
            timeline.segments.push(TimelineSegment {
                start,
                duration,
                path,
                source: SegmentSource::Chunk(chunk),
            });
        }
    }
    timeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layout() -> ChunkLayout {
        // 100s: chunks 0..=6, sections of 3 -> {0,1,2} {3,4,5} {6}
        ChunkLayout::new(Path::new("/cache/abc"), 100.0, 15.0, 3)
    }

    #[test]
    fn test_geometry() {
        let l = layout();
        assert_eq!(l.chunk_count(), 7);
        assert_eq!(l.section_count(), 3);
        assert_eq!(l.chunk_index(0.0), 0);
        assert_eq!(l.chunk_index(14.99), 0);
        assert_eq!(l.chunk_index(15.0), 1);
        assert_eq!(l.chunk_index(99.0), 6);
        assert_eq!(l.chunk_index(5000.0), 6);
        assert_eq!(l.chunk_index(-3.0), 0);
        assert_eq!(l.chunk_index(f64::NAN), 0);
        assert_eq!(l.section_of(5), 1);
        assert_eq!(l.chunks_in_section(2), 6..7);
        assert_eq!(l.chunk_span(6), (90.0, 10.0));
        assert_eq!(l.section_span(1), (45.0, 45.0));
        assert_eq!(l.section_span(2), (90.0, 10.0));
        assert_eq!(
            l.chunk_path(4),
            PathBuf::from("/cache/abc/chunks/preview_chunk_4.mp4")
        );
        assert_eq!(
            l.section_path(1),
            PathBuf::from("/cache/abc/sections/preview_section_1.mp4")
        );
    }

    #[test]
    fn test_section_replaces_its_chunks() {
        let l = layout();
        let resident: BTreeSet<u32> = [0, 1, 2, 4].into();
        let concatenated: BTreeSet<u32> = [0].into();
        let t = build_timeline(&l, &resident, &concatenated, |_| true);

        let sources: Vec<SegmentSource> = t.segments.iter().map(|s| s.source).collect();
        assert_eq!(sources, vec![SegmentSource::Section(0), SegmentSource::Chunk(4)]);
        assert_eq!(t.segment_at(20.0).unwrap().source, SegmentSource::Section(0));
        assert_eq!(t.segment_at(61.0).unwrap().source, SegmentSource::Chunk(4));
        assert!(t.segment_at(50.0).is_none());
    }

    #[test]
    fn test_missing_section_is_demoted() {
        let l = layout();
        let resident: BTreeSet<u32> = [1].into();
        let concatenated: BTreeSet<u32> = [0].into();
        let section = l.section_path(0);
        let t = build_timeline(&l, &resident, &concatenated, |p| p != section);

        assert_eq!(t.demoted_sections, vec![0]);
        assert_eq!(t.segments.len(), 1);
        assert_eq!(t.segments[0].source, SegmentSource::Chunk(1));
    }

    #[test]
    fn test_missing_chunk_is_reported() {
        let l = layout();
        let resident: BTreeSet<u32> = [0, 1].into();
        let gone = l.chunk_path(1);
        let t = build_timeline(&l, &resident, &BTreeSet::new(), |p| p != gone);
        assert_eq!(t.missing_chunks, vec![1]);
        assert_eq!(t.segments.len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_section_or_chunk_never_both(
            resident in proptest::collection::btree_set(0u32..7, 0..7),
            concatenated in proptest::collection::btree_set(0u32..3, 0..3),
            section_files in proptest::collection::vec(any::<bool>(), 3),
        ) {
            let l = layout();
            let exists = |p: &Path| {
                (0..3).all(|s| p != l.section_path(s) || section_files[s as usize])
            };
            let t = build_timeline(&l, &resident, &concatenated, exists);

            for pair in t.segments.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].start + 1e-9);
            }
            for seg in &t.segments {
                match seg.source {
                    SegmentSource::Section(s) => {
                        prop_assert!(concatenated.contains(&s) && section_files[s as usize]);
                    }
                    SegmentSource::Chunk(c) => {
                        let s = l.section_of(c);
                        prop_assert!(resident.contains(&c));
                        prop_assert!(!(concatenated.contains(&s) && section_files[s as usize]));
                    }
                }
            }
        }
    }
}
