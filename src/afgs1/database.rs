use std::{fs::read_to_string, path::Path};

use anyhow::{bail, Context, Result};
use log::debug;
use num_rational::Rational64;

use super::{
    params::FilmGrainParams,
    table::{parse_table, GrainTableSegment},
};

/// Number of parameter-set slots a conforming decoder maintains.
pub const MAX_PARAM_SETS: usize = 8;

// The filmgrn1 timestamp base: 100-nanosecond ticks, 1/10000000 of a second.
pub const TIMESTAMP_BASE_UNIT: u64 = 10_000_000;

/// Maps a picture order count to the presentation time scale used by
/// filmgrn1 files.
#[must_use]
pub fn presentation_time(poc: u64, frame_rate: Rational64) -> u64 {
    poc * TIMESTAMP_BASE_UNIT * frame_rate.denom().unsigned_abs()
        / frame_rate.numer().unsigned_abs()
}

/// Hands out `film_grain_param_set_idx` values, one per loaded table.
///
/// Owned by the driver rather than being process state, so a fresh run (or
/// test) starts numbering from zero again.
#[derive(Debug, Default)]
pub struct ParamSetIndexAllocator {
    next: u8,
}

impl ParamSetIndexAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Result<u8> {
        if usize::from(self.next) >= MAX_PARAM_SETS {
            bail!("At most {MAX_PARAM_SETS} film grain parameter tables can be loaded");
        }
        let idx = self.next;
        self.next += 1;
        Ok(idx)
    }
}

#[derive(Debug, Clone)]
struct Record {
    start_time: i64,
    end_time: i64,
    params: FilmGrainParams,
}

/// Film grain parameter sets indexed by presentation time and resolution.
#[derive(Debug, Default)]
pub struct GrainDatabase {
    records: Vec<Record>,
}

impl GrainDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a filmgrn1 file and appends its records, annotated with the
    /// given resolution and a freshly allocated parameter set index.
    pub fn load_table(
        &mut self,
        path: &Path,
        width: u16,
        height: u16,
        allocator: &mut ParamSetIndexAllocator,
    ) -> Result<()> {
        let idx = allocator.allocate()?;
        let data = read_to_string(path)
            .with_context(|| format!("Unable to open film grain table {}", path.display()))?;
        let segments = parse_table(&data)
            .with_context(|| format!("In film grain table {}", path.display()))?;
        debug!(
            "Loaded {} segments from {} as parameter set {} ({}x{})",
            segments.len(),
            path.display(),
            idx,
            width,
            height
        );
        for segment in segments {
            let GrainTableSegment {
                start_time,
                end_time,
                mut grain_params,
            } = segment;
            grain_params.apply_horz_resolution = width;
            grain_params.apply_vert_resolution = height;
            grain_params.subsampling_x = true;
            grain_params.subsampling_y = true;
            grain_params.video_signal_characteristics_flag = false;
            grain_params.film_grain_param_set_idx = idx;
            self.records.push(Record {
                start_time,
                end_time,
                params: grain_params,
            });
        }
        Ok(())
    }

    /// All parameter sets whose `[start_time, end_time)` window covers
    /// `time`, cloned, in insertion order.
    #[must_use]
    pub fn find_frames(&self, time: u64) -> Vec<FilmGrainParams> {
        let time = i64::try_from(time).unwrap_or(i64::MAX);
        self.records
            .iter()
            .filter(|record| record.start_time <= time && time < record.end_time)
            .map(|record| record.params.clone())
            .collect()
    }

    /// Every stored parameter set, in insertion order.
    pub fn all_frames(&self) -> impl Iterator<Item = &FilmGrainParams> {
        self.records.iter().map(|record| &record.params)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use num_rational::Rational64;
    use tempfile::NamedTempFile;

    use super::{presentation_time, GrainDatabase, ParamSetIndexAllocator};

    fn write_table(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn annotates_records_per_table() {
        let first = write_table("filmgrn1\nE 0 100 1 10 0\nE 100 200 1 20 0\n");
        let second = write_table("filmgrn1\nE 0 150 1 30 0\n");

        let mut allocator = ParamSetIndexAllocator::new();
        let mut database = GrainDatabase::new();
        database
            .load_table(first.path(), 1920, 1080, &mut allocator)
            .unwrap();
        database
            .load_table(second.path(), 1280, 720, &mut allocator)
            .unwrap();

        let all: Vec<_> = database.all_frames().collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].film_grain_param_set_idx, 0);
        assert_eq!(all[1].film_grain_param_set_idx, 0);
        assert_eq!(all[2].film_grain_param_set_idx, 1);
        assert_eq!(all[0].apply_horz_resolution, 1920);
        assert_eq!(all[2].apply_vert_resolution, 720);
        assert!(all.iter().all(|p| p.subsampling_x && p.subsampling_y));
    }

    #[test]
    fn find_frames_uses_half_open_intervals() {
        let file = write_table("filmgrn1\nE 100 200 1 10 0\n");
        let mut allocator = ParamSetIndexAllocator::new();
        let mut database = GrainDatabase::new();
        database
            .load_table(file.path(), 1920, 1080, &mut allocator)
            .unwrap();

        assert!(database.find_frames(99).is_empty());
        assert_eq!(database.find_frames(100).len(), 1);
        assert_eq!(database.find_frames(199).len(), 1);
        assert!(database.find_frames(200).is_empty());
    }

    #[test]
    fn find_frames_preserves_insertion_order() {
        let first = write_table("filmgrn1\nE 0 100 1 10 0\n");
        let second = write_table("filmgrn1\nE 0 100 1 20 0\n");
        let mut allocator = ParamSetIndexAllocator::new();
        let mut database = GrainDatabase::new();
        database
            .load_table(first.path(), 1920, 1080, &mut allocator)
            .unwrap();
        database
            .load_table(second.path(), 1280, 720, &mut allocator)
            .unwrap();

        let active = database.find_frames(50);
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].film_grain_param_set_idx, 0);
        assert_eq!(active[1].film_grain_param_set_idx, 1);
    }

    #[test]
    fn allocator_rejects_a_ninth_table() {
        let mut allocator = ParamSetIndexAllocator::new();
        for expected in 0..8 {
            assert_eq!(allocator.allocate().unwrap(), expected);
        }
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn presentation_time_matches_the_table_scale() {
        // 30000/1001 fps: picture 30 sits just past the one second mark.
        let fps = Rational64::new(30_000, 1001);
        assert_eq!(presentation_time(0, fps), 0);
        assert_eq!(presentation_time(30, fps), 10_010_000);
        // Integer division truncates toward zero.
        assert_eq!(presentation_time(1, fps), 333_666);
    }
}
