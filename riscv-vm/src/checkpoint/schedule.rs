//! Simpoint schedule loading and path generation (spec §4.6).
//!
//! Grounded in `target/riscv/serializer.c`'s `find_minlocation` (distrust of
//! unsorted input: this loader re-sorts and asserts strict ascending order
//! rather than trusting file line order) and in `include/hw/riscv/nemu.h`'s
//! `PathManager_t`/`SimpointInfo_t` (location list, weight list, and a
//! pre-built per-checkpoint output path list).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::{EngineError, Result};

/// One Simpoint sample: a representative interval identified by its cluster
/// index (`location`, the cluster's starting interval number in the
/// simpoints file) and the fraction of total run time it represents
/// (`weight`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpointEntry {
    pub location: u64,
    pub weight: f64,
}

/// `simpoints0`/`weights0` files are whitespace-separated `value id` lines;
/// `id` ties a simpoint location to its weight across the two files.
fn parse_id_value_file(path: &Path) -> Result<Vec<(u64, f64)>> {
    let text = std::fs::read_to_string(path).map_err(|e| EngineError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let value: f64 = parts
            .next()
            .ok_or_else(|| EngineError::Config(format!("malformed line in {}: {line}", path.display())))?
            .parse()
            .map_err(|_| EngineError::Config(format!("non-numeric value in {}: {line}", path.display())))?;
        let id: u64 = parts
            .next()
            .ok_or_else(|| EngineError::Config(format!("malformed line in {}: {line}", path.display())))?
            .parse()
            .map_err(|_| EngineError::Config(format!("non-numeric id in {}: {line}", path.display())))?;
        out.push((id, value));
    }
    Ok(out)
}

/// Load `{dir}/simpoints0` and `{dir}/weights0`, join on id, sort ascending
/// by location, and assert strict ascending order.
pub fn load_simpoint_schedule(dir: &Path) -> Result<Vec<SimpointEntry>> {
    let locations = parse_id_value_file(&dir.join("simpoints0"))?;
    let weights = parse_id_value_file(&dir.join("weights0"))?;

    let mut weight_by_id = std::collections::HashMap::new();
    for (id, weight) in weights {
        weight_by_id.insert(id, weight);
    }

    let mut entries: Vec<SimpointEntry> = locations
        .into_iter()
        .map(|(id, location)| SimpointEntry {
            location: location as u64,
            weight: *weight_by_id.get(&id).unwrap_or(&0.0),
        })
        .collect();

    entries.sort_by_key(|e| e.location);

    for pair in entries.windows(2) {
        if pair[0].location >= pair[1].location {
            return Err(EngineError::Config(format!(
                "simpoint schedule not strictly ascending after sort: {} >= {}",
                pair[0].location, pair[1].location
            )));
        }
    }

    Ok(entries)
}

/// Thread-safe cursor over a loaded schedule: each checkpoint commit pops
/// the next (lowest remaining) entry, matching `find_minlocation`'s role in
/// the original without needing a linear rescan on every call.
pub struct Schedule {
    entries: Mutex<Vec<SimpointEntry>>,
    next_index: std::sync::atomic::AtomicUsize,
    total: usize,
}

impl Schedule {
    /// Entries with `location == 0` or `weight == 0.0` are dropped up front:
    /// a zero location would be "reached" by the very first instruction
    /// with nothing yet to checkpoint, and a zero weight means the sample
    /// carries no representative run time, so both are consumed silently
    /// rather than producing an empty checkpoint (spec §8).
    pub fn new(entries: Vec<SimpointEntry>) -> Self {
        let entries: Vec<SimpointEntry> = entries.into_iter().filter(|e| e.location != 0 && e.weight != 0.0).collect();
        let total = entries.len();
        Self {
            entries: Mutex::new(entries),
            next_index: std::sync::atomic::AtomicUsize::new(0),
            total,
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self::new(load_simpoint_schedule(dir)?))
    }

    /// Next un-taken location, or `None` if the schedule is exhausted.
    pub fn peek_next(&self) -> Option<SimpointEntry> {
        let idx = self.next_index.load(std::sync::atomic::Ordering::Acquire);
        self.entries.lock().unwrap().get(idx).copied()
    }

    /// Advance the cursor past the current entry. Called once the
    /// checkpoint for `peek_next()`'s location has been committed.
    pub fn advance(&self) {
        self.next_index.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_index.load(std::sync::atomic::Ordering::Acquire) >= self.total
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Full output file path for a Uniform/SyncUniform checkpoint taken at
/// `icount` executed instructions: `{base}/{workload}/{icount}/_{icount}_.gz`.
pub fn uniform_checkpoint_path(base_dir: &Path, workload_name: &str, icount: u64) -> PathBuf {
    base_dir
        .join(workload_name)
        .join(icount.to_string())
        .join(format!("_{icount}_.gz"))
}

/// Full output file path for a Simpoint checkpoint: the schedule entry's
/// `location` names the directory, and its `weight` is folded into the
/// filename so two runs over the same schedule never collide even if their
/// weights files differ: `{base}/{workload}/{location}/_{location}_{weight}.gz`.
pub fn simpoint_checkpoint_path(base_dir: &Path, workload_name: &str, location: u64, weight: f64) -> PathBuf {
    base_dir
        .join(workload_name)
        .join(location.to_string())
        .join(format!("_{location}_{weight}.gz"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_and_sorts_by_location() {
        let tmp = tempfile::tempdir().unwrap();
        // Deliberately out of order and using ids to cross-reference weights.
        write_file(tmp.path(), "simpoints0", "300 2\n100 0\n200 1\n");
        write_file(tmp.path(), "weights0", "0.25 0\n0.5 1\n0.25 2\n");

        let entries = load_simpoint_schedule(tmp.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].location, 100);
        assert_eq!(entries[0].weight, 0.25);
        assert_eq!(entries[1].location, 200);
        assert_eq!(entries[1].weight, 0.5);
        assert_eq!(entries[2].location, 300);
        assert_eq!(entries[2].weight, 0.25);
    }

    #[test]
    fn rejects_duplicate_locations() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "simpoints0", "100 0\n100 1\n");
        write_file(tmp.path(), "weights0", "0.5 0\n0.5 1\n");
        assert!(load_simpoint_schedule(tmp.path()).is_err());
    }

    #[test]
    fn schedule_cursor_advances_in_order() {
        let schedule = Schedule::new(vec![
            SimpointEntry { location: 10, weight: 0.5 },
            SimpointEntry { location: 20, weight: 0.5 },
        ]);
        assert_eq!(schedule.peek_next().unwrap().location, 10);
        schedule.advance();
        assert_eq!(schedule.peek_next().unwrap().location, 20);
        schedule.advance();
        assert!(schedule.peek_next().is_none());
        assert!(schedule.is_exhausted());
    }

    #[test]
    fn zero_weight_head_entry_is_silently_dropped() {
        let schedule = Schedule::new(vec![
            SimpointEntry { location: 50, weight: 0.0 },
            SimpointEntry { location: 100, weight: 0.5 },
            SimpointEntry { location: 200, weight: 0.5 },
        ]);
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.peek_next().unwrap().location, 100);
        schedule.advance();
        assert_eq!(schedule.peek_next().unwrap().location, 200);
    }

    #[test]
    fn zero_location_head_entry_is_silently_dropped() {
        let schedule = Schedule::new(vec![
            SimpointEntry { location: 0, weight: 0.5 },
            SimpointEntry { location: 100, weight: 0.5 },
        ]);
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule.peek_next().unwrap().location, 100);
    }

    #[test]
    fn uniform_path_matches_the_documented_literal_format() {
        let base = PathBuf::from("/out");
        assert_eq!(
            uniform_checkpoint_path(&base, "wl", 1_000_000),
            PathBuf::from("/out/wl/1000000/_1000000_.gz")
        );
    }

    #[test]
    fn simpoint_path_includes_the_schedule_weight() {
        let base = PathBuf::from("/out");
        assert_eq!(
            simpoint_checkpoint_path(&base, "wl", 3, 0.5),
            PathBuf::from("/out/wl/3/_3_0.5.gz")
        );
    }

    #[test]
    fn distinct_path_shapes_for_simpoint_vs_uniform() {
        let base = PathBuf::from("/out");
        assert_ne!(
            simpoint_checkpoint_path(&base, "wl", 3, 0.5),
            uniform_checkpoint_path(&base, "wl", 3)
        );
    }
}
