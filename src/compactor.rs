//! Merges live records from sealed segments into a fresh segment set and
//! rewrites the hint file. Triggered either explicitly (`BitCask::compact`)
//! or by the background worker once `reclaimable_bytes` crosses
//! `max_reclaim_space`.

use crate::config::Config;
use crate::engine::{list_segment_ids, segment_path, BitCask, Shared};
use crate::error::{Error, Result};
use crate::keydir::Entry;
use crate::segment::Segment;

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Runs one compaction pass. A concurrent second attempt (another explicit
/// call racing the background worker, say) returns `Error::MergeInProgress`
/// rather than blocking.
pub(crate) fn compact(shared: &Arc<Shared>) -> Result<()> {
    if shared.merging.swap(true, Ordering::AcqRel) {
        return Err(Error::MergeInProgress);
    }
    let result = run(shared);
    shared.merging.store(false, Ordering::Release);
    result
}

fn run(shared: &Arc<Shared>) -> Result<()> {
    // Seal the active segment and start a new one; everything from here on
    // writes into the new active segment and is untouched by this pass.
    let (last_merge, old_segments) = {
        let mut state = shared.state.write().unwrap();
        let old_active_id = state.active.id();
        state.active.sync()?;
        let sealed_active = Segment::open(&shared.dir, old_active_id, false)?;
        state.sealed.insert(old_active_id, Arc::new(sealed_active));
        let new_active_id = old_active_id + 1;
        state.active = Arc::new(Segment::open(&shared.dir, new_active_id, true)?);
        log::info!("compaction: sealed segment {old_active_id}, new active segment {new_active_id}");

        let last_merge = old_active_id;
        let old_segments: HashMap<u64, Arc<Segment>> = state
            .sealed
            .iter()
            .filter(|(&id, _)| id <= last_merge)
            .map(|(&id, seg)| (id, seg.clone()))
            .collect();
        (last_merge, old_segments)
    };

    // Open a scratch engine in a fresh subdirectory to accumulate live
    // records; it gets its own segment numbering, renumbered into the live
    // store's id space at swap time.
    let temp_dir = shared.dir.join(format!("merge-{}", uuid::Uuid::new_v4()));
    let temp_config = Config { max_reclaim_space: u64::MAX, ..shared.config };
    let temp = BitCask::open_with(&temp_dir, temp_config, false)?;

    let before = shared.keydir.snapshot();
    let mut carried: Vec<(Vec<u8>, Entry)> = Vec::with_capacity(before.len());
    for (key, entry) in before {
        if entry.file_id > last_merge {
            continue; // written after rotation above, already compact
        }
        let Some(segment) = old_segments.get(&entry.file_id) else { continue };
        let record = match segment.read_record(&key, entry.value_position, entry.value_size) {
            Ok(record) => record,
            Err(Error::InvalidChecksum) => {
                log::warn!(
                    "compaction: dropping corrupt record for a key in segment {}",
                    entry.file_id
                );
                continue;
            }
            Err(e) => return Err(e),
        };
        temp.put(&key, &record.value)?;
        carried.push((key, entry));
    }

    let temp_keydir: HashMap<Vec<u8>, Entry> = temp.snapshot_keydir().into_iter().collect();
    temp.close()?;
    let temp_ids = list_segment_ids(&temp_dir)?;

    {
        let mut state = shared.state.write().unwrap();

        let mut next_id = state.max_id() + 1;
        let mut id_map = HashMap::with_capacity(temp_ids.len());
        for &old_id in &temp_ids {
            id_map.insert(old_id, next_id);
            next_id += 1;
        }
        for &old_id in &temp_ids {
            let new_id = id_map[&old_id];
            fs::rename(segment_path(&temp_dir, old_id), segment_path(&shared.dir, new_id))?;
            state.sealed.insert(new_id, Arc::new(Segment::open(&shared.dir, new_id, false)?));
        }

        // Install each merged entry under its new id, but only if the live
        // key still matches what we copied from — a write that raced the
        // merge must win over the stale copy we just produced.
        for (key, old_entry) in &carried {
            let Some(temp_entry) = temp_keydir.get(key) else { continue };
            let new_entry = Entry {
                file_id: id_map[&temp_entry.file_id],
                value_position: temp_entry.value_position,
                value_size: temp_entry.value_size,
                timestamp: temp_entry.timestamp,
            };
            if !shared.keydir.replace_if_unchanged(key, *old_entry, new_entry) {
                log::debug!("compaction: key changed during merge, keeping the newer value");
            }
        }

        for &old_id in old_segments.keys() {
            state.sealed.remove(&old_id);
        }
        for &old_id in old_segments.keys() {
            fs::remove_file(segment_path(&shared.dir, old_id))?;
        }

        shared.keydir.save(&shared.dir)?;
    }

    fs::remove_dir_all(&temp_dir)?;
    shared.reclaimable_bytes.store(0, Ordering::Relaxed);
    log::info!("compaction complete: merged {} segment(s) up to id {last_merge}", old_segments.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::engine::list_segment_ids;
    use crate::{BitCask, Config};

    fn small_file_config() -> Config {
        Config { max_file_size: 200, ..Config::default() }
    }

    #[test]
    fn compact_preserves_live_values_and_shrinks_segments() {
        let dir = tempfile::tempdir().unwrap();
        let db = BitCask::open(dir.path(), small_file_config()).unwrap();
        for i in 0..40u32 {
            db.put(format!("key-{i:03}").as_bytes(), format!("value-{i:03}").as_bytes()).unwrap();
        }
        for i in 0..40u32 {
            if i % 2 == 0 {
                db.put(format!("key-{i:03}").as_bytes(), b"updated").unwrap();
            }
        }
        let before = list_segment_ids(dir.path()).unwrap().len();

        db.compact().unwrap();

        for i in 0..40u32 {
            let want: &[u8] = if i % 2 == 0 { b"updated" } else { format!("value-{i:03}").as_bytes() };
            assert_eq!(db.get(format!("key-{i:03}").as_bytes()).unwrap(), want);
        }
        let after = list_segment_ids(dir.path()).unwrap().len();
        assert!(after <= before, "compaction should not grow the segment count: {before} -> {after}");
    }

    #[test]
    fn tombstones_survive_compaction_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = BitCask::open(dir.path(), small_file_config()).unwrap();
            for i in 0..40u32 {
                db.put(format!("key-{i:03}").as_bytes(), b"v").unwrap();
            }
            for i in 0..40u32 {
                if i % 3 == 0 {
                    db.delete(format!("key-{i:03}").as_bytes()).unwrap();
                }
            }
            db.compact().unwrap();
            db.close().unwrap();
        }

        let db = BitCask::open(dir.path(), small_file_config()).unwrap();
        for i in 0..40u32 {
            let key = format!("key-{i:03}");
            if i % 3 == 0 {
                assert!(!db.has(key.as_bytes()), "{key} should have stayed deleted across compaction");
            } else {
                assert_eq!(db.get(key.as_bytes()).unwrap(), b"v");
            }
        }
    }

    #[test]
    fn concurrent_compact_reports_merge_in_progress() {
        use crate::Error;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let db = BitCask::open(dir.path(), Config::default()).unwrap();
        db.put(b"k", b"v").unwrap();

        db.inner.merging.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = super::compact(&Arc::clone(&db.inner));
        db.inner.merging.store(false, std::sync::atomic::Ordering::SeqCst);

        assert!(matches!(result, Err(Error::MergeInProgress)));
    }
}
