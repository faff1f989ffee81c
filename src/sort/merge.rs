use std::{cmp::Ordering, collections::BinaryHeap, io::Write};

use log::debug;

use crate::{
    codec::{AutoClosing, Codec, RecordRead, RecordWrite},
    error::SortResult,
    fs::SortDir,
};

use super::{Comparator, Sorter};

/// A run being drained by one merge group. The reader closes itself when the
/// run is exhausted; the file is deleted right after.
struct RunState<T> {
    name: String,
    reader: AutoClosing<Box<dyn RecordRead<T>>>,
}

/// Heap entry holding one run's current head record.
struct MergeEntry<T> {
    head: T,
    run: usize,
    by: Comparator<T>,
}

impl<T> Ord for MergeEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the max; reverse so the least head wins and ties go
        // to the earliest run in the group.
        (self.by)(&self.head, &other.head)
            .then_with(|| self.run.cmp(&other.run))
            .reverse()
    }
}

impl<T> PartialOrd for MergeEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for MergeEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for MergeEntry<T> {}

impl<T, C, D> Sorter<T, C, D>
where
    T: Send + 'static,
    C: Codec<T>,
    D: SortDir,
{
    /// Merges the spilled runs down to the destination, at most
    /// `max_runs_per_merge` runs per group. `runs` tracks every live temp
    /// file throughout, so the caller can clean up if a round fails.
    pub(super) fn merge_runs(&mut self, runs: &mut Vec<String>, dest: &str) -> SortResult<()> {
        let fan_in = self.config.max_runs_per_merge;
        while runs.len() > fan_in {
            let inputs = runs.clone();
            let mut outputs = Vec::with_capacity(inputs.len().div_ceil(fan_in));
            for group in inputs.chunks(fan_in) {
                if group.len() == 1 {
                    // A remainder group of one passes through to the next
                    // round untouched.
                    outputs.push(group[0].clone());
                    continue;
                }
                let out = self.dir.next_temp_file()?;
                runs.push(out.clone());
                self.merge_group(group, &out)?;
                outputs.push(out);
            }
            // Group inputs were deleted as they were exhausted; only this
            // round's outputs are live now.
            *runs = outputs;
        }
        match runs.len() {
            0 => {
                // No records anywhere: the destination is a zero-length file.
                let mut out = self.dir.open_output(dest)?;
                out.flush()?;
            }
            1 => {
                self.dir.rename(&runs[0], dest)?;
                runs.clear();
            }
            _ => {
                // The sole group of the final round writes the destination
                // directly.
                let group = runs.clone();
                self.merge_group(&group, dest)?;
                runs.clear();
            }
        }
        Ok(())
    }

    fn merge_group(&mut self, group: &[String], out_name: &str) -> SortResult<()> {
        self.log(&format!("merging {} files", group.len()));
        debug!("merging {:?} into {}", group, out_name);
        let cmp = self.config.cmp.clone();

        let mut states: Vec<Option<RunState<T>>> = Vec::with_capacity(group.len());
        let mut heap = BinaryHeap::with_capacity(group.len());
        for (run, name) in group.iter().enumerate() {
            let mut reader = self.codec.reader(self.dir.open_input(name)?).read_auto_closing();
            match reader.read()? {
                Some(head) => {
                    states.push(Some(RunState {
                        name: name.clone(),
                        reader,
                    }));
                    heap.push(MergeEntry {
                        head,
                        run,
                        by: cmp.clone(),
                    });
                }
                None => {
                    // An empty run is spent before it contributes anything.
                    states.push(None);
                    self.dir.delete(name)?;
                }
            }
        }

        let mut writer = self.codec.writer(self.dir.open_output(out_name)?);
        let mut last: Option<T> = None;
        while let Some(MergeEntry { head, run, .. }) = heap.pop() {
            // Refill from the run that supplied this record, reclaiming the
            // run's file the moment it runs dry.
            let state = states[run].as_mut().expect("heap entry for a spent run");
            match state.reader.read()? {
                Some(next) => heap.push(MergeEntry {
                    head: next,
                    run,
                    by: cmp.clone(),
                }),
                None => {
                    if let Some(spent) = states[run].take() {
                        self.dir.delete(&spent.name)?;
                    }
                }
            }

            if self.config.unique {
                if let Some(prev) = &last {
                    if cmp(prev, &head) == Ordering::Equal {
                        continue;
                    }
                }
            }
            writer.write(&head)?;
            last = Some(head);
        }
        writer.close()?;
        Ok(())
    }
}
