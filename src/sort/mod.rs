use std::{cmp::Ordering, io::Cursor, sync::Arc, time::Instant};

use log::debug;
use rayon::prelude::*;

use crate::{
    codec::{AutoClosing, Codec, RecordRead, RecordWrite},
    error::{SortError, SortResult},
    fs::SortDir,
};

mod merge;

pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Sink for human-readable progress lines.
pub type Progress = Box<dyn Fn(&str)>;

/// Read-time preprocessing applied to every input source's channel.
pub type Transform<T> = Box<dyn Fn(Box<dyn RecordRead<T>>) -> Box<dyn RecordRead<T>>>;

/// Validated-once configuration for one sort. Construct with [`SortConfig::new`]
/// (or [`SortConfig::natural`]) and adjust fields directly; [`Sorter`] validates
/// the bounds before touching the backing store.
pub struct SortConfig<T> {
    pub cmp: Comparator<T>,
    /// Most records buffered in memory before a run is spilled.
    pub max_items_per_run: usize,
    /// Most runs merged in one group; the merge fan-in.
    pub max_runs_per_merge: usize,
    /// Collapse adjacent equal records so the output holds one representative
    /// per equivalence class of `cmp`.
    pub unique: bool,
    /// Sort spill buffers with a data-parallel unstable sort. Changes only
    /// CPU usage and the relative order of equal records within a run.
    pub parallel_sort: bool,
    pub progress: Option<Progress>,
    pub transform: Option<Transform<T>>,
}

impl<T> SortConfig<T> {
    pub fn new(cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        SortConfig {
            cmp: Arc::new(cmp),
            max_items_per_run: 100_000,
            max_runs_per_merge: 100,
            unique: false,
            parallel_sort: false,
            progress: None,
            transform: None,
        }
    }

    pub fn natural() -> Self
    where
        T: Ord + 'static,
    {
        Self::new(T::cmp)
    }

    pub fn validate(&self) -> SortResult<()> {
        if self.max_items_per_run == 0 {
            return Err(SortError::config("max_items_per_run must be greater than 0"));
        }
        if self.max_runs_per_merge <= 1 {
            return Err(SortError::config("max_runs_per_merge must be greater than 1"));
        }
        Ok(())
    }
}

/// One logical input source, decoded through the configured codec.
pub enum Input {
    /// A named file within the backing store.
    File(String),
    /// An in-memory byte buffer.
    Bytes(Vec<u8>),
}

impl Input {
    pub fn file(name: impl Into<String>) -> Self {
        Input::File(name.into())
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Input::Bytes(bytes.into())
    }
}

/// External-sort engine: split/local-sort/spill, then bounded-fan-in merge.
/// One instance runs one sort to completion at a time.
pub struct Sorter<T, C, D>
where
    C: Codec<T>,
    D: SortDir,
{
    config: SortConfig<T>,
    codec: C,
    dir: D,
}

impl<T, C, D> Sorter<T, C, D>
where
    T: Send + 'static,
    C: Codec<T>,
    D: SortDir,
{
    pub fn new(config: SortConfig<T>, codec: C, dir: D) -> Self {
        Sorter { config, codec, dir }
    }

    /// Sorts all sources into the named destination within the backing store.
    /// On failure every temp run and the in-progress destination are deleted
    /// (best effort) before the error is returned; on success only the
    /// destination remains.
    pub fn sort_into(&mut self, inputs: Vec<Input>, dest: &str) -> SortResult<()> {
        self.config.validate()?;
        let mut runs = Vec::new();
        let result = self.sort_pipeline(inputs, dest, &mut runs);
        if result.is_err() {
            for run in &runs {
                let _ = self.dir.delete(run);
            }
            let _ = self.dir.delete(dest);
        }
        result
    }

    /// Sorts all sources into an engine-allocated temp file and returns a
    /// self-deleting stream over it.
    pub fn sort_stream(&mut self, inputs: Vec<Input>) -> SortResult<SortedStream<T, D>> {
        self.config.validate()?;
        let dest = self.dir.next_temp_file()?;
        let mut runs = Vec::new();
        let result = self
            .sort_pipeline(inputs, &dest, &mut runs)
            .and_then(|()| self.dir.open_input(&dest));
        match result {
            Ok(source) => Ok(SortedStream {
                dir: self.dir.clone(),
                name: dest,
                reader: self.codec.reader(source).read_auto_closing(),
                deleted: false,
            }),
            Err(e) => {
                for run in &runs {
                    let _ = self.dir.delete(run);
                }
                let _ = self.dir.delete(&dest);
                Err(e)
            }
        }
    }

    fn sort_pipeline(
        &mut self,
        inputs: Vec<Input>,
        dest: &str,
        runs: &mut Vec<String>,
    ) -> SortResult<()> {
        let start = Instant::now();
        let mut total: u64 = 0;
        self.log("starting sort");

        let mut buffer: Vec<T> = Vec::new();
        for input in inputs {
            let mut reader = self.open_source(input)?;
            while let Some(t) = reader.read()? {
                buffer.push(t);
                if buffer.len() == self.config.max_items_per_run {
                    self.spill_run(&mut buffer, runs, &mut total)?;
                }
            }
            reader.close()?;
        }
        if !buffer.is_empty() {
            self.spill_run(&mut buffer, runs, &mut total)?;
        }

        self.log("completed initial split and sort, starting merge");
        self.merge_runs(runs, dest)?;
        self.log(&format!(
            "sort of {} records completed in {:.3}s",
            total,
            start.elapsed().as_secs_f64()
        ));
        Ok(())
    }

    /// Sorts the buffer in memory and writes it out as one new run.
    fn spill_run(
        &mut self,
        buffer: &mut Vec<T>,
        runs: &mut Vec<String>,
        total: &mut u64,
    ) -> SortResult<()> {
        let start = Instant::now();
        let cmp = self.config.cmp.clone();
        if self.config.parallel_sort {
            buffer.par_sort_unstable_by(|a, b| cmp(a, b));
        } else {
            buffer.sort_by(|a, b| cmp(a, b));
        }

        let name = self.dir.next_temp_file()?;
        runs.push(name.clone());
        let mut writer = self.codec.writer(self.dir.open_output(&name)?);
        let mut last: Option<&T> = None;
        for t in buffer.iter() {
            if self.config.unique {
                if let Some(prev) = last {
                    if cmp(prev, t) == Ordering::Equal {
                        continue;
                    }
                }
            }
            writer.write(t)?;
            last = Some(t);
        }
        writer.close()?;

        *total += buffer.len() as u64;
        debug!("spilled run {}", name);
        self.log(&format!(
            "total={}, sorted {} records to file {} in {:.3}s",
            total,
            buffer.len(),
            name,
            start.elapsed().as_secs_f64()
        ));
        buffer.clear();
        Ok(())
    }

    fn open_source(&mut self, input: Input) -> SortResult<Box<dyn RecordRead<T>>> {
        let reader = match input {
            Input::File(name) => self.codec.reader(self.dir.open_input(&name)?),
            Input::Bytes(bytes) => self.codec.reader(Cursor::new(bytes)),
        };
        Ok(match &self.config.transform {
            Some(transform) => transform(reader),
            None => reader,
        })
    }

    fn log(&self, msg: &str) {
        if let Some(progress) = &self.config.progress {
            progress(msg);
        }
    }
}

/// Forward-only stream over the final sorted run. The backing temp file is
/// deleted when the stream is exhausted, closed, or dropped, whichever comes
/// first.
pub struct SortedStream<T, D>
where
    D: SortDir,
{
    dir: D,
    name: String,
    reader: AutoClosing<Box<dyn RecordRead<T>>>,
    deleted: bool,
}

impl<T, D: SortDir> SortedStream<T, D> {
    pub fn close(&mut self) -> SortResult<()> {
        self.reader.close()?;
        if !self.deleted {
            self.deleted = true;
            self.dir.delete(&self.name)?;
        }
        Ok(())
    }
}

impl<T, D: SortDir> Iterator for SortedStream<T, D> {
    type Item = SortResult<T>;

    fn next(&mut self) -> Option<SortResult<T>> {
        match self.reader.read() {
            Ok(Some(t)) => Some(Ok(t)),
            Ok(None) => {
                if let Err(e) = self.close() {
                    debug!("deleting streamed output {}: {}", self.name, e);
                }
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl<T, D: SortDir> Drop for SortedStream<T, D> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use rand::Rng;

    use super::{Input, SortConfig, Sorter};
    use crate::{
        codec::{FixedCodec, LinesCodec, RecordRead},
        error::SortError,
        fs::{MockDir, SortDir},
    };

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn ls(dir: &MockDir) -> Vec<String> {
        dir.clone().ls()
    }

    fn byte_sorter(
        config: SortConfig<Vec<u8>>,
        dir: &MockDir,
    ) -> Sorter<Vec<u8>, FixedCodec, MockDir> {
        Sorter::new(config, FixedCodec::new(1), dir.clone())
    }

    #[test]
    fn test_split_and_merge_rounds() -> anyhow::Result<()> {
        init_logging();
        let mut config = SortConfig::natural();
        config.max_items_per_run = 2;
        config.max_runs_per_merge = 3;

        let dir = MockDir::new();
        let mut sorter = byte_sorter(config, &dir);
        sorter.sort_into(vec![Input::bytes(*b"2431")], "out")?;

        assert_eq!(Some(b"1234".to_vec()), dir.contents("out"));
        // No intermediate runs survive a successful sort.
        assert_eq!(vec!["out".to_owned()], ls(&dir));
        Ok(())
    }

    #[test]
    fn test_duplicates_preserved_by_default() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let mut sorter = byte_sorter(SortConfig::natural(), &dir);
        sorter.sort_into(vec![Input::bytes(*b"242312")], "out")?;
        assert_eq!(Some(b"122234".to_vec()), dir.contents("out"));
        Ok(())
    }

    #[test]
    fn test_unique_lines() -> anyhow::Result<()> {
        let mut config = SortConfig::natural();
        config.max_items_per_run = 2;
        config.unique = true;

        let dir = MockDir::new();
        let mut sorter = Sorter::new(config, LinesCodec, dir.clone());
        sorter.sort_into(
            vec![Input::bytes(*b"c\ndef\nab\nc\nab\nc\ndef\ndef\n")],
            "out",
        )?;
        assert_eq!(Some(b"ab\nc\ndef\n".to_vec()), dir.contents("out"));
        assert_eq!(vec!["out".to_owned()], ls(&dir));
        Ok(())
    }

    #[test]
    fn test_empty_input() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let mut sorter = byte_sorter(SortConfig::natural(), &dir);
        sorter.sort_into(vec![Input::bytes(Vec::new())], "out")?;
        assert_eq!(Some(0), dir.len("out"));
        assert_eq!(vec!["out".to_owned()], ls(&dir));
        Ok(())
    }

    #[test]
    fn test_no_inputs_at_all() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let mut sorter = byte_sorter(SortConfig::natural(), &dir);
        sorter.sort_into(Vec::new(), "out")?;
        assert_eq!(Some(0), dir.len("out"));
        Ok(())
    }

    #[test]
    fn test_multiple_sources() -> anyhow::Result<()> {
        let mut config = SortConfig::natural();
        config.max_items_per_run = 3;
        let dir = MockDir::new();
        let mut sorter = byte_sorter(config, &dir);
        sorter.sort_into(
            vec![Input::bytes(*b"db"), Input::bytes(*b"ca"), Input::bytes(*b"e")],
            "out",
        )?;
        assert_eq!(Some(b"abcde".to_vec()), dir.contents("out"));
        Ok(())
    }

    #[test]
    fn test_input_from_backing_store_file() -> anyhow::Result<()> {
        let mut dir = MockDir::new();
        {
            use std::io::Write;
            let mut out = dir.open_output("in")?;
            out.write_all(b"bca")?;
        }
        let mut sorter = byte_sorter(SortConfig::natural(), &dir);
        sorter.sort_into(vec![Input::file("in")], "out")?;
        assert_eq!(Some(b"abc".to_vec()), dir.contents("out"));
        Ok(())
    }

    #[test]
    fn test_transform_preprocesses_each_source() -> anyhow::Result<()> {
        let mut config: SortConfig<Vec<u8>> = SortConfig::natural();
        config.transform = Some(Box::new(|r| Box::new(r.filter(|rec: &Vec<u8>| rec != b"x"))));
        let dir = MockDir::new();
        let mut sorter = byte_sorter(config, &dir);
        sorter.sort_into(vec![Input::bytes(*b"bxa"), Input::bytes(*b"xc")], "out")?;
        assert_eq!(Some(b"abc".to_vec()), dir.contents("out"));
        Ok(())
    }

    #[test]
    fn test_config_validation_is_eager() {
        let dir = MockDir::new();

        let mut config: SortConfig<Vec<u8>> = SortConfig::natural();
        config.max_items_per_run = 0;
        let mut sorter = byte_sorter(config, &dir);
        match sorter.sort_into(vec![Input::bytes(*b"ab")], "out") {
            Err(SortError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other),
        }

        let mut config: SortConfig<Vec<u8>> = SortConfig::natural();
        config.max_runs_per_merge = 1;
        let mut sorter = byte_sorter(config, &dir);
        assert!(matches!(
            sorter.sort_into(vec![Input::bytes(*b"ab")], "out"),
            Err(SortError::Config(_))
        ));

        // Nothing touched the backing store.
        assert!(ls(&dir).is_empty());
    }

    #[test]
    fn test_progress_reports_bounded_fan_in() -> anyhow::Result<()> {
        let lines: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();

        let mut config = SortConfig::natural();
        config.max_items_per_run = 1;
        config.max_runs_per_merge = 3;
        config.progress = Some(Box::new(move |msg| sink.borrow_mut().push(msg.to_owned())));

        let dir = MockDir::new();
        let mut sorter = byte_sorter(config, &dir);
        // Nine single-record runs forces two merge rounds at fan-in 3.
        sorter.sort_into(vec![Input::bytes(*b"948372615")], "out")?;
        assert_eq!(Some(b"123456789".to_vec()), dir.contents("out"));

        let lines = lines.borrow();
        let merges: Vec<usize> = lines
            .iter()
            .filter_map(|l| l.strip_prefix("merging "))
            .map(|l| l.strip_suffix(" files").unwrap().parse().unwrap())
            .collect();
        assert!(merges.len() >= 2, "expected multiple merge groups: {:?}", lines);
        assert!(merges.iter().all(|&n| n <= 3));
        assert!(lines.iter().any(|l| l.starts_with("sort of 9 records")));
        Ok(())
    }

    #[test]
    fn test_parallel_sort_same_output() -> anyhow::Result<()> {
        let mut config = SortConfig::natural();
        config.max_items_per_run = 4;
        config.parallel_sort = true;
        let dir = MockDir::new();
        let mut sorter = byte_sorter(config, &dir);
        sorter.sort_into(vec![Input::bytes(*b"942837261505")], "out")?;
        assert_eq!(Some(b"012234556789".to_vec()), dir.contents("out"));
        Ok(())
    }

    #[test]
    fn test_stream_mode_deletes_on_exhaustion() -> anyhow::Result<()> {
        let mut config = SortConfig::natural();
        config.max_items_per_run = 2;
        let dir = MockDir::new();
        let mut sorter = byte_sorter(config, &dir);
        let stream = sorter.sort_stream(vec![Input::bytes(*b"31415926")])?;

        let collected: Vec<Vec<u8>> = stream.collect::<Result<_, _>>()?;
        let flat: Vec<u8> = collected.into_iter().flatten().collect();
        assert_eq!(b"11234569".to_vec(), flat);
        assert!(ls(&dir).is_empty());
        Ok(())
    }

    #[test]
    fn test_stream_mode_deletes_on_early_drop() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let mut sorter = byte_sorter(SortConfig::natural(), &dir);
        let mut stream = sorter.sort_stream(vec![Input::bytes(*b"cab")])?;
        assert_eq!(b"a".to_vec(), stream.next().unwrap()?);
        drop(stream);
        assert!(ls(&dir).is_empty());
        Ok(())
    }

    #[test]
    fn test_failure_leaves_nothing_behind() {
        // Sweep the failure point across the whole sort: wherever the backing
        // store fails once, either the sort succeeds and only the destination
        // remains, or it fails and nothing remains.
        for fail_at in 0..120 {
            let mut config = SortConfig::natural();
            config.max_items_per_run = 2;
            config.max_runs_per_merge = 2;
            let dir = MockDir::new();
            dir.fs.borrow_mut().fail_after(fail_at);

            let mut sorter = byte_sorter(config, &dir);
            match sorter.sort_into(vec![Input::bytes(*b"2431765")], "out") {
                Ok(()) => {
                    assert_eq!(
                        Some(b"1234567".to_vec()),
                        dir.contents("out"),
                        "fail_at={}",
                        fail_at
                    );
                    assert_eq!(vec!["out".to_owned()], ls(&dir), "fail_at={}", fail_at);
                }
                Err(_) => {
                    assert!(
                        ls(&dir).is_empty(),
                        "fail_at={} left files: {:?}",
                        fail_at,
                        ls(&dir)
                    );
                }
            }
        }
    }

    #[test]
    fn test_permutation_equivalence() -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..50);
            let data: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'j')).collect();
            let unique = rng.gen_bool(0.5);

            let mut config = SortConfig::natural();
            config.max_items_per_run = rng.gen_range(1..8);
            config.max_runs_per_merge = rng.gen_range(2..5);
            config.unique = unique;

            let mut expected = data.clone();
            expected.sort_unstable();
            if unique {
                expected.dedup();
            }

            let dir = MockDir::new();
            let mut sorter = byte_sorter(config, &dir);
            sorter.sort_into(vec![Input::bytes(data)], "out")?;
            let got: Vec<u8> = dir.contents("out").unwrap();
            assert_eq!(expected, got);
            assert_eq!(vec!["out".to_owned()], ls(&dir));
        }
        Ok(())
    }

    #[test]
    fn test_sort_datadriven() {
        datadriven::walk("src/sort/testdata/", |f| {
            f.run(|test_case| match test_case.directive.as_str() {
                "sort" => {
                    let mut config: SortConfig<String> = SortConfig::natural();
                    if let Some(v) = test_case.args.get("max-items") {
                        config.max_items_per_run = v[0].parse().unwrap();
                    }
                    if let Some(v) = test_case.args.get("max-merge") {
                        config.max_runs_per_merge = v[0].parse().unwrap();
                    }
                    if test_case.args.contains_key("unique") {
                        config.unique = true;
                    }

                    let dir = MockDir::new();
                    let mut sorter = Sorter::new(config, LinesCodec, dir.clone());
                    sorter
                        .sort_into(vec![Input::bytes(test_case.input.clone())], "out")
                        .unwrap();
                    String::from_utf8(dir.contents("out").unwrap()).unwrap()
                }
                _ => panic!("unhandled"),
            })
        })
    }
}
