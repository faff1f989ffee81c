use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    path::PathBuf,
    rc::Rc,
    sync::Arc,
};

use crate::error::{SortError, SortResult};

/// A directory-like scope on some backing store. The engine names runs and
/// destinations within one scope and never reaches outside it. Implementations
/// cover the closed set of backends (local disk, in-memory mock); an
/// object-storage backend would slot in behind the same trait.
pub trait SortDir: Clone {
    type ByteIn: Read + 'static;
    type ByteOut: Write + 'static;

    /// Allocates a fresh file name, unique within this scope.
    fn next_temp_file(&mut self) -> SortResult<String>;

    fn open_input(&mut self, name: &str) -> SortResult<Self::ByteIn>;

    /// Opens a byte sink on `name`, creating or truncating it.
    fn open_output(&mut self, name: &str) -> SortResult<Self::ByteOut>;

    /// Removes the named file. Returns whether it existed.
    fn delete(&mut self, name: &str) -> SortResult<bool>;

    /// Moves `from` onto `to`, replacing any existing `to`.
    fn rename(&mut self, from: &str, to: &str) -> SortResult<()>;

    fn ls(&mut self) -> Vec<String>;
}

const TEMP_PREFIX: &str = "bigsort";

/// Local-disk backing store over one scratch directory.
#[derive(Clone, Debug)]
pub struct DiskDir {
    path: PathBuf,
    buffer_size: usize,
    // Present when the scratch directory is owned; it is removed when the
    // last clone of this handle drops.
    _owned: Option<Arc<tempfile::TempDir>>,
}

impl DiskDir {
    /// Uses (and if necessary creates) a caller-chosen directory. The caller
    /// keeps ownership of the directory itself.
    pub fn new(path: impl Into<PathBuf>, buffer_size: usize) -> SortResult<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(DiskDir {
            path,
            buffer_size,
            _owned: None,
        })
    }

    /// Creates a private scratch directory under the system temp dir.
    pub fn scratch(buffer_size: usize) -> SortResult<Self> {
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        Ok(DiskDir {
            path: dir.path().to_path_buf(),
            buffer_size,
            _owned: Some(Arc::new(dir)),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl SortDir for DiskDir {
    type ByteIn = BufReader<File>;
    type ByteOut = BufWriter<File>;

    fn next_temp_file(&mut self) -> SortResult<String> {
        let file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.path)?;
        let (_, path) = file
            .keep()
            .map_err(|e| SortError::message(format!("keeping temp file: {}", e)))?;
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => Ok(name.to_owned()),
            None => Err(SortError::message("temp file name was not valid utf-8")),
        }
    }

    fn open_input(&mut self, name: &str) -> SortResult<Self::ByteIn> {
        let file = File::open(self.full_path(name))?;
        Ok(BufReader::with_capacity(self.buffer_size, file))
    }

    fn open_output(&mut self, name: &str) -> SortResult<Self::ByteOut> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.full_path(name))?;
        Ok(BufWriter::with_capacity(self.buffer_size, file))
    }

    fn delete(&mut self, name: &str) -> SortResult<bool> {
        match fs::remove_file(self.full_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> SortResult<()> {
        fs::rename(self.full_path(from), self.full_path(to))?;
        Ok(())
    }

    fn ls(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.path) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        names
    }
}

// Mock implementation

type FileId = usize;

#[derive(Debug, Clone)]
pub enum Event {
    Create(String, FileId),
    Open(String),
    Delete(String),
    Rename(String, String),
    Ls(Vec<String>),
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name, file_id) => write!(w, "Create({}, {})", name, file_id),
            Event::Open(name) => write!(w, "Open({})", name),
            Event::Delete(name) => write!(w, "Delete({})", name),
            Event::Rename(from, to) => write!(w, "Rename({}, {})", from, to),
            Event::Ls(names) => write!(w, "Ls() -> {:?}", names),
        }
    }
}

#[derive(Debug)]
pub struct MockFs {
    names: BTreeMap<String, FileId>,
    data: Vec<Vec<u8>>,
    events: Vec<Event>,
    next_temp: usize,

    // After this many operations, the next one fails, standing in for a
    // transient backing-store fault mid-sort.
    ops_until_failure: Option<usize>,
}

impl MockFs {
    fn new() -> Self {
        MockFs {
            names: BTreeMap::new(),
            data: Vec::new(),
            events: Vec::new(),
            next_temp: 0,
            ops_until_failure: None,
        }
    }

    pub fn fail_after(&mut self, ops: usize) {
        self.ops_until_failure = Some(ops);
    }

    pub fn iter_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    fn record(&mut self, e: Event) {
        self.events.push(e);
    }

    fn perform_op(&mut self) -> io::Result<()> {
        match self.ops_until_failure {
            Some(0) => {
                self.ops_until_failure = None;
                Err(io::Error::new(io::ErrorKind::Other, "backing store is down"))
            }
            Some(n) => {
                self.ops_until_failure = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn create(&mut self, name: &str) -> io::Result<FileId> {
        self.perform_op()?;
        match self.names.get(name) {
            Some(&id) => {
                // Truncate semantics.
                self.record(Event::Create(name.to_owned(), id));
                self.data[id].clear();
                Ok(id)
            }
            None => {
                let id = self.data.len();
                self.record(Event::Create(name.to_owned(), id));
                self.names.insert(name.to_owned(), id);
                self.data.push(Vec::new());
                Ok(id)
            }
        }
    }

    fn open(&mut self, name: &str) -> io::Result<FileId> {
        self.perform_op()?;
        self.record(Event::Open(name.to_owned()));
        match self.names.get(name) {
            Some(&id) => Ok(id),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", name),
            )),
        }
    }

    fn delete(&mut self, name: &str) -> io::Result<bool> {
        self.perform_op()?;
        self.record(Event::Delete(name.to_owned()));
        Ok(self.names.remove(name).is_some())
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        self.perform_op()?;
        self.record(Event::Rename(from.to_owned(), to.to_owned()));
        match self.names.remove(from) {
            Some(id) => {
                self.names.insert(to.to_owned(), id);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", from),
            )),
        }
    }

    fn write(&mut self, file: FileId, buf: &[u8]) -> io::Result<()> {
        self.perform_op()?;
        self.data[file].extend_from_slice(buf);
        Ok(())
    }

    fn read(&mut self, file: FileId, at: usize, buf: &mut [u8]) -> io::Result<usize> {
        self.perform_op()?;
        let data = &self.data[file];
        if at >= data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(data.len() - at, buf.len());
        buf[..n].copy_from_slice(&data[at..at + n]);
        Ok(n)
    }

    fn len(&self, file: FileId) -> usize {
        self.data[file].len()
    }
}

/// In-memory backing store for tests. Clones share one filesystem.
#[derive(Clone, Debug)]
pub struct MockDir {
    pub fs: Rc<RefCell<MockFs>>,
}

impl MockDir {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        MockDir {
            fs: Rc::new(RefCell::new(MockFs::new())),
        }
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        let fs = self.fs.borrow();
        fs.names.get(name).map(|&id| fs.data[id].clone())
    }

    pub fn len(&self, name: &str) -> Option<usize> {
        let fs = self.fs.borrow();
        fs.names.get(name).map(|&id| fs.len(id))
    }
}

#[derive(Clone, Debug)]
pub struct MockFile {
    idx: usize,
    file_id: FileId,
    fs: Rc<RefCell<MockFs>>,
}

impl Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.fs.borrow_mut().read(self.file_id, self.idx, buf)?;
        self.idx += n;
        Ok(n)
    }
}

impl Write for MockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fs.borrow_mut().write(self.file_id, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.fs.borrow_mut().perform_op()
    }
}

impl SortDir for MockDir {
    type ByteIn = MockFile;
    type ByteOut = MockFile;

    fn next_temp_file(&mut self) -> SortResult<String> {
        let mut fs = self.fs.borrow_mut();
        let name = format!("{}-{:06}", TEMP_PREFIX, fs.next_temp);
        fs.next_temp += 1;
        fs.create(&name)?;
        Ok(name)
    }

    fn open_input(&mut self, name: &str) -> SortResult<Self::ByteIn> {
        let file_id = self.fs.borrow_mut().open(name)?;
        Ok(MockFile {
            idx: 0,
            file_id,
            fs: self.fs.clone(),
        })
    }

    fn open_output(&mut self, name: &str) -> SortResult<Self::ByteOut> {
        let file_id = self.fs.borrow_mut().create(name)?;
        Ok(MockFile {
            idx: 0,
            file_id,
            fs: self.fs.clone(),
        })
    }

    fn delete(&mut self, name: &str) -> SortResult<bool> {
        Ok(self.fs.borrow_mut().delete(name)?)
    }

    fn rename(&mut self, from: &str, to: &str) -> SortResult<()> {
        Ok(self.fs.borrow_mut().rename(from, to)?)
    }

    fn ls(&mut self) -> Vec<String> {
        let mut fs = self.fs.borrow_mut();
        let names: Vec<String> = fs.names.keys().cloned().collect();
        fs.record(Event::Ls(names.clone()));
        names
    }
}
