use std::{
    collections::VecDeque,
    io::{Read, Write},
    marker::PhantomData,
};

use crate::error::SortResult;

pub mod fixed;
pub mod lines;

pub use fixed::FixedCodec;
pub use lines::LinesCodec;

/// Pull side of a record channel. `read` keeps returning `None` once the
/// underlying byte source is exhausted.
pub trait RecordRead<T> {
    fn read(&mut self) -> SortResult<Option<T>>;

    /// Releases the underlying byte resources. Safe to call more than once.
    fn close(&mut self) -> SortResult<()> {
        Ok(())
    }

    fn filter<F>(self, f: F) -> Filter<Self, F>
    where
        Self: Sized,
        F: FnMut(&T) -> bool,
    {
        Filter { inner: self, f }
    }

    fn map<U, F>(self, f: F) -> Map<Self, F, T>
    where
        Self: Sized,
        F: FnMut(T) -> U,
    {
        Map {
            inner: self,
            f,
            _marker: PhantomData,
        }
    }

    fn flat_map<U, F>(self, f: F) -> FlatMap<Self, F, T, U>
    where
        Self: Sized,
        F: FnMut(T) -> Vec<U>,
    {
        FlatMap {
            inner: self,
            f,
            pending: VecDeque::new(),
            _marker: PhantomData,
        }
    }

    /// Wraps this channel so it releases itself the first time end-of-stream
    /// is observed.
    fn read_auto_closing(self) -> AutoClosing<Self>
    where
        Self: Sized,
    {
        AutoClosing::new(self)
    }

    /// Bridges this channel into an iterator of `SortResult<T>`.
    fn records(self) -> Records<Self, T>
    where
        Self: Sized,
    {
        Records {
            inner: self,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Applies an arbitrary whole-sequence transform, rebuilding a channel
    /// from whatever iterator the caller produces.
    fn transform<U, I, F>(self, f: F) -> FromRecords<I>
    where
        Self: Sized,
        I: Iterator<Item = SortResult<U>>,
        F: FnOnce(Records<Self, T>) -> I,
    {
        from_records(f(self.records()))
    }
}

impl<T, R: RecordRead<T> + ?Sized> RecordRead<T> for Box<R> {
    fn read(&mut self) -> SortResult<Option<T>> {
        (**self).read()
    }

    fn close(&mut self) -> SortResult<()> {
        (**self).close()
    }
}

/// Push side of a record channel.
pub trait RecordWrite<T> {
    fn write(&mut self, t: &T) -> SortResult<()>;

    /// Forwards to the underlying sink's flush without closing it.
    fn flush(&mut self) -> SortResult<()>;

    /// Flush and release. Safe to call more than once.
    fn close(&mut self) -> SortResult<()> {
        self.flush()
    }
}

impl<T, W: RecordWrite<T> + ?Sized> RecordWrite<T> for Box<W> {
    fn write(&mut self, t: &T) -> SortResult<()> {
        (**self).write(t)
    }

    fn flush(&mut self) -> SortResult<()> {
        (**self).flush()
    }

    fn close(&mut self) -> SortResult<()> {
        (**self).close()
    }
}

/// Builds record channels over byte channels. Implementations decide the byte
/// layout; the engine treats it as opaque.
pub trait Codec<T> {
    fn reader<R: Read + 'static>(&self, source: R) -> Box<dyn RecordRead<T>>;

    fn writer<W: Write + 'static>(&self, sink: W) -> Box<dyn RecordWrite<T>>;
}

/// Releases the wrapped channel exactly once: either when `None` is first
/// observed or when explicitly closed, whichever comes first.
pub struct AutoClosing<R> {
    inner: R,
    closed: bool,
}

impl<R> AutoClosing<R> {
    pub fn new(inner: R) -> Self {
        AutoClosing {
            inner,
            closed: false,
        }
    }
}

impl<T, R: RecordRead<T>> RecordRead<T> for AutoClosing<R> {
    fn read(&mut self) -> SortResult<Option<T>> {
        if self.closed {
            return Ok(None);
        }
        match self.inner.read()? {
            Some(t) => Ok(Some(t)),
            None => {
                self.closed = true;
                self.inner.close()?;
                Ok(None)
            }
        }
    }

    fn close(&mut self) -> SortResult<()> {
        if !self.closed {
            self.closed = true;
            self.inner.close()?;
        }
        Ok(())
    }
}

pub struct Filter<R, F> {
    inner: R,
    f: F,
}

impl<T, R, F> RecordRead<T> for Filter<R, F>
where
    R: RecordRead<T>,
    F: FnMut(&T) -> bool,
{
    fn read(&mut self) -> SortResult<Option<T>> {
        loop {
            match self.inner.read()? {
                None => return Ok(None),
                Some(t) if (self.f)(&t) => return Ok(Some(t)),
                Some(_) => continue,
            }
        }
    }

    fn close(&mut self) -> SortResult<()> {
        self.inner.close()
    }
}

pub struct Map<R, F, T> {
    inner: R,
    f: F,
    _marker: PhantomData<T>,
}

impl<T, U, R, F> RecordRead<U> for Map<R, F, T>
where
    R: RecordRead<T>,
    F: FnMut(T) -> U,
{
    fn read(&mut self) -> SortResult<Option<U>> {
        Ok(self.inner.read()?.map(&mut self.f))
    }

    fn close(&mut self) -> SortResult<()> {
        self.inner.close()
    }
}

pub struct FlatMap<R, F, T, U> {
    inner: R,
    f: F,
    pending: VecDeque<U>,
    _marker: PhantomData<T>,
}

impl<T, U, R, F> RecordRead<U> for FlatMap<R, F, T, U>
where
    R: RecordRead<T>,
    F: FnMut(T) -> Vec<U>,
{
    fn read(&mut self) -> SortResult<Option<U>> {
        loop {
            if let Some(u) = self.pending.pop_front() {
                return Ok(Some(u));
            }
            match self.inner.read()? {
                None => return Ok(None),
                Some(t) => self.pending.extend((self.f)(t)),
            }
        }
    }

    fn close(&mut self) -> SortResult<()> {
        self.inner.close()
    }
}

/// Iterator over a channel's records. A read error ends the iteration after
/// yielding the error.
pub struct Records<R, T> {
    inner: R,
    done: bool,
    _marker: PhantomData<T>,
}

impl<T, R: RecordRead<T>> Iterator for Records<R, T> {
    type Item = SortResult<T>;

    fn next(&mut self) -> Option<SortResult<T>> {
        if self.done {
            return None;
        }
        match self.inner.read() {
            Ok(Some(t)) => Some(Ok(t)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Rebuilds a record channel from an iterator of `SortResult<T>`.
pub fn from_records<T, I>(iter: I) -> FromRecords<I>
where
    I: Iterator<Item = SortResult<T>>,
{
    FromRecords { iter, done: false }
}

pub struct FromRecords<I> {
    iter: I,
    done: bool,
}

impl<T, I> RecordRead<T> for FromRecords<I>
where
    I: Iterator<Item = SortResult<T>>,
{
    fn read(&mut self) -> SortResult<Option<T>> {
        if self.done {
            return Ok(None);
        }
        match self.iter.next() {
            Some(Ok(t)) => Ok(Some(t)),
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}
