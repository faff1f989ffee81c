//! Streaming merge-joins over two already-sorted record channels. Each pass
//! reads both sides forward exactly once and buffers nothing beyond the two
//! current records. Inputs are assumed sorted by the given comparator; the
//! output is garbage (but not an error) when they are not.

use std::cmp::Ordering;

use crate::{
    codec::{AutoClosing, Codec, RecordRead, RecordWrite},
    error::SortResult,
    fs::SortDir,
};

/// Writes the records present in both channels, once per match.
pub fn intersect<T>(
    a: &mut impl RecordRead<T>,
    b: &mut impl RecordRead<T>,
    cmp: impl Fn(&T, &T) -> Ordering,
    out: &mut impl RecordWrite<T>,
) -> SortResult<()> {
    let mut x = a.read()?;
    let mut y = b.read()?;
    while let (Some(xv), Some(yv)) = (&x, &y) {
        match cmp(xv, yv) {
            Ordering::Equal => {
                out.write(xv)?;
                x = a.read()?;
                y = b.read()?;
            }
            Ordering::Less => x = a.read()?,
            Ordering::Greater => y = b.read()?,
        }
    }
    Ok(())
}

/// Writes the records present in exactly one of the two channels.
pub fn symmetric_difference<T>(
    a: &mut impl RecordRead<T>,
    b: &mut impl RecordRead<T>,
    cmp: impl Fn(&T, &T) -> Ordering,
    out: &mut impl RecordWrite<T>,
) -> SortResult<()> {
    let mut x = a.read()?;
    let mut y = b.read()?;
    while let (Some(xv), Some(yv)) = (&x, &y) {
        match cmp(xv, yv) {
            Ordering::Equal => {
                x = a.read()?;
                y = b.read()?;
            }
            Ordering::Less => {
                out.write(xv)?;
                x = a.read()?;
            }
            Ordering::Greater => {
                out.write(yv)?;
                y = b.read()?;
            }
        }
    }
    while let Some(xv) = &x {
        out.write(xv)?;
        x = a.read()?;
    }
    while let Some(yv) = &y {
        out.write(yv)?;
        y = b.read()?;
    }
    Ok(())
}

/// Writes the records of `a` that have no match in `b`. The unread remainder
/// of `b` is discarded.
pub fn relative_complement<T>(
    a: &mut impl RecordRead<T>,
    b: &mut impl RecordRead<T>,
    cmp: impl Fn(&T, &T) -> Ordering,
    out: &mut impl RecordWrite<T>,
) -> SortResult<()> {
    let mut x = a.read()?;
    let mut y = b.read()?;
    while let (Some(xv), Some(yv)) = (&x, &y) {
        match cmp(xv, yv) {
            Ordering::Equal => {
                x = a.read()?;
                y = b.read()?;
            }
            Ordering::Less => {
                out.write(xv)?;
                x = a.read()?;
            }
            Ordering::Greater => y = b.read()?,
        }
    }
    while let Some(xv) = &x {
        out.write(xv)?;
        x = a.read()?;
    }
    Ok(())
}

type FileReader<T> = AutoClosing<Box<dyn RecordRead<T>>>;

fn run_file_op<T, C, D>(
    dir: &mut D,
    codec: &C,
    a: &str,
    b: &str,
    out_name: &str,
    op: impl FnOnce(
        &mut FileReader<T>,
        &mut FileReader<T>,
        &mut Box<dyn RecordWrite<T>>,
    ) -> SortResult<()>,
) -> SortResult<()>
where
    C: Codec<T>,
    D: SortDir,
{
    let mut ra = codec.reader(dir.open_input(a)?).read_auto_closing();
    let mut rb = codec.reader(dir.open_input(b)?).read_auto_closing();
    let mut writer = codec.writer(dir.open_output(out_name)?);
    op(&mut ra, &mut rb, &mut writer)?;
    ra.close()?;
    rb.close()?;
    writer.close()?;
    Ok(())
}

/// File-level form of [`intersect`]: decodes two named files through the
/// codec and writes the result to a third.
pub fn intersect_files<T, C, D>(
    dir: &mut D,
    codec: &C,
    a: &str,
    b: &str,
    cmp: impl Fn(&T, &T) -> Ordering,
    out: &str,
) -> SortResult<()>
where
    C: Codec<T>,
    D: SortDir,
{
    run_file_op(dir, codec, a, b, out, |ra, rb, w| intersect(ra, rb, cmp, w))
}

/// File-level form of [`symmetric_difference`].
pub fn symmetric_difference_files<T, C, D>(
    dir: &mut D,
    codec: &C,
    a: &str,
    b: &str,
    cmp: impl Fn(&T, &T) -> Ordering,
    out: &str,
) -> SortResult<()>
where
    C: Codec<T>,
    D: SortDir,
{
    run_file_op(dir, codec, a, b, out, |ra, rb, w| {
        symmetric_difference(ra, rb, cmp, w)
    })
}

/// File-level form of [`relative_complement`].
pub fn relative_complement_files<T, C, D>(
    dir: &mut D,
    codec: &C,
    a: &str,
    b: &str,
    cmp: impl Fn(&T, &T) -> Ordering,
    out: &str,
) -> SortResult<()>
where
    C: Codec<T>,
    D: SortDir,
{
    run_file_op(dir, codec, a, b, out, |ra, rb, w| {
        relative_complement(ra, rb, cmp, w)
    })
}
