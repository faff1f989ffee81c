use std::io::{BufRead, BufReader, Read, Write};

use crate::{
    codec::{Codec, RecordRead, RecordWrite},
    error::{SortError, SortResult},
};

/// UTF-8 lines delimited by `\n`. A final line without a trailing newline is
/// still a record; a `\r` before the delimiter is stripped on read.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinesCodec;

impl Codec<String> for LinesCodec {
    fn reader<R: Read + 'static>(&self, source: R) -> Box<dyn RecordRead<String>> {
        Box::new(LineReader {
            r: Some(BufReader::new(source)),
        })
    }

    fn writer<W: Write + 'static>(&self, sink: W) -> Box<dyn RecordWrite<String>> {
        Box::new(LineWriter { w: Some(sink) })
    }
}

struct LineReader<R> {
    r: Option<BufReader<R>>,
}

impl<R: Read> RecordRead<String> for LineReader<R> {
    fn read(&mut self) -> SortResult<Option<String>> {
        let r = match &mut self.r {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut line = String::new();
        let n = r.read_line(&mut line).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                SortError::decode("line was not valid utf-8")
            } else {
                SortError::Io(e)
            }
        })?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }

    fn close(&mut self) -> SortResult<()> {
        self.r = None;
        Ok(())
    }
}

struct LineWriter<W> {
    w: Option<W>,
}

impl<W: Write> RecordWrite<String> for LineWriter<W> {
    fn write(&mut self, t: &String) -> SortResult<()> {
        match &mut self.w {
            Some(w) => {
                w.write_all(t.as_bytes())?;
                w.write_all(b"\n")?;
                Ok(())
            }
            None => Err(SortError::message("write on closed channel")),
        }
    }

    fn flush(&mut self) -> SortResult<()> {
        if let Some(w) = &mut self.w {
            w.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> SortResult<()> {
        self.flush()?;
        self.w = None;
        Ok(())
    }
}
