use std::io::{Read, Write};

use crate::{
    codec::{Codec, RecordRead, RecordWrite},
    error::{SortError, SortResult},
};

/// Fixed-width byte records with no delimiters. A byte source whose length is
/// not a multiple of the record size yields a decode error for the truncated
/// tail.
#[derive(Clone, Copy, Debug)]
pub struct FixedCodec {
    size: usize,
}

impl FixedCodec {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "record size must be greater than 0");
        FixedCodec { size }
    }
}

impl Codec<Vec<u8>> for FixedCodec {
    fn reader<R: Read + 'static>(&self, source: R) -> Box<dyn RecordRead<Vec<u8>>> {
        Box::new(FixedReader {
            r: Some(source),
            size: self.size,
        })
    }

    fn writer<W: Write + 'static>(&self, sink: W) -> Box<dyn RecordWrite<Vec<u8>>> {
        Box::new(FixedWriter {
            w: Some(sink),
            size: self.size,
        })
    }
}

struct FixedReader<R> {
    r: Option<R>,
    size: usize,
}

impl<R: Read> RecordRead<Vec<u8>> for FixedReader<R> {
    fn read(&mut self) -> SortResult<Option<Vec<u8>>> {
        let r = match &mut self.r {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut buf = vec![0_u8; self.size];
        let mut filled = 0;
        while filled < self.size {
            let n = r.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            Ok(None)
        } else if filled < self.size {
            Err(SortError::decode(format!(
                "truncated record: got {} of {} bytes",
                filled, self.size
            )))
        } else {
            Ok(Some(buf))
        }
    }

    fn close(&mut self) -> SortResult<()> {
        self.r = None;
        Ok(())
    }
}

struct FixedWriter<W> {
    w: Option<W>,
    size: usize,
}

impl<W: Write> RecordWrite<Vec<u8>> for FixedWriter<W> {
    fn write(&mut self, t: &Vec<u8>) -> SortResult<()> {
        if t.len() != self.size {
            return Err(SortError::message(format!(
                "record is {} bytes, codec expects {}",
                t.len(),
                self.size
            )));
        }
        match &mut self.w {
            Some(w) => {
                w.write_all(t)?;
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
