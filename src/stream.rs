use std::collections::VecDeque;
use std::io::{self, Read};
use std::mem;

use crate::engine::Engine;
use crate::error::M4Error;

/// A reader wrapper that expands m4 macros on the fly.
///
/// Bytes are pulled from the inner reader in fixed-size chunks and fed to
/// the engine as they arrive; a multi-byte UTF-8 sequence split across a
/// chunk boundary is carried over to the next read. Inner end-of-file
/// finishes the engine, flushing pending diversions. Engine errors
/// surface as [`io::ErrorKind::InvalidData`].
pub struct ExpandingReader<R: Read> {
    inner: R,
    engine: Engine,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    carry: Vec<u8>,
    /// Expanded bytes not yet handed to the caller.
    ready: VecDeque<u8>,
    done: bool,
}

impl<R: Read> ExpandingReader<R> {
    pub fn new(inner: R, engine: Engine) -> Self {
        Self {
            inner,
            engine,
            carry: Vec::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    /// Recover the engine, e.g. to inspect warnings after the stream is
    /// exhausted.
    pub fn into_engine(self) -> Engine {
        self.engine
    }

    fn pump_inner(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self.inner.read(&mut chunk)?;
        if n == 0 {
            if !self.carry.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "incomplete UTF-8 sequence at end of input",
                ));
            }
            let out = self.engine.finish().map_err(to_io)?;
            self.queue(out);
            self.done = true;
            return Ok(());
        }

        self.carry.extend_from_slice(&chunk[..n]);
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        if valid == 0 {
            return Ok(());
        }

        let mut complete = mem::take(&mut self.carry);
        self.carry = complete.split_off(valid);
        match String::from_utf8(complete) {
            Ok(text) => {
                let out = self.engine.feed(&text).map_err(to_io)?;
                self.queue(out);
                Ok(())
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }

    fn queue(&mut self, chunks: Vec<String>) {
        for chunk in chunks {
            self.ready.extend(chunk.into_bytes());
        }
    }
}

impl<R: Read> Read for ExpandingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.ready.is_empty() && !self.done {
            self.pump_inner()?;
        }
        let n = buf.len().min(self.ready.len());
        for (slot, byte) in buf.iter_mut().zip(self.ready.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

fn to_io(err: M4Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
