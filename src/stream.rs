//! Compressed byte channel underneath the frame layer.
//!
//! The writer pushes data through zlib in bounded chunks and, on finish, appends
//! its own `Z` marker before closing the compressed stream. That marker is
//! independent of the frame layer terminator.

use crate::frame::FrameKind;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use tracing::debug;

/// Largest slice handed to the compressor at once
pub const CHUNK_IN: usize = 655_360;

/// zlib level used for traces, favouring speed on the traced process
pub const COMPRESSION_LEVEL: u32 = 2;

pub struct StreamWriter<W: Write> {
    encoder: ZlibEncoder<W>,
    bytes_in: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            encoder: ZlibEncoder::new(inner, Compression::new(COMPRESSION_LEVEL)),
            bytes_in: 0,
        }
    }

    /// Number of uncompressed bytes accepted so far
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn add_data(&mut self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(CHUNK_IN) {
            self.encoder.write_all(chunk)?;
        }
        self.bytes_in += data.len() as u64;
        Ok(())
    }

    /// Write the trailing marker, close the compressed stream and hand back
    /// the underlying sink
    pub fn finish(mut self) -> io::Result<W> {
        self.add_data(&[FrameKind::Finish.tag()])?;
        let mut inner = self.encoder.finish()?;
        inner.flush()?;
        debug!(bytes_in = self.bytes_in, "Closed compressed stream");
        Ok(inner)
    }
}

pub struct StreamReader<R: Read> {
    decoder: ZlibDecoder<R>,
    bytes_out: u64,
}

impl<R: Read> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            decoder: ZlibDecoder::new(inner),
            bytes_out: 0,
        }
    }

    /// Number of uncompressed bytes handed out or skipped so far
    pub fn position(&self) -> u64 {
        self.bytes_out
    }

    /// Read exactly `buf.len()` bytes
    pub fn request(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact(buf)
    }

    /// Read a single byte, `None` on a clean end of stream
    pub fn request_tag(&mut self) -> io::Result<Option<u8>> {
        let mut tag = [0_u8; 1];
        match self.read_exact(&mut tag) {
            Ok(()) => Ok(Some(tag[0])),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Discard exactly `len` bytes
    pub fn skip(&mut self, len: u64) -> io::Result<()> {
        let skipped = io::copy(&mut self.by_ref().take(len), &mut io::sink())?;
        if skipped != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {} bytes into a {len} byte skip", skipped),
            ));
        }
        Ok(())
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.decoder.read(buf)?;
        self.bytes_out += n as u64;
        Ok(n)
    }
}
