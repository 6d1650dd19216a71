//! In-process chunked byte pipe
//!
//! Connects the wire-protocol writers to the stdin streams of the remote
//! commands without an intermediate file. Backpressure comes from the
//! bounded channel: a stalled reader eventually blocks the writer.

use std::io::{self, Read, Write};
use std::sync::mpsc;

/// Number of chunks allowed in flight before the writer blocks.
const CHANNEL_BUFFER: usize = 16;
/// Size of each chunk in bytes.
const CHUNK_SIZE: usize = 64 * 1024;

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(CHANNEL_BUFFER);
    (
        PipeWriter {
            tx,
            buffer: Vec::with_capacity(CHUNK_SIZE),
        },
        PipeReader {
            rx,
            buffer: Vec::new(),
            buffer_pos: 0,
        },
    )
}

/// Write half: buffers into fixed-size chunks sent through the channel.
/// Dropping the writer flushes the tail chunk and signals EOF.
pub struct PipeWriter {
    tx: mpsc::SyncSender<Vec<u8>>,
    buffer: Vec<u8>,
}

impl PipeWriter {
    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(CHUNK_SIZE));
            self.tx
                .send(chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        }
        Ok(())
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let available = CHUNK_SIZE - self.buffer.len();
            let to_write = remaining.len().min(available);

            self.buffer.extend_from_slice(&remaining[..to_write]);
            written += to_write;
            remaining = &remaining[to_write..];

            if self.buffer.len() >= CHUNK_SIZE {
                self.flush_buffer()?;
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}

/// Read half: drains chunks from the channel; sender drop means EOF.
pub struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Serve out of the current chunk first
        if self.buffer_pos < self.buffer.len() {
            let available = self.buffer.len() - self.buffer_pos;
            let to_copy = available.min(buf.len());
            buf[..to_copy]
                .copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + to_copy]);
            self.buffer_pos += to_copy;
            return Ok(to_copy);
        }

        match self.rx.recv() {
            Ok(chunk) => {
                if chunk.is_empty() {
                    return Ok(0);
                }

                self.buffer = chunk;
                self.buffer_pos = 0;

                let to_copy = self.buffer.len().min(buf.len());
                buf[..to_copy].copy_from_slice(&self.buffer[..to_copy]);
                self.buffer_pos = to_copy;
                Ok(to_copy)
            }
            Err(_) => Ok(0), // Channel closed, EOF
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn round_trips_bytes_across_threads() {
        let (mut w, mut r) = pipe();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = thread::spawn(move || {
            w.write_all(&payload).unwrap();
            // drop flushes the tail and closes the channel
        });

        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        writer.join().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn eof_after_writer_drop() {
        let (w, mut r) = pipe();
        drop(w);
        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_fails_after_reader_drop() {
        let (mut w, r) = pipe();
        drop(r);
        let big = vec![0u8; CHUNK_SIZE * 2];
        assert!(w.write_all(&big).is_err());
    }
}
