//! Bounded non-blocking byte transport for the map/reduce shuffle.
//!
//! Each mapper/reducer pair is connected by a bounded chunk channel. The
//! sending side never blocks the mapper outright: a full channel is retried
//! under a sliding back-off (yield, then a ~2 ms sleep after 50 empty polls),
//! the same progress discipline the scoring pipelines use everywhere.
//!
//! Streams are gzip-compressed and line-delimited: ids in decimal separated
//! by single spaces, floats as base-64 of their little-endian IEEE-754 bits.
//! A trailing empty line marks end-of-stream before the channel closes.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError};
use std::time::Duration;

pub const CHUNK_BYTES: usize = 64 * 1024;
pub const CHANNEL_SLOTS: usize = 64;
pub const LINE_SLOTS: usize = 1024;

const SLEEP_AFTER: u32 = 50;

/// Sliding back-off for busy polls: yield on a miss, and after `SLEEP_AFTER`
/// consecutive misses sleep for ~2 ms and start over.
pub fn loop_sleep(found: bool, non_found: u32) -> u32 {
    if found {
        return 0;
    }
    if non_found + 1 >= SLEEP_AFTER {
        std::thread::sleep(Duration::from_nanos(2_000_001));
        0
    } else {
        std::thread::yield_now();
        non_found + 1
    }
}

/// Non-blocking chunked writer over a bounded channel.
struct ChunkWriter {
    tx: SyncSender<Vec<u8>>,
    buf: Vec<u8>,
}

impl ChunkWriter {
    fn new(tx: SyncSender<Vec<u8>>) -> ChunkWriter {
        ChunkWriter {
            tx,
            buf: Vec::with_capacity(CHUNK_BYTES),
        }
    }

    fn send_chunk(&mut self, chunk: Vec<u8>) -> std::io::Result<()> {
        let mut pending = chunk;
        let mut non_found = 0u32;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    non_found = loop_sleep(false, non_found);
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "receiver closed the stream",
                    ));
                }
            }
        }
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= CHUNK_BYTES {
            let rest = self.buf.split_off(CHUNK_BYTES);
            let chunk = std::mem::replace(&mut self.buf, rest);
            self.send_chunk(chunk)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.send_chunk(chunk)?;
        }
        Ok(())
    }
}

/// One mapper-side outbound record stream.
pub struct RecordStream {
    gz: Option<GzEncoder<ChunkWriter>>,
}

impl RecordStream {
    pub fn new(tx: SyncSender<Vec<u8>>) -> RecordStream {
        RecordStream {
            gz: Some(GzEncoder::new(ChunkWriter::new(tx), Compression::fast())),
        }
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let gz = self.gz.as_mut().expect("stream already finished");
        gz.write_all(line.as_bytes())?;
        gz.write_all(b"\n")?;
        Ok(())
    }

    /// Write the end-of-stream marker and close the channel. A receiver that
    /// already parsed the marker may have hung up; the dangling compression
    /// trailer is padding by then, so a broken pipe here is not an error.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut gz) = self.gz.take() {
            let res: std::io::Result<()> = (|| {
                gz.write_all(b"\n")?;
                let mut writer = gz.finish()?;
                writer.flush()
            })();
            match res {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(e).context("failed to finish record stream"),
            }
        } else {
            Ok(())
        }
    }
}

struct ChunkReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for ChunkReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos == self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.current.len() - self.pos);
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Round-robin merge over a reducer's inbound streams. Each source is
/// drained by its own progress thread (decompress + split into lines) so a
/// slow source never stalls its siblings; the merge itself polls the bounded
/// line queues with the usual back-off. A corrupted stream is reported, not
/// swallowed.
pub struct Collator {
    sources: Vec<Option<Receiver<std::result::Result<String, String>>>>,
}

impl Collator {
    pub fn new(inbound: Vec<Receiver<Vec<u8>>>) -> Collator {
        let sources = inbound
            .into_iter()
            .map(|rx| {
                let (line_tx, line_rx) = std::sync::mpsc::sync_channel(LINE_SLOTS);
                std::thread::spawn(move || {
                    // A channel that closes before sending anything is a
                    // source that never opened, not an error.
                    let first = match rx.recv() {
                        Ok(chunk) => chunk,
                        Err(_) => return,
                    };
                    let reader = BufReader::new(GzDecoder::new(ChunkReader {
                        rx,
                        current: first,
                        pos: 0,
                    }));
                    for line in reader.lines() {
                        match line {
                            // Empty line is the end-of-stream marker.
                            Ok(line) if line.is_empty() => break,
                            Ok(line) => {
                                if line_tx.send(Ok(line)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                let _ = line_tx.send(Err(format!("inbound stream: {err}")));
                                break;
                            }
                        }
                    }
                });
                Some(line_rx)
            })
            .collect();
        Collator { sources }
    }

    /// Next record from any source, None once every source has finished, or
    /// the transport error that corrupted a stream.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        let mut non_found = 0u32;
        loop {
            let mut live = false;
            for slot in self.sources.iter_mut() {
                let Some(rx) = slot else { continue };
                match rx.try_recv() {
                    Ok(Ok(line)) => return Ok(Some(line)),
                    Ok(Err(err)) => {
                        *slot = None;
                        bail!("{err}");
                    }
                    Err(TryRecvError::Empty) => live = true,
                    Err(TryRecvError::Disconnected) => *slot = None,
                }
            }
            if !live {
                return Ok(None);
            }
            non_found = loop_sleep(false, non_found);
        }
    }
}

pub fn encode_f32(v: f32) -> String {
    STANDARD.encode(v.to_le_bytes())
}

pub fn decode_f32(s: &str) -> Result<f32> {
    let raw = STANDARD
        .decode(s)
        .with_context(|| format!("bad float field: {s:?}"))?;
    if raw.len() != 4 {
        bail!("bad float field width: {s:?}");
    }
    Ok(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Channel matrix for one pipeline: `senders[m]` are mapper m's streams to
/// every reducer, `receivers[t]` are reducer t's inbound ends from every
/// mapper. This matrix is the inter-communicator of the worker pool.
pub fn channel_grid(
    shards: usize,
) -> (Vec<Vec<SyncSender<Vec<u8>>>>, Vec<Vec<Receiver<Vec<u8>>>>) {
    let mut senders: Vec<Vec<SyncSender<Vec<u8>>>> = (0..shards).map(|_| Vec::new()).collect();
    let mut receivers: Vec<Vec<Receiver<Vec<u8>>>> = Vec::with_capacity(shards);
    for _target in 0..shards {
        receivers.push(Vec::with_capacity(shards));
    }
    for sender_row in senders.iter_mut() {
        for receiver_col in receivers.iter_mut() {
            let (tx, rx) = std::sync::mpsc::sync_channel(CHANNEL_SLOTS);
            sender_row.push(tx);
            receiver_col.push(rx);
        }
    }
    (senders, receivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::LOGPROB_MIN;

    #[test]
    fn float_codec_roundtrips() {
        for v in [0.0f32, -1.5, 3.25e-8, LOGPROB_MIN, f32::MAX] {
            let encoded = encode_f32(v);
            assert_eq!(decode_f32(&encoded).unwrap(), v);
        }
        assert!(decode_f32("not-base64!").is_err());
        assert!(decode_f32("AAAA").is_err()); // 3 bytes, wrong width
    }

    #[test]
    fn records_flow_through_the_grid() {
        let (mut senders, mut receivers) = channel_grid(2);
        let to_zero = senders.remove(0).remove(0);
        drop(senders);

        let writer = std::thread::spawn(move || {
            let mut stream = RecordStream::new(to_zero);
            for i in 0..5000u32 {
                stream
                    .write_line(&format!("{i} {}", encode_f32(-(i as f32))))
                    .unwrap();
            }
            stream.finish().unwrap();
        });

        let mut collator = Collator::new(receivers.remove(0));
        let mut seen = 0u32;
        while let Some(line) = collator.next_line().unwrap() {
            let mut parts = line.split(' ');
            let id: u32 = parts.next().unwrap().parse().unwrap();
            let v = decode_f32(parts.next().unwrap()).unwrap();
            assert_eq!(id, seen);
            assert_eq!(v, -(seen as f32));
            seen += 1;
        }
        assert_eq!(seen, 5000);
        writer.join().unwrap();
    }

    #[test]
    fn back_off_counter_slides() {
        assert_eq!(loop_sleep(true, 30), 0);
        assert_eq!(loop_sleep(false, 0), 1);
        assert_eq!(loop_sleep(false, 49), 0); // slept and reset
    }
}
