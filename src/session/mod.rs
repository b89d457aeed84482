//! Flow dump persistence
//!
//! A dump is a flat, append-only sequence of frames, one per flow. Each frame
//! is a netstring: the decimal payload length, `:`, a JSON `FlowState`, `,`.
//! There is no file header, so dumps can be appended to indefinitely and read
//! back without knowing the flow count.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use crate::error::SerializeError;
use crate::flow::{Flow, FlowState, STATE_VERSION};

/// Frames larger than this are treated as corrupt
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Longest accepted length prefix, in digits
const MAX_PREFIX_DIGITS: usize = 12;

/// Streaming flow writer
pub struct FlowWriter<W: Write> {
    inner: W,
    count: usize,
}

impl<W: Write> FlowWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    /// Append one flow snapshot
    pub fn add(&mut self, flow: &Flow) -> Result<(), SerializeError> {
        let payload = serde_json::to_vec(&flow.get_state()).map_err(io::Error::from)?;
        write!(self.inner, "{}:", payload.len())?;
        self.inner.write_all(&payload)?;
        self.inner.write_all(b",")?;
        self.count += 1;
        Ok(())
    }

    /// Flows written by this writer
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn flush(&mut self) -> Result<(), SerializeError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Streaming flow reader
pub struct FlowReader<R: Read> {
    inner: BufReader<R>,
    offset: u64,
    failed: bool,
}

impl<R: Read> FlowReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            offset: 0,
            failed: false,
        }
    }

    /// Lazily read flows until end of input.
    ///
    /// A corrupt frame yields one error, after which the stream ends.
    pub fn stream(&mut self) -> FlowStream<'_, R> {
        FlowStream { reader: self }
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<Flow>, SerializeError> {
        let start = self.offset;
        let malformed = |reason: String| SerializeError::MalformedFrame {
            offset: start,
            reason,
        };

        let mut digits = String::new();
        loop {
            match self.read_byte()? {
                None if digits.is_empty() => return Ok(None),
                None => return Err(SerializeError::Truncated { offset: start }),
                Some(b':') => break,
                Some(b) if b.is_ascii_digit() => {
                    digits.push(b as char);
                    if digits.len() > MAX_PREFIX_DIGITS {
                        return Err(malformed("length prefix too long".into()));
                    }
                }
                Some(b) => {
                    return Err(malformed(format!("unexpected byte 0x{:02x} in length prefix", b)));
                }
            }
        }

        let len: usize = digits
            .parse()
            .map_err(|_| malformed("empty length prefix".into()))?;
        if len > MAX_FRAME_LEN {
            return Err(malformed(format!("frame length {} exceeds limit", len)));
        }

        let mut payload = vec![0u8; len];
        match self.inner.read_exact(&mut payload) {
            Ok(()) => self.offset += len as u64,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SerializeError::Truncated { offset: start });
            }
            Err(e) => return Err(e.into()),
        }

        match self.read_byte()? {
            Some(b',') => {}
            Some(_) => return Err(malformed("missing frame terminator".into())),
            None => return Err(SerializeError::Truncated { offset: start }),
        }

        let state: FlowState =
            serde_json::from_slice(&payload).map_err(|e| SerializeError::InvalidSnapshot {
                offset: start,
                reason: e.to_string(),
            })?;
        if state.version != STATE_VERSION {
            return Err(SerializeError::InvalidSnapshot {
                offset: start,
                reason: format!("unsupported snapshot version {}", state.version),
            });
        }

        Ok(Some(Flow::from_state(state)))
    }
}

impl<R: Read + Seek> FlowReader<R> {
    /// Restart reading from the beginning of the input
    pub fn rewind(&mut self) -> Result<(), SerializeError> {
        self.inner.rewind()?;
        self.offset = 0;
        self.failed = false;
        Ok(())
    }
}

/// Iterator over the flows of a `FlowReader`
pub struct FlowStream<'a, R: Read> {
    reader: &'a mut FlowReader<R>,
}

impl<R: Read> Iterator for FlowStream<'_, R> {
    type Item = Result<Flow, SerializeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.failed {
            return None;
        }
        match self.reader.read_frame() {
            Ok(Some(flow)) => Some(Ok(flow)),
            Ok(None) => None,
            Err(e) => {
                self.reader.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Append flows to a dump file, creating it if needed
pub fn append_flows<'a>(
    path: &Path,
    flows: impl IntoIterator<Item = &'a Flow>,
) -> Result<usize, SerializeError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = FlowWriter::new(BufWriter::new(file));
    for flow in flows {
        writer.add(flow)?;
    }
    writer.flush()?;
    tracing::info!(count = writer.count(), path = %path.display(), "Wrote flows");
    Ok(writer.count())
}

/// Read every flow of a dump file
pub fn read_flows(path: &Path) -> Result<Vec<Flow>, SerializeError> {
    let file = File::open(path)?;
    let mut reader = FlowReader::new(file);
    let flows = reader.stream().collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(count = flows.len(), path = %path.display(), "Read flows");
    Ok(flows)
}
