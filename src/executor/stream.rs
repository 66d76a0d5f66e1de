//! Reader threads that move child output through a filter chain.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::filter::{Direction, FilterChain};

const READ_BUFFER_SIZE: usize = 8192;

/// Where filtered output ends up.
#[derive(Clone, Default)]
pub enum OutputSink {
    /// The harness's own stdout and stderr.
    #[default]
    Terminal,
    /// One shared writer for both streams.
    Shared(Arc<Mutex<dyn Write + Send>>),
}

impl OutputSink {
    /// A sink collecting both streams in memory, plus a handle to read it.
    pub fn buffer() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        (Self::Shared(buffer.clone()), buffer)
    }

    pub(crate) fn writer(&self, direction: Direction) -> Box<dyn Write + Send> {
        match (self, direction) {
            (Self::Terminal, Direction::Stdout) => Box::new(io::stdout()),
            (Self::Terminal, Direction::Stderr) => Box::new(io::stderr()),
            (Self::Shared(shared), _) => Box::new(SharedWriter(shared.clone())),
        }
    }
}

struct SharedWriter(Arc<Mutex<dyn Write + Send>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .0
            .lock()
            .map_err(|_| io::Error::other("output sink lock poisoned"))?;
        inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .0
            .lock()
            .map_err(|_| io::Error::other("output sink lock poisoned"))?;
        inner.flush()
    }
}

/// Decodes a byte stream as UTF-8, holding back a multi-byte sequence that
/// is split across reads until the rest arrives.
#[derive(Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Truncated sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        out
    }

    /// Whatever is still held back, replaced lossily.
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Pump `source` through `chain` into `sink` on a new thread until EOF.
///
/// The chain is flushed once at the end and handed back through the join
/// handle so the caller can close it after the child has exited.
pub(crate) fn spawn_reader<R>(
    source: R,
    mut chain: FilterChain,
    mut sink: Box<dyn Write + Send>,
) -> io::Result<JoinHandle<FilterChain>>
where
    R: Read + Send + 'static,
{
    let direction = chain.direction();
    thread::Builder::new()
        .name(format!("atmos-{direction}"))
        .spawn(move || {
            let mut source = source;
            let mut decoder = Utf8Decoder::default();
            let mut buf = [0u8; READ_BUFFER_SIZE];

            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(%direction, error = %e, "output read failed");
                        break;
                    }
                };
                trace!(%direction, bytes = n, "read child output");
                let text = decoder.decode(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                let filtered = chain.transform(&text, false);
                emit(&mut sink, &filtered, direction);
            }

            let tail = decoder.finish();
            let filtered = chain.transform(&tail, true);
            emit(&mut sink, &filtered, direction);
            debug!(%direction, "output stream closed");
            chain
        })
}

// A sink that stops accepting output must not stall the child, so write
// failures are logged and reading continues.
fn emit(sink: &mut dyn Write, text: &str, direction: Direction) {
    if text.is_empty() {
        return;
    }
    if let Err(e) = sink.write_all(text.as_bytes()).and_then(|()| sink.flush()) {
        debug!(%direction, error = %e, "dropping filtered output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterError, OutputFilter};
    use std::io::Cursor;

    struct Upper;

    impl OutputFilter for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn filter(&mut self, chunk: &str, flushing: bool) -> Result<String, FilterError> {
            let mut out = chunk.to_uppercase();
            if flushing {
                out.push_str("<eof>");
            }
            Ok(out)
        }
    }

    /// Hands out its bytes in fixed-size reads.
    struct Dribble {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Dribble {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = (self.pos + self.step).min(self.data.len());
            let n = (end - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn decoder_carries_split_sequences() {
        let bytes = "héllo ✓".as_bytes();
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, "héllo ✓");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xe2\x9c"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn reader_filters_into_shared_sink() {
        let (sink, buffer) = OutputSink::buffer();
        let chain = FilterChain::new(Direction::Stdout, vec![Box::new(Upper)]);
        let handle = spawn_reader(
            Cursor::new(b"plan ok\n".to_vec()),
            chain,
            sink.writer(Direction::Stdout),
        )
        .unwrap();

        let chain = handle.join().unwrap();
        assert_eq!(chain.direction(), Direction::Stdout);
        let written = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(written, "PLAN OK\n<eof>");
    }

    #[test]
    fn reader_never_splits_characters() {
        let (sink, buffer) = OutputSink::buffer();
        let chain = FilterChain::new(Direction::Stderr, Vec::new());
        let text = "ünïcödé ✓ output\n".repeat(20);
        let source = Dribble {
            data: text.as_bytes().to_vec(),
            pos: 0,
            step: 3,
        };
        let handle = spawn_reader(source, chain, sink.writer(Direction::Stderr)).unwrap();
        handle.join().unwrap();

        let written = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(written, text);
    }
}
