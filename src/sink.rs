//! Positional output sink for the image being written

use std::fs::File;
use std::io;
use std::sync::Mutex;

/// Where the image bytes land.
///
/// The writer task is the only writer; dedup verification reads previously
/// written ranges concurrently through `read_at`, which is why reads take
/// `&self`. Reads and writes never overlap in range while in flight.
pub trait Sink: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn set_len(&self, len: u64) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(unix)]
impl Sink for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.write_all_at(buf, offset)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// In-memory sink, for tests and callers that want the image as bytes
#[derive(Default)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf.into_inner().unwrap()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }
}

impl Sink for MemorySink {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let inner = self.buf.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > inner.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of image"));
        }
        buf.copy_from_slice(&inner[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.buf.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if inner.len() < end {
            inner.resize(end, 0);
        }
        inner[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.buf.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.buf.lock().unwrap().len() as u64)
    }
}
