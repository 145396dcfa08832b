use crate::Result;
use std::fs::File;
use std::io;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub struct BufReaderWithPos<R: Read + Seek> {
    reader: BufReader<R>,
    pos: u64,
    #[cfg(debug_assertions)]
    end: u64,
}

impl<R: Read + Seek> BufReaderWithPos<R> {
    pub(crate) fn new(mut inner: R) -> Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        #[cfg(debug_assertions)]
        let end = {
            let end = inner.seek(SeekFrom::End(0))?;
            inner.seek(SeekFrom::Start(pos))?;
            end
        };

        Ok(BufReaderWithPos {
            reader: BufReader::new(inner),
            pos,
            #[cfg(debug_assertions)]
            end,
        })
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

impl<R: Read + Seek> Read for BufReaderWithPos<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;
        #[cfg(debug_assertions)]
        debug_assert!(self.pos <= self.end, "{}, {}", self.pos, self.end);
        Ok(len)
    }
}

impl<R: Read + Seek> Seek for BufReaderWithPos<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        #[cfg(debug_assertions)]
        debug_assert!(self.pos <= self.end, "{}, {}", self.pos, self.end);
        Ok(self.pos)
    }
}

pub struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pub pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }
}

impl BufWriterWithPos<File> {
    /// Flush the buffer and persist the file content.
    pub fn sync_data(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    /// Drop everything after `len`.
    pub fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(len)?;
        self.pos = self.writer.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write + Seek> Seek for BufWriterWithPos<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.writer.seek(pos)?;
        Ok(self.pos)
    }
}

pub fn read_u8(reader: &mut impl Read) -> Result<u8> {
    let mut num = [0u8; 1];
    reader.read_exact(&mut num)?;
    Ok(num[0])
}

pub fn read_u16(reader: &mut impl Read) -> Result<u16> {
    let mut nums = [0u8; 2];
    reader.read_exact(&mut nums)?;
    Ok(u16::from_le_bytes(nums))
}

pub fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut nums = [0u8; 4];
    reader.read_exact(&mut nums)?;
    Ok(u32::from_le_bytes(nums))
}

pub fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut nums = [0u8; 8];
    reader.read_exact(&mut nums)?;
    Ok(u64::from_le_bytes(nums))
}

pub fn read_bytes_exact(reader: &mut impl Read, length: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(length as usize);
    let mut handle = reader.take(length);
    handle.read_to_end(&mut buf)?;
    if (buf.len() as u64) < length {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(buf)
}

pub fn read_string_exact(reader: &mut impl Read, length: u32) -> Result<String> {
    let mut s = String::new();
    let mut handle = reader.take(length as u64);
    handle.read_to_string(&mut s)?;
    if s.len() < length as usize {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(s)
}

/// Persist a rename inside `dir`.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
