//! Base stream providers: plain files, memory maps, and the HTTP stub
//!
//! A base provider is the bottom layer of a stream: byte-exact random
//! access I/O with no knowledge of blocks or availability.

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The bottom layer of a stream stack
#[derive(Debug)]
pub(crate) enum BaseProvider {
    File(FileBase),
    #[cfg(feature = "mmap")]
    Map(MapBase),
    Http(HttpBase),
}

impl BaseProvider {
    pub(crate) fn open_file(path: &Path, read_only: bool) -> Result<Self> {
        FileBase::open(path, read_only).map(BaseProvider::File)
    }

    pub(crate) fn create_file(path: &Path) -> Result<Self> {
        FileBase::create(path).map(BaseProvider::File)
    }

    #[cfg(feature = "mmap")]
    pub(crate) fn open_map(path: &Path) -> Result<Self> {
        MapBase::open(path).map(BaseProvider::Map)
    }

    pub(crate) fn open_http(url: &str) -> Result<Self> {
        Ok(BaseProvider::Http(HttpBase {
            url: url.to_string(),
        }))
    }

    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            BaseProvider::File(base) => base.read_at(offset, buf),
            #[cfg(feature = "mmap")]
            BaseProvider::Map(base) => base.read_at(offset, buf),
            BaseProvider::Http(base) => base.read_at(offset, buf),
        }
    }

    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            BaseProvider::File(base) => base.write_at(offset, data),
            #[cfg(feature = "mmap")]
            BaseProvider::Map(_) => Err(Error::unsupported("memory-mapped streams are read-only")),
            BaseProvider::Http(_) => Err(Error::unsupported("HTTP streams are read-only")),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        match self {
            BaseProvider::File(base) => base.size,
            #[cfg(feature = "mmap")]
            BaseProvider::Map(base) => base.map.len() as u64,
            BaseProvider::Http(_) => 0,
        }
    }

    pub(crate) fn set_size(&mut self, new_size: u64) -> Result<()> {
        match self {
            BaseProvider::File(base) => base.set_size(new_size),
            #[cfg(feature = "mmap")]
            BaseProvider::Map(_) => Err(Error::unsupported("memory-mapped streams are read-only")),
            BaseProvider::Http(_) => Err(Error::unsupported("HTTP streams are read-only")),
        }
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        if let BaseProvider::File(base) = self {
            base.file.flush()?;
        }
        Ok(())
    }

    pub(crate) fn is_read_only(&self) -> bool {
        match self {
            BaseProvider::File(base) => base.read_only,
            #[cfg(feature = "mmap")]
            BaseProvider::Map(_) => true,
            BaseProvider::Http(_) => true,
        }
    }

    /// Local path, for providers that have one
    pub(crate) fn path(&self) -> Option<&Path> {
        match self {
            BaseProvider::File(base) => Some(&base.path),
            #[cfg(feature = "mmap")]
            BaseProvider::Map(base) => Some(&base.path),
            BaseProvider::Http(_) => None,
        }
    }
}

/// Ordinary file I/O with a cached file pointer
///
/// The pointer cache avoids redundant seeks on sequential access; it is
/// not observable from the outside.
#[derive(Debug)]
pub(crate) struct FileBase {
    path: PathBuf,
    file: File,
    size: u64,
    position: u64,
    read_only: bool,
}

impl FileBase {
    fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
                std::io::ErrorKind::PermissionDenied => {
                    Error::AccessDenied(path.display().to_string())
                }
                _ => Error::Io(e),
            })?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            position: 0,
            read_only,
        })
    }

    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size: 0,
            position: 0,
            read_only: false,
        })
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        if self.position != offset {
            self.file.seek(SeekFrom::Start(offset))?;
            self.position = offset;
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::EndOfFile);
        }
        self.seek_to(offset)?;
        match self.file.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // A failed read must not advance the cached position
                self.position = self.file.stream_position()?;
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Err(Error::EndOfFile)
                } else {
                    Err(Error::Io(e))
                }
            }
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::AccessDenied(self.path.display().to_string()));
        }
        self.seek_to(offset)?;
        match self.file.write_all(data) {
            Ok(()) => {
                self.position += data.len() as u64;
                self.size = self.size.max(self.position);
                Ok(())
            }
            Err(e) => {
                self.position = self.file.stream_position()?;
                if e.kind() == std::io::ErrorKind::StorageFull {
                    Err(Error::DiskFull)
                } else {
                    Err(Error::Io(e))
                }
            }
        }
    }

    fn set_size(&mut self, new_size: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::AccessDenied(self.path.display().to_string()));
        }
        self.file.set_len(new_size)?;
        self.size = new_size;
        Ok(())
    }
}

/// Read-only memory-mapped file
#[cfg(feature = "mmap")]
#[derive(Debug)]
pub(crate) struct MapBase {
    path: PathBuf,
    map: memmap2::Mmap,
}

#[cfg(feature = "mmap")]
impl MapBase {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        // Safety: the map is read-only and the file is not resized by us
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            map,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.map.len() {
            return Err(Error::EndOfFile);
        }
        buf.copy_from_slice(&self.map[offset as usize..end]);
        Ok(())
    }
}

/// Placeholder for a remote archive source
///
/// Only the contract exists: reads report the data as unavailable so the
/// caller's mirror logic treats every block as missing.
#[derive(Debug)]
pub(crate) struct HttpBase {
    #[allow(dead_code)]
    url: String,
}

impl HttpBase {
    fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> Result<()> {
        Err(Error::FileIncomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_file_base_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.bin");

        let mut base = BaseProvider::create_file(&path).unwrap();
        base.write_at(0, b"hello world").unwrap();
        assert_eq!(base.size(), 11);

        let mut buf = [0u8; 5];
        base.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        // Reads past the end fail without reading anything
        assert!(matches!(base.read_at(8, &mut buf), Err(Error::EndOfFile)));
    }

    #[test]
    fn test_file_base_sparse_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.bin");

        let mut base = BaseProvider::create_file(&path).unwrap();
        base.write_at(1000, b"x").unwrap();
        assert_eq!(base.size(), 1001);

        let mut buf = [0u8; 1];
        base.read_at(500, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
    }

    #[cfg(feature = "mmap")]
    #[test]
    fn test_map_base_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"mapped data")
            .unwrap();

        let mut base = BaseProvider::open_map(&path).unwrap();
        let mut buf = [0u8; 6];
        base.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"mapped");

        assert!(base.write_at(0, b"nope").is_err());
        assert!(base.is_read_only());
    }

    #[test]
    fn test_http_base_is_stub() {
        let mut base = BaseProvider::open_http("http://example.invalid/a.mpq").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            base.read_at(0, &mut buf),
            Err(Error::FileIncomplete)
        ));
    }
}
