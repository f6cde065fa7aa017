//! Framed IPC over pipes.
//!
//! Each pipe carries a concatenation of bincode values. bincode's encoding
//! is self-delimiting, so there is no length prefix: the reader decodes one
//! value after another until end-of-stream.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Buffer size for the reading side (64KB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create from a raw file descriptor (takes ownership).
    ///
    /// # Safety
    /// The caller must ensure `fd` is an open descriptor owned by nobody else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decodes values from the reading end of a pipe.
pub struct FrameReader {
    reader: BufReader<PipeFd>,
}

impl FrameReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, fd),
        }
    }

    /// Decode the next value. Returns `None` on end-of-stream between values;
    /// a stream that ends inside a value is a codec error.
    pub fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        Ok(Some(bincode::deserialize_from(&mut self.reader)?))
    }
}

/// Encodes values onto the writing end of a pipe.
///
/// A value is encoded completely before any byte is written, so a value
/// that fails to encode never leaves a partial frame on the pipe.
pub struct FrameWriter {
    fd: PipeFd,
    buffer: Vec<u8>,
}

impl FrameWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            buffer: Vec::with_capacity(4096),
        }
    }

    pub fn send<M: Serialize + ?Sized>(&mut self, message: &M) -> Result<()> {
        self.buffer.clear();
        bincode::serialize_into(&mut self.buffer, message)?;
        self.fd.write_all(&self.buffer)?;
        Ok(())
    }
}

/// True for the IO failures that mean the other side of the pipe is gone.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParxError;
    use serde::Deserialize;
    use std::os::unix::io::IntoRawFd;

    fn create_pipe() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        unsafe {
            (
                PipeFd::from_raw(read_fd.into_raw_fd()),
                PipeFd::from_raw(write_fd.into_raw_fd()),
            )
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        index: usize,
        args: Vec<String>,
    }

    #[test]
    fn test_frames_are_self_delimiting() {
        let (read_fd, write_fd) = create_pipe();
        let mut reader = FrameReader::new(read_fd);
        let mut writer = FrameWriter::new(write_fd);

        writer
            .send(&Job {
                index: 0,
                args: vec!["a".into(), "b c".into()],
            })
            .unwrap();
        writer
            .send(&Job {
                index: 1,
                args: vec![],
            })
            .unwrap();
        drop(writer);

        assert_eq!(reader.recv::<Job>().unwrap().map(|j| j.args.len()), Some(2));
        assert_eq!(reader.recv::<Job>().unwrap().map(|j| j.index), Some(1));
        assert!(reader.recv::<Job>().unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let (read_fd, mut write_fd) = create_pipe();
        let mut reader = FrameReader::new(read_fd);

        let bytes = bincode::serialize(&"a fairly long string").unwrap();
        write_fd.write_all(&bytes[..bytes.len() / 2]).unwrap();
        drop(write_fd);

        match reader.recv::<String>() {
            Err(ParxError::Codec(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_write_to_closed_pipe() {
        let (read_fd, write_fd) = create_pipe();
        let mut writer = FrameWriter::new(write_fd);
        drop(read_fd);

        match writer.send(&42u64) {
            Err(ParxError::Io(err)) => assert!(is_disconnect(&err)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
