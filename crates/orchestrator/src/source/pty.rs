use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use super::{OutputSource, ReadOutcome};
use crate::decode::Utf8Decoder;
use crate::error::Result;

/// Largest chunk read from the master in one call
pub const CHUNK_SIZE: usize = 4096;

/// Non-blocking reader over a pseudo-terminal master.
///
/// Waits at most `poll_interval` for readiness per call. Once `exited` fires
/// the reader keeps returning data until the master runs dry, then reports
/// [`ReadOutcome::Finished`].
pub struct PtyReader {
    fd: AsyncFd<File>,
    exited: CancellationToken,
    poll_interval: Duration,
    buf: Vec<u8>,
}

impl PtyReader {
    pub fn new(master: OwnedFd, exited: CancellationToken, poll_interval: Duration) -> Result<Self> {
        set_nonblocking(&master)?;
        let fd = AsyncFd::new(File::from(master))?;

        Ok(Self {
            fd,
            exited,
            poll_interval,
            buf: vec![0; CHUNK_SIZE],
        })
    }

    pub async fn read_bytes(&mut self) -> Result<ReadOutcome<Bytes>> {
        let mut guard = match tokio::time::timeout(self.poll_interval, self.fd.readable()).await {
            Ok(ready) => ready?,
            Err(_) => return Ok(self.quiet_outcome()),
        };

        let buf = &mut self.buf;
        let read = guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.read(buf)
        });

        match read {
            Ok(Ok(0)) => Ok(ReadOutcome::Finished),
            Ok(Ok(n)) => Ok(ReadOutcome::Data(Bytes::copy_from_slice(&self.buf[..n]))),
            // Linux reports EIO on the master once every slave descriptor is closed.
            Ok(Err(e)) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                tracing::debug!("PTY closed by the child side");
                Ok(ReadOutcome::Finished)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_would_block) => Ok(self.quiet_outcome()),
        }
    }

    fn quiet_outcome(&self) -> ReadOutcome<Bytes> {
        if self.exited.is_cancelled() {
            ReadOutcome::Finished
        } else {
            ReadOutcome::Idle
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// PTY output as text blocks, never split on lines
pub struct PtySource {
    reader: PtyReader,
    decoder: Utf8Decoder,
}

impl PtySource {
    pub fn new(reader: PtyReader) -> Self {
        Self {
            reader,
            decoder: Utf8Decoder::new(),
        }
    }
}

#[async_trait]
impl OutputSource for PtySource {
    async fn read_chunk(&mut self) -> Result<ReadOutcome<String>> {
        Ok(match self.reader.read_bytes().await? {
            ReadOutcome::Data(bytes) => {
                let text = self.decoder.decode(&bytes);
                if text.is_empty() {
                    ReadOutcome::Idle
                } else {
                    ReadOutcome::Data(text)
                }
            }
            ReadOutcome::Idle => ReadOutcome::Idle,
            ReadOutcome::Finished => ReadOutcome::Finished,
        })
    }

    // The reader already waited for readiness.
    async fn idle(&mut self, _interval: Duration) {}

    fn flush(&mut self) -> Option<String> {
        self.decoder.finish()
    }
}
