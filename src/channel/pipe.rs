//! Anonymous pipe channels.
//!
//! A pipe gives its two ends as separate channels: a read-only source and a
//! write-only sink. Each end registers independently with a selector.

use std::io;
use std::sync::Arc;

use crate::channel::{finish_io, ChannelCore, SelectableChannel};
use crate::error::{MuxError, Result};
use crate::event::Ops;
use crate::utils::cvt;

pub struct Pipe;

impl Pipe {
    /// Create a pipe and wrap both ends. Ends start in blocking mode.
    pub fn new() -> Result<(Arc<PipeSource>, Arc<PipeSink>)> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
        Ok((
            Arc::new(PipeSource {
                core: ChannelCore::new(fds[0]),
            }),
            Arc::new(PipeSink {
                core: ChannelCore::new(fds[1]),
            }),
        ))
    }
}

/// The readable end of a pipe.
pub struct PipeSource {
    core: ChannelCore,
}

impl PipeSource {
    pub fn read(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        let channel: Arc<dyn SelectableChannel> = self.clone();
        let core = &self.core;
        core.begin(&channel);
        core.enter_io();
        let result = loop {
            let n = unsafe {
                libc::read(core.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) && core.is_open() {
                    continue;
                }
                break Err(err);
            }
            break Ok(n);
        };
        core.leave_io();
        finish_io(core, result).map(|n| n as usize)
    }
}

impl SelectableChannel for PipeSource {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn valid_ops(&self) -> Ops {
        Ops::READ
    }

    fn impl_close_selectable(&self) -> io::Result<()> {
        // A blocked reader wakes when the peer closes; nothing to shut down
        // on a pipe. Release the fd now unless a selector still holds it.
        if !self.core.is_registered() {
            self.core.kill()?;
        }
        Ok(())
    }
}

/// The writable end of a pipe.
pub struct PipeSink {
    core: ChannelCore,
}

impl PipeSink {
    pub fn write(self: &Arc<Self>, buf: &[u8]) -> Result<usize> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        let channel: Arc<dyn SelectableChannel> = self.clone();
        let core = &self.core;
        core.begin(&channel);
        core.enter_io();
        let result = loop {
            let n =
                unsafe { libc::write(core.fd(), buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) && core.is_open() {
                    continue;
                }
                break Err(err);
            }
            break Ok(n);
        };
        core.leave_io();
        finish_io(core, result).map(|n| n as usize)
    }
}

impl SelectableChannel for PipeSink {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn valid_ops(&self) -> Ops {
        Ops::WRITE
    }

    fn impl_close_selectable(&self) -> io::Result<()> {
        if !self.core.is_registered() {
            self.core.kill()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxError;
    use crate::interrupt;

    #[test]
    fn test_write_then_read() {
        let (source, sink) = Pipe::new().unwrap();
        assert_eq!(sink.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        let mut buf = [0u8; 4];
        let err = source.read(&mut buf).unwrap_err();
        assert!(err.is_would_block());
        assert!(source.is_open());
    }

    #[test]
    fn test_read_eof_after_sink_close() {
        let (source, sink) = Pipe::new().unwrap();
        sink.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert!(source.is_open());
    }

    #[test]
    fn test_pending_interrupt_closes_on_read() {
        let (source, _sink) = Pipe::new().unwrap();
        interrupt::current().interrupt();
        let mut buf = [0u8; 4];
        let err = source.read(&mut buf).unwrap_err();
        assert!(matches!(err, MuxError::ClosedByInterrupt));
        assert!(!source.is_open());
        // Interrupt status stays set until explicitly cleared.
        assert!(interrupt::current().take_interrupted());
    }
}
