//! Shared shutdown signal.
//!
//! One connected socket pair per server. Every worker registers the read end
//! in its own poll; writing a single byte to the other end makes it readable
//! everywhere at once. The byte is never read, so a worker that registers
//! after the signal fired still sees it.
//!
//! SIGINT/SIGTERM are routed onto the same socket through one process-wide
//! slot holding the write end's descriptor.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Descriptor written by the signal handler, or -1.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

/// Both ends of the shutdown socket pair.
pub(crate) struct ShutdownSignal {
    reader: UnixStream,
    writer: Arc<UnixStream>,
}

impl ShutdownSignal {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            writer: Arc::new(writer),
        })
    }

    /// Descriptor to register for readability in each worker's poll.
    pub fn reader_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            writer: Arc::clone(&self.writer),
        }
    }

    /// Route SIGINT and SIGTERM to this signal, replacing any previous
    /// registration. SIGPIPE is ignored so failed writes surface as errors.
    pub fn register_signal_handlers(&self) -> io::Result<()> {
        SIGNAL_FD.store(self.writer.as_raw_fd(), Ordering::SeqCst);

        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: `on_signal` only performs an atomic load and write(2), both
        // async-signal-safe.
        unsafe {
            for signal in [libc::SIGINT, libc::SIGTERM] {
                if libc::signal(signal, handler) == libc::SIG_ERR {
                    return Err(io::Error::last_os_error());
                }
            }
            if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        // only clear the slot if it still points at this signal
        let _ = SIGNAL_FD.compare_exchange(
            self.writer.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

extern "C" fn on_signal(_signal: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: `byte` outlives the call; the result is deliberately ignored.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

/// Handle for requesting shutdown from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    writer: Arc<UnixStream>,
}

impl ShutdownHandle {
    /// Wake every worker and make `serve` return. Idempotent.
    pub fn shutdown(&self) {
        loop {
            match (&*self.writer).write(&[1]) {
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // socket buffer full: the signal is already pending
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "Shutdown signal write failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn pending(signal: &ShutdownSignal) -> usize {
        let mut buf = [0u8; 16];
        match (&signal.reader).read(&mut buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => panic!("read failed: {e}"),
        }
    }

    #[test]
    fn test_handle_wakes_reader() {
        let signal = ShutdownSignal::new().unwrap();
        assert_eq!(pending(&signal), 0);

        let handle = signal.handle();
        std::thread::spawn(move || handle.shutdown()).join().unwrap();
        assert_eq!(pending(&signal), 1);
    }

    #[test]
    fn test_repeated_shutdown_is_harmless() {
        let signal = ShutdownSignal::new().unwrap();
        let handle = signal.handle();
        for _ in 0..3 {
            handle.clone().shutdown();
        }
        assert_eq!(pending(&signal), 3);
    }

    #[test]
    fn test_drop_clears_signal_slot() {
        let signal = ShutdownSignal::new().unwrap();
        let fd = signal.writer.as_raw_fd();
        SIGNAL_FD.store(fd, Ordering::SeqCst);

        drop(signal);
        assert_ne!(SIGNAL_FD.load(Ordering::SeqCst), fd);
    }

    #[test]
    fn test_register_installs_handler() {
        let signal = ShutdownSignal::new().unwrap();
        signal.register_signal_handlers().unwrap();

        let expected = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        for sig in [libc::SIGINT, libc::SIGTERM] {
            // SAFETY: a null new action only queries the current one.
            let installed = unsafe {
                let mut current: libc::sigaction = std::mem::zeroed();
                assert_eq!(libc::sigaction(sig, std::ptr::null(), &mut current), 0);
                current.sa_sigaction
            };
            assert_eq!(installed, expected);
        }
    }
}
