//! Forwarding of overflow signals to the handling task.
//!
//! The signal handler only copies `si_code` and `si_fd` into a pipe; all
//! decoding happens in the task that reads the other end.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use async_trait::async_trait;
use libc::{c_int, c_long, c_void};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tokio::io::unix::AsyncFd;

use crate::{Delivery, DeliverySource, Error, Notification};

const FRAME_LEN: usize = 8;
const SHUTDOWN_FD: RawFd = -1;

// Write end of the relay pipe, read by the signal handler
static RELAY_FD: AtomicI32 = AtomicI32::new(-1);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Leading fields of `siginfo_t` for SIGPOLL-class signals
#[repr(C)]
#[allow(dead_code)]
struct SigPollInfo {
    si_signo: c_int,
    si_errno: c_int,
    si_code: c_int,
    si_band: c_long,
    si_fd: c_int,
}

fn encode_frame(code: i32, fd: RawFd) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..4].copy_from_slice(&code.to_ne_bytes());
    frame[4..].copy_from_slice(&fd.to_ne_bytes());
    frame
}

fn decode_frame(frame: [u8; FRAME_LEN]) -> Delivery {
    let mut code = [0u8; 4];
    let mut fd = [0u8; 4];
    code.copy_from_slice(&frame[..4]);
    fd.copy_from_slice(&frame[4..]);
    let (code, fd) = (i32::from_ne_bytes(code), RawFd::from_ne_bytes(fd));
    if code == 0 && fd == SHUTDOWN_FD {
        return Delivery::Shutdown;
    }
    Delivery::Notification(Notification::new(fd, code))
}

extern "C" fn on_signal(_signo: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    let fd = RELAY_FD.load(Ordering::Acquire);
    if fd < 0 || info.is_null() {
        return;
    }
    let info = unsafe { &*(info as *const SigPollInfo) };
    let frame = encode_frame(info.si_code, info.si_fd);

    // write() may clobber errno of the interrupted code
    unsafe {
        let errno = *libc::__errno_location();
        libc::write(fd, frame.as_ptr() as *const c_void, frame.len());
        *libc::__errno_location() = errno;
    }
}

/// Installed handler for one signal; dropping it restores the previous disposition.
pub struct SignalRelay {
    signal: Signal,
    previous: SigAction,
    write: OwnedFd,
}

/// Reading end of the relay, owned by the handling task
pub struct RelayReceiver {
    read: AsyncFd<File>,
}

impl SignalRelay {
    /// Install the relay handler for `signal`; only one relay can exist at a time.
    ///
    /// Must be called from within a tokio runtime, which drives the receiver.
    pub fn install(signal: Signal) -> Result<(SignalRelay, RelayReceiver), Error> {
        let setup = |op, source| Error::Setup {
            op,
            event: signal.to_string(),
            source,
        };

        if let Err(e) = tokio::runtime::Handle::try_current() {
            return Err(setup(
                "install signal relay",
                io::Error::new(io::ErrorKind::Unsupported, e),
            ));
        }

        if INSTALLED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(setup(
                "install signal relay",
                io::Error::new(io::ErrorKind::AlreadyExists, "a relay is already installed"),
            ));
        }

        let result = Self::open_pipe().and_then(|(read, write)| {
            let read = AsyncFd::new(File::from(read))?;
            RELAY_FD.store(write.as_raw_fd(), Ordering::Release);

            let action = SigAction::new(
                SigHandler::SigAction(on_signal),
                SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            let previous = unsafe { sigaction(signal, &action) }.map_err(|errno| {
                RELAY_FD.store(-1, Ordering::Release);
                io::Error::from(errno)
            })?;
            Ok((read, write, previous))
        });

        match result {
            Ok((read, write, previous)) => {
                debug!("relaying {} through fd={}", signal, write.as_raw_fd());
                Ok((
                    SignalRelay {
                        signal,
                        previous,
                        write,
                    },
                    RelayReceiver { read },
                ))
            }
            Err(source) => {
                INSTALLED.store(false, Ordering::Release);
                Err(setup("install signal relay", source))
            }
        }
    }

    // Neither end blocks: the reactor polls the read end, and the handler
    // must not stall on a full pipe
    fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Ask the handling task to stop after the deliveries already queued
    pub fn shutdown(&self) -> Result<(), Error> {
        let frame = encode_frame(0, SHUTDOWN_FD);
        let written = Errno::result(unsafe {
            libc::write(
                self.write.as_raw_fd(),
                frame.as_ptr() as *const c_void,
                frame.len(),
            )
        })
        .map_err(|errno| Error::Relay(errno.into()))?;
        if written as usize != frame.len() {
            return Err(Error::Relay(io::ErrorKind::WriteZero.into()));
        }
        Ok(())
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        if let Err(e) = unsafe { sigaction(self.signal, &self.previous) } {
            debug!("cannot restore handler of {}: {}", self.signal, e);
        }
        RELAY_FD.store(-1, Ordering::Release);
        INSTALLED.store(false, Ordering::Release);
    }
}

#[async_trait]
impl DeliverySource for RelayReceiver {
    async fn recv(&mut self) -> Result<Delivery, Error> {
        let mut frame = [0u8; FRAME_LEN];
        let mut filled = 0;
        while filled < FRAME_LEN {
            let mut guard = self.read.readable().await.map_err(Error::Relay)?;
            let read = guard.try_io(|pipe| {
                let mut file = pipe.get_ref();
                file.read(&mut frame[filled..])
            });
            match read {
                Ok(Ok(0)) => return Err(Error::Relay(io::ErrorKind::UnexpectedEof.into())),
                Ok(Ok(n)) => filled += n,
                // Interrupted by the relayed signal itself
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(Error::Relay(e)),
                Err(_would_block) => {}
            }
        }
        Ok(decode_frame(frame))
    }
}

// The relay is process wide; tests that install it take this lock
#[cfg(test)]
pub(crate) static RELAY_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Origin, POLL_HUP};

    #[test]
    fn test_frame_decoding() {
        assert_eq!(
            decode_frame(encode_frame(POLL_HUP, 7)),
            Delivery::Notification(Notification {
                handle: 7,
                origin: Origin::Kernel,
                code: POLL_HUP
            })
        );
        assert_eq!(
            decode_frame(encode_frame(-6, 7)),
            Delivery::Notification(Notification {
                handle: 7,
                origin: Origin::User,
                code: -6
            })
        );
        assert_eq!(decode_frame(encode_frame(0, SHUTDOWN_FD)), Delivery::Shutdown);
    }

    #[test]
    fn test_siginfo_poll_layout() {
        use std::mem::{offset_of, size_of};

        // si_band opens the union, which is aligned like a pointer
        let band = offset_of!(SigPollInfo, si_band);
        assert_eq!(band, if size_of::<c_long>() == 8 { 16 } else { 12 });
        assert_eq!(offset_of!(SigPollInfo, si_fd), band + size_of::<c_long>());
        assert!(size_of::<SigPollInfo>() <= size_of::<libc::siginfo_t>());
    }

    #[test]
    fn test_install_needs_runtime() {
        let _guard = RELAY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        assert!(matches!(
            SignalRelay::install(Signal::SIGIO),
            Err(Error::Setup { .. })
        ));
        // A failed install leaves the relay free
        assert!(!INSTALLED.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_relay_forwards_and_shuts_down() {
        let _guard = RELAY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (relay, mut receiver) = SignalRelay::install(Signal::SIGIO).unwrap();
        assert_eq!(relay.signal(), Signal::SIGIO);

        // A second relay cannot be installed while this one lives
        assert!(matches!(
            SignalRelay::install(Signal::SIGIO),
            Err(Error::Setup { .. })
        ));

        // Signals raised from user space carry a non-positive si_code
        nix::sys::signal::raise(Signal::SIGIO).unwrap();
        match receiver.recv().await.unwrap() {
            Delivery::Notification(notification) => {
                assert_eq!(notification.origin, Origin::User)
            }
            Delivery::Shutdown => panic!("expected a notification"),
        }

        relay.shutdown().unwrap();
        assert_eq!(receiver.recv().await.unwrap(), Delivery::Shutdown);

        drop(relay);
        let (_relay, _receiver) = SignalRelay::install(Signal::SIGIO).unwrap();
    }
}
