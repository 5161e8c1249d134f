//! Thin bindings for the perf_event file descriptors of a counter group.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, RawFd};
use std::str::FromStr;

use libc::{c_int, pid_t};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use perf::{MmapRingStorage, RingStorageError};
use perf_event_open_sys as sys;

use crate::{CounterControl, ReadFormat};

// Not available in the libc crate
const F_SETSIG: c_int = 10;

/// Generic hardware events every PMU driver maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareEvent {
    CpuCycles,
    Instructions,
    CacheReferences,
    CacheMisses,
    BranchInstructions,
    BranchMisses,
    BusCycles,
    StalledCyclesFrontend,
    StalledCyclesBackend,
    RefCpuCycles,
}

impl HardwareEvent {
    pub const ALL: [HardwareEvent; 10] = [
        HardwareEvent::CpuCycles,
        HardwareEvent::Instructions,
        HardwareEvent::CacheReferences,
        HardwareEvent::CacheMisses,
        HardwareEvent::BranchInstructions,
        HardwareEvent::BranchMisses,
        HardwareEvent::BusCycles,
        HardwareEvent::StalledCyclesFrontend,
        HardwareEvent::StalledCyclesBackend,
        HardwareEvent::RefCpuCycles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HardwareEvent::CpuCycles => "PERF_COUNT_HW_CPU_CYCLES",
            HardwareEvent::Instructions => "PERF_COUNT_HW_INSTRUCTIONS",
            HardwareEvent::CacheReferences => "PERF_COUNT_HW_CACHE_REFERENCES",
            HardwareEvent::CacheMisses => "PERF_COUNT_HW_CACHE_MISSES",
            HardwareEvent::BranchInstructions => "PERF_COUNT_HW_BRANCH_INSTRUCTIONS",
            HardwareEvent::BranchMisses => "PERF_COUNT_HW_BRANCH_MISSES",
            HardwareEvent::BusCycles => "PERF_COUNT_HW_BUS_CYCLES",
            HardwareEvent::StalledCyclesFrontend => "PERF_COUNT_HW_STALLED_CYCLES_FRONTEND",
            HardwareEvent::StalledCyclesBackend => "PERF_COUNT_HW_STALLED_CYCLES_BACKEND",
            HardwareEvent::RefCpuCycles => "PERF_COUNT_HW_REF_CPU_CYCLES",
        }
    }

    /// `perf_event_attr.config` for `PERF_TYPE_HARDWARE`
    pub fn config(self) -> u64 {
        let id = match self {
            HardwareEvent::CpuCycles => sys::bindings::PERF_COUNT_HW_CPU_CYCLES,
            HardwareEvent::Instructions => sys::bindings::PERF_COUNT_HW_INSTRUCTIONS,
            HardwareEvent::CacheReferences => sys::bindings::PERF_COUNT_HW_CACHE_REFERENCES,
            HardwareEvent::CacheMisses => sys::bindings::PERF_COUNT_HW_CACHE_MISSES,
            HardwareEvent::BranchInstructions => sys::bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            HardwareEvent::BranchMisses => sys::bindings::PERF_COUNT_HW_BRANCH_MISSES,
            HardwareEvent::BusCycles => sys::bindings::PERF_COUNT_HW_BUS_CYCLES,
            HardwareEvent::StalledCyclesFrontend => {
                sys::bindings::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND
            }
            HardwareEvent::StalledCyclesBackend => {
                sys::bindings::PERF_COUNT_HW_STALLED_CYCLES_BACKEND
            }
            HardwareEvent::RefCpuCycles => sys::bindings::PERF_COUNT_HW_REF_CPU_CYCLES,
        };
        id as u64
    }
}

impl fmt::Display for HardwareEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name that matches no generic hardware event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown hardware event {0:?}")]
pub struct UnknownHardwareEvent(pub String);

impl FromStr for HardwareEvent {
    type Err = UnknownHardwareEvent;

    /// Accepts the full `PERF_COUNT_HW_*` name or its suffix, in any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        let wanted = wanted.strip_prefix("PERF_COUNT_HW_").unwrap_or(&wanted);
        HardwareEvent::ALL
            .into_iter()
            .find(|event| event.name().strip_prefix("PERF_COUNT_HW_") == Some(wanted))
            .ok_or_else(|| UnknownHardwareEvent(s.to_string()))
    }
}

/// Attributes of one counter, translated into a `perf_event_attr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterConfig {
    pub event: HardwareEvent,
    pub disabled: bool,
    /// Samples per wakeup; 0 for counters that do not sample
    pub wakeup_events: u32,
    pub sample_type: u64,
    pub sample_period: u64,
    pub read_format: ReadFormat,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
}

impl CounterConfig {
    /// Group leader that samples every `period` events and wakes on each sample
    pub fn sampling(event: HardwareEvent, sample_type: u64, period: u64, read_format: ReadFormat) -> Self {
        CounterConfig {
            event,
            disabled: true,
            wakeup_events: 1,
            sample_type,
            sample_period: period,
            read_format,
            exclude_kernel: true,
            exclude_hv: true,
        }
    }

    /// Group member that only counts; its value travels in the leader's samples
    pub fn counting(event: HardwareEvent) -> Self {
        CounterConfig {
            event,
            disabled: false,
            wakeup_events: 0,
            sample_type: 0,
            sample_period: 0,
            read_format: ReadFormat::default(),
            exclude_kernel: true,
            exclude_hv: true,
        }
    }

    fn to_attr(self) -> sys::bindings::perf_event_attr {
        let mut attr = sys::bindings::perf_event_attr::default();
        attr.size = std::mem::size_of::<sys::bindings::perf_event_attr>() as u32;
        attr.type_ = sys::bindings::PERF_TYPE_HARDWARE;
        attr.config = self.event.config();
        attr.sample_type = self.sample_type;
        attr.read_format = self.read_format.bits();
        attr.__bindgen_anon_1.sample_period = self.sample_period;
        attr.__bindgen_anon_2.wakeup_events = self.wakeup_events;
        attr.set_disabled(self.disabled.into());
        attr.set_exclude_kernel(self.exclude_kernel.into());
        attr.set_exclude_hv(self.exclude_hv.into());
        attr
    }
}

/// An open perf_event counter; closed on drop
#[derive(Debug)]
pub struct Counter {
    file: File,
    event: HardwareEvent,
}

impl Counter {
    /// Open a counter on thread `tid`, on any CPU, optionally joining `leader`'s group
    pub fn open(config: &CounterConfig, tid: pid_t, leader: Option<&Counter>) -> io::Result<Self> {
        let mut attr = config.to_attr();
        let group_fd = leader.map_or(-1, |leader| leader.raw_fd());
        let fd = unsafe {
            sys::perf_event_open(
                &mut attr,
                tid,
                -1, // any CPU
                group_fd,
                sys::bindings::PERF_FLAG_FD_CLOEXEC as _,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Counter {
            file: unsafe { File::from_raw_fd(fd) },
            event: config.event,
        })
    }

    pub fn event(&self) -> HardwareEvent {
        self.event
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Deliver overflow signals for this counter to process `owner`
    pub fn request_notifications(&self, owner: pid_t) -> io::Result<()> {
        let fd = self.raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_ASYNC))?;
        // F_SETOWN is not wrapped by nix
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETOWN, owner) })?;
        Ok(())
    }

    /// Use `signal` instead of plain SIGIO; also makes the kernel fill `si_fd`
    pub fn set_signal(&self, signal: c_int) -> io::Result<()> {
        Errno::result(unsafe { libc::fcntl(self.raw_fd(), F_SETSIG, signal) })?;
        Ok(())
    }

    pub fn refresh(&self, count: c_int) -> io::Result<()> {
        refresh_fd(self.raw_fd(), count)
    }

    /// Disable the counter and the rest of its group
    pub fn disable(&self) -> io::Result<()> {
        disable_fd(self.raw_fd())
    }

    /// Raw `read()` of the counter; for a leader with GROUP this is the group read
    pub fn read_group_values(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Map the counter's sample buffer with `pages` data pages
    pub fn map_buffer(&self, pages: u32) -> Result<MmapRingStorage, RingStorageError> {
        MmapRingStorage::new(self.file.as_fd(), pages)
    }
}

fn ioctl_result(ret: c_int) -> io::Result<()> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn refresh_fd(fd: RawFd, count: c_int) -> io::Result<()> {
    ioctl_result(unsafe { sys::ioctls::REFRESH(fd, count) })
}

fn disable_fd(fd: RawFd) -> io::Result<()> {
    ioctl_result(unsafe { sys::ioctls::DISABLE(fd, sys::bindings::PERF_IOC_FLAG_GROUP as _) })
}

/// Issues the control ioctls directly on registry handles.
///
/// The handles must stay open for as long as this is used; the session keeps
/// the owning [`Counter`]s alive until the handling task has stopped.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoctlControl;

impl CounterControl for IoctlControl {
    fn refresh(&mut self, handle: RawFd, count: i32) -> io::Result<()> {
        refresh_fd(handle, count)
    }

    fn disable(&mut self, handle: RawFd) -> io::Result<()> {
        disable_fd(handle)
    }
}
