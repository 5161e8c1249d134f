use std::io;
use std::sync::Arc;

use libc::pid_t;
use log::{debug, info};
use nix::sys::signal::Signal;
use perf::PerfRing;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::counter::{Counter, CounterConfig, HardwareEvent, IoctlControl};
use crate::relay::{RelayReceiver, SignalRelay};
use crate::sample::{SAMPLE_IP, SAMPLE_READ};
use crate::{
    task_completion_handler, Error, EventRegistry, LayoutError, NotificationController,
    NotificationCounter, ReadFormat, RegistryBuilder, SampleLayout, SampleReport,
};

/// Settings of a monitored group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Leader events between two samples
    pub sample_period: u64,
    /// Data pages of the leader's sample buffer, a power of 2
    pub buffer_pages: u32,
    pub include_kernel: bool,
    pub read_format: ReadFormat,
    /// Signal the kernel raises on overflow
    pub signal: Signal,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            sample_period: 2_400_000_000,
            buffer_pages: 1,
            include_kernel: false,
            read_format: ReadFormat::GROUPED_SCALED,
            signal: Signal::SIGIO,
        }
    }
}

/// A counter group that is set up for overflow notifications but not armed yet
pub struct Monitor {
    counters: Vec<Counter>,
    registry: EventRegistry,
    layout: SampleLayout,
    relay: SignalRelay,
    receiver: RelayReceiver,
}

impl Monitor {
    /// Open `events` as one group on thread `target_tid`; the first event leads and samples.
    ///
    /// Must be called from within a tokio runtime, which later drives the handling task.
    pub fn open(
        events: &[HardwareEvent],
        options: &MonitorOptions,
        target_tid: pid_t,
    ) -> Result<Monitor, Error> {
        let layout = SampleLayout::new(SAMPLE_IP | SAMPLE_READ, options.read_format)?;
        let setup = |op, event: HardwareEvent| move |source| Error::Setup {
            op,
            event: event.to_string(),
            source,
        };

        let mut counters: Vec<Counter> = Vec::with_capacity(events.len());
        for (i, &event) in events.iter().enumerate() {
            let mut config = if i == 0 {
                CounterConfig::sampling(
                    event,
                    layout.sample_type(),
                    options.sample_period,
                    options.read_format,
                )
            } else {
                CounterConfig::counting(event)
            };
            config.exclude_kernel = !options.include_kernel;

            let counter = Counter::open(&config, target_tid, counters.first())
                .map_err(setup("perf_event_open", event))?;
            debug!("opened {} as fd={}", event, counter.raw_fd());
            counters.push(counter);
        }
        let leader = counters.first().ok_or(LayoutError::NoEvents)?;
        let leader_event = leader.event();

        // The group read carries the id the kernel gave each member
        let mut bootstrap = vec![0u8; options.read_format.group_read_len(counters.len())];
        let len = leader
            .read_group_values(&mut bootstrap)
            .map_err(setup("read group ids", leader_event))?;

        let storage = leader
            .map_buffer(options.buffer_pages)
            .map_err(|e| setup("mmap sample buffer", leader_event)(io::Error::other(e)))?;
        let ring = PerfRing::new(storage)
            .map_err(|e| setup("mmap sample buffer", leader_event)(io::Error::other(e)))?;
        debug!(
            "mapped {} byte sample buffer of fd={}",
            ring.capacity(),
            ring.file_descriptor()
        );

        let mut builder = RegistryBuilder::new();
        let mut ring = Some(ring);
        for counter in &counters {
            builder.add(counter.event().name(), counter.raw_fd(), ring.take());
        }
        builder.assign_unique_ids(options.read_format, &bootstrap[..len])?;
        let registry = builder.build()?;
        for event in registry.iter() {
            info!("{} has unique id {}", event.name(), event.unique_id());
        }

        let (relay, receiver) = SignalRelay::install(options.signal)?;
        leader
            .set_signal(options.signal as libc::c_int)
            .map_err(setup("F_SETSIG", leader_event))?;
        leader
            .request_notifications(nix::unistd::getpid().as_raw())
            .map_err(setup("F_SETOWN", leader_event))?;

        Ok(Monitor {
            counters,
            registry,
            layout,
            relay,
            receiver,
        })
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Arm the group for its first overflow and spawn the handling task.
    ///
    /// `report` runs on the handling task once per decoded sample.
    pub fn start<F>(self, report: F) -> Result<RunningMonitor, Error>
    where
        F: FnMut(&SampleReport) + Send + 'static,
    {
        let Monitor {
            counters,
            registry,
            layout,
            relay,
            mut receiver,
        } = self;

        let token = CancellationToken::new();
        let progress = Arc::new(NotificationCounter::with_token(token.clone()));
        let mut controller =
            NotificationController::new(registry, layout, IoctlControl, progress.clone(), report);
        controller.arm()?;

        let relay = Arc::new(relay);
        let installed = relay.clone();
        let task = async move {
            let result = controller.run(&mut receiver).await;
            if result.is_err() {
                // The controller only disables the group on shutdown
                if let Some(leader) = counters.first() {
                    if let Err(e) = leader.disable() {
                        debug!("cannot disable {}: {}", leader.event(), e);
                    }
                }
            }
            // Closing the counters first means no signal can hit the restored handler
            drop(counters);
            drop(installed);
            result
        };
        let handler = tokio::spawn(task_completion_handler(task, token, "overflow handler"));

        Ok(RunningMonitor {
            relay,
            progress,
            handler: Some(handler),
        })
    }
}

/// A group whose notifications are being handled
pub struct RunningMonitor {
    relay: Arc<SignalRelay>,
    progress: Arc<NotificationCounter>,
    handler: Option<JoinHandle<Result<(), Error>>>,
}

impl RunningMonitor {
    pub fn progress(&self) -> &NotificationCounter {
        &self.progress
    }

    /// Wait until `threshold` samples were reported or the handling task stopped
    pub async fn wait_for(&self, threshold: u64) -> Result<u64, Error> {
        self.progress.wait_for(threshold).await
    }

    /// Stop the handling task, which disables the group, and return the
    /// number of reported samples or the error that stopped the task.
    pub async fn stop(mut self) -> Result<u64, Error> {
        if let Some(handler) = self.handler.take() {
            self.request_shutdown();
            handler.await??;
        }
        Ok(self.progress.get())
    }

    fn request_shutdown(&self) {
        if let Err(e) = self.relay.shutdown() {
            // The task already stopped on its own
            debug!("cannot signal handler shutdown: {}", e);
        }
    }
}

impl Drop for RunningMonitor {
    fn drop(&mut self) {
        // The task disables the group and releases the relay on its own
        if self.handler.is_some() {
            self.request_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RELAY_LOCK;
    use std::hint::black_box;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_default_options() {
        let options = MonitorOptions::default();
        assert_eq!(options.sample_period, 2_400_000_000);
        assert_eq!(options.buffer_pages, 1);
        assert_eq!(options.signal, Signal::SIGIO);
        assert!(!options.include_kernel);
    }

    #[test]
    fn test_layout_checked_before_opening() {
        let _guard = RELAY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let options = MonitorOptions {
            read_format: ReadFormat::from_bits(ReadFormat::GROUP).unwrap(),
            ..Default::default()
        };
        assert!(matches!(
            Monitor::open(&[HardwareEvent::CpuCycles], &options, 0),
            Err(Error::Layout(LayoutError::MissingGroupIds(_)))
        ));
        assert!(matches!(
            Monitor::open(&[], &MonitorOptions::default(), 0),
            Err(Error::Layout(LayoutError::NoEvents))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_samples_from_worker_thread() {
        let _guard = RELAY_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let stop = Arc::new(AtomicBool::new(false));
        let (tid_tx, tid_rx) = mpsc::channel();
        let worker = {
            let stop = stop.clone();
            thread::spawn(move || {
                let _ = tid_tx.send(nix::unistd::gettid().as_raw());
                let mut x = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    x = black_box(x.wrapping_mul(6364136223846793005).wrapping_add(1));
                }
            })
        };
        let tid = tid_rx.recv().unwrap();

        let options = MonitorOptions {
            sample_period: 10_000_000,
            ..Default::default()
        };
        let events = [HardwareEvent::CpuCycles, HardwareEvent::Instructions];
        let monitor = match Monitor::open(&events, &options, tid) {
            Ok(monitor) => monitor,
            Err(e) => {
                // Hardware counters are often unavailable in VMs and containers
                println!("Skipping test due to error: {}", e);
                stop.store(true, Ordering::Relaxed);
                worker.join().unwrap();
                return;
            }
        };
        assert_eq!(monitor.registry().len(), 2);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let running = monitor
            .start(move |report: &SampleReport| sink.lock().unwrap().push(report.clone()))
            .unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(30), running.wait_for(3)).await;
        assert!(waited.unwrap().unwrap() >= 3);
        let token = running.progress().token().clone();
        let handled = running.stop().await.unwrap();
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        // The handling task released its waiters when it stopped
        assert!(token.is_cancelled());
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len() as u64, handled);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.notification, i as u64);
            assert_eq!(report.leader, "PERF_COUNT_HW_CPU_CYCLES");
            assert_eq!(report.members.len(), 2);
            assert_eq!(report.members[1].name, "PERF_COUNT_HW_INSTRUCTIONS");
        }
    }
}
