use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use overflow::counter::HardwareEvent;
use overflow::session::{Monitor, MonitorOptions};
use overflow::SampleReport;

mod report;

/// Samples a busy loop through counter overflow notifications
#[derive(Debug, Parser)]
struct Command {
    /// Events of the group; the first one leads and triggers the notifications
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "PERF_COUNT_HW_CPU_CYCLES,PERF_COUNT_HW_INSTRUCTIONS"
    )]
    events: Vec<HardwareEvent>,

    /// Leader events between two notifications
    #[arg(short, long, default_value = "2400000000")]
    period: u64,

    /// Data pages of the sample buffer (power of 2)
    #[arg(long, default_value = "1")]
    pages: u32,

    /// Stop after this many notifications
    #[arg(short, long, default_value = "20")]
    threshold: u64,

    /// Also count in kernel mode
    #[arg(long)]
    include_kernel: bool,

    /// Verbose debug output
    #[arg(short, long)]
    verbose: bool,
}

impl Command {
    fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            sample_period: self.period,
            buffer_pages: self.pages,
            include_kernel: self.include_kernel,
            ..Default::default()
        }
    }
}

// Burns cycles until told to stop; counters are attached to this thread
fn spawn_workload(stop: Arc<AtomicBool>) -> Result<(thread::JoinHandle<u64>, i32)> {
    let (tid_tx, tid_rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("workload".to_string())
        .spawn(move || {
            let _ = tid_tx.send(nix::unistd::gettid().as_raw());
            let mut iterations = 0u64;
            while !stop.load(Ordering::Relaxed) {
                iterations = black_box(iterations.wrapping_add(1));
            }
            iterations
        })
        .context("Failed to spawn workload thread")?;
    let tid = tid_rx.recv().context("Workload thread exited early")?;
    Ok((handle, tid))
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Command::parse();

    let level = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let stop = Arc::new(AtomicBool::new(false));
    let (workload, tid) = spawn_workload(stop.clone())?;

    let monitor = Monitor::open(&opts.events, &opts.monitor_options(), tid)
        .context("Failed to set up counter group")?;
    print!("{}", report::format_ids(monitor.registry()));

    let running = monitor
        .start(|sample: &SampleReport| {
            print!("{} {}", report::format_time(), report::format_sample(sample));
        })
        .context("Failed to start notification handling")?;

    let waited = running.wait_for(opts.threshold).await;
    let stopped = running.stop().await;
    stop.store(true, Ordering::Relaxed);
    let iterations = workload.join().unwrap_or(0);

    // The handler's own error explains an aborted wait better
    let handled = stopped.context("Notification handling failed")?;
    waited.context("Waiting for notifications failed")?;
    info!(
        "handled {} notifications over {} workload iterations",
        handled, iterations
    );
    Ok(())
}
