use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use perf::{FieldReader, PerfRingError, PERF_RECORD_LOST, PERF_RECORD_SAMPLE};

use crate::sample::{decode, GroupSample, SampleLayout};
use crate::{scaling, Error, EventIndex, EventRegistry, NotificationCounter, Origin};

/// `si_code` of a wakeup while refreshes are still left; never expected here
pub const POLL_IN: i32 = 1;
/// `si_code` when the refresh count runs out, the only overflow code accepted
pub const POLL_HUP: i32 = 6;

/// An overflow notification as delivered for one counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub handle: RawFd,
    pub origin: Origin,
    pub code: i32,
}

impl Notification {
    /// Build from the `si_fd` and `si_code` of a signal; positive codes come from the kernel
    pub fn new(handle: RawFd, code: i32) -> Self {
        let origin = if code > 0 { Origin::Kernel } else { Origin::User };
        Notification {
            handle,
            origin,
            code,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        // Each arm allows a single overflow, so the kernel always reports
        // the exhausted refresh count
        if self.origin != Origin::Kernel || self.code != POLL_HUP {
            return Err(Error::ProtocolViolation {
                origin: self.origin,
                code: self.code,
            });
        }
        Ok(())
    }
}

/// What the handling task receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Notification(Notification),
    Shutdown,
}

/// Source of deliveries for the handling task
#[async_trait]
pub trait DeliverySource: Send {
    async fn recv(&mut self) -> Result<Delivery, Error>;
}

/// Control operations on the counters behind registry handles
pub trait CounterControl {
    /// Allow `count` more overflows before the counter disables itself
    fn refresh(&mut self, handle: RawFd, count: i32) -> io::Result<()>;

    fn disable(&mut self, handle: RawFd) -> io::Result<()>;
}

/// One member of a reported sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberReport {
    pub name: String,
    pub unique_id: u64,
    pub raw: u64,
    /// Value extrapolated over the enabled time
    pub value: u64,
}

/// A decoded, scaled sample handed to the report callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReport {
    /// Number of samples reported before this one
    pub notification: u64,
    pub leader: String,
    pub ip: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub scaled: bool,
    pub members: Vec<MemberReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Not armed yet
    Idle,
    Armed,
    Handling,
    Rearmed,
    Disabled,
}

/// What handling one notification amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A sample was reported; carries the updated notification count
    Reported(u64),
    /// A record of another type was consumed without a report
    Skipped { record_type: u32 },
    /// The controller was already disabled
    Dropped,
}

/// Drives the overflow protocol for one group.
///
/// Every notification that passes validation and resolves to an event is
/// rearmed for exactly one more overflow, whether its record could be
/// decoded or not. Any error is fatal for the run.
pub struct NotificationController<C, F> {
    registry: EventRegistry,
    layout: SampleLayout,
    control: C,
    counter: Arc<NotificationCounter>,
    report: F,
    state: ControllerState,
}

impl<C, F> NotificationController<C, F>
where
    C: CounterControl,
    F: FnMut(&SampleReport),
{
    pub fn new(
        registry: EventRegistry,
        layout: SampleLayout,
        control: C,
        counter: Arc<NotificationCounter>,
        report: F,
    ) -> Self {
        NotificationController {
            registry,
            layout,
            control,
            counter,
            report,
            state: ControllerState::Idle,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Enable every group leader for one overflow
    pub fn arm(&mut self) -> Result<(), Error> {
        for event in self.registry.leaders() {
            self.control
                .refresh(event.handle(), 1)
                .map_err(|source| Error::Rearm {
                    event: event.name().to_string(),
                    source,
                })?;
            debug!("armed {} (fd={})", event.name(), event.handle());
        }
        self.state = ControllerState::Armed;
        Ok(())
    }

    /// Stop every group leader; later notifications are dropped
    pub fn disable(&mut self) -> Result<(), Error> {
        self.state = ControllerState::Disabled;
        for event in self.registry.leaders() {
            self.control
                .disable(event.handle())
                .map_err(|source| Error::Setup {
                    op: "disable",
                    event: event.name().to_string(),
                    source,
                })?;
        }
        debug!("notifications disabled");
        Ok(())
    }

    /// Handle one overflow notification
    pub fn handle(&mut self, notification: Notification) -> Result<Outcome, Error> {
        if self.state == ControllerState::Disabled {
            debug!(
                "dropping notification for fd={} after disable",
                notification.handle
            );
            return Ok(Outcome::Dropped);
        }

        notification.validate()?;
        let index = self.registry.by_handle(notification.handle)?;

        self.state = ControllerState::Handling;
        let outcome = self.consume(index);

        let event = self.registry.get(index);
        let rearm = self
            .control
            .refresh(event.handle(), 1)
            .map_err(|source| Error::Rearm {
                event: event.name().to_string(),
                source,
            });

        let outcome = outcome?;
        rearm?;
        self.state = ControllerState::Rearmed;
        Ok(outcome)
    }

    /// Handle deliveries until shutdown, then disable the group
    pub async fn run<S: DeliverySource>(&mut self, source: &mut S) -> Result<(), Error> {
        loop {
            match source.recv().await? {
                Delivery::Notification(notification) => {
                    self.handle(notification)?;
                }
                Delivery::Shutdown => {
                    debug!("shutdown requested");
                    return self.disable();
                }
            }
        }
    }

    fn consume(&mut self, index: EventIndex) -> Result<Outcome, Error> {
        let event = self.registry.get_mut(index);
        let name = event.name().to_string();
        let underrun = |source| match source {
            PerfRingError::MalformedHeader { .. } => Error::CorruptRecord {
                event: name.clone(),
                source,
            },
            source => Error::BufferUnderrun {
                event: name.clone(),
                source,
            },
        };
        let ring = event
            .ring_mut()
            .ok_or_else(|| Error::NoBuffer { event: name.clone() })?;

        ring.start_read_batch();
        let decoded = {
            let mut record = ring.next_record().map_err(underrun)?;
            let header = record.header();
            let sample = match header.type_ {
                PERF_RECORD_SAMPLE => Some(decode(&mut record, &self.layout)),
                PERF_RECORD_LOST => {
                    let lost = record.read_u64().and_then(|_id| record.read_u64());
                    match lost {
                        Ok(lost) => warn!("{} lost {} records, skipping", name, lost),
                        Err(_) => warn!("{} reported lost records, skipping", name),
                    }
                    None
                }
                other => {
                    warn!(
                        "unexpected record type={} on {}, skipping {} bytes",
                        other, name, header.size
                    );
                    None
                }
            };
            // Dropping the record moves the cursor past it
            sample
                .map(|result| result.map_err(underrun))
                .ok_or(header.type_)
        };
        ring.finish_read_batch();

        match decoded {
            Ok(sample) => self.report(index, sample?),
            Err(record_type) => Ok(Outcome::Skipped { record_type }),
        }
    }

    fn report(&mut self, index: EventIndex, sample: GroupSample) -> Result<Outcome, Error> {
        let scaled = scaling::is_scaled(sample.time_enabled, sample.time_running);
        let members = sample
            .members
            .iter()
            .map(|member| {
                let event = self.registry.get(self.registry.by_unique_id(member.id)?);
                Ok(MemberReport {
                    name: event.name().to_string(),
                    unique_id: member.id,
                    raw: member.value,
                    value: scaling::correct(
                        member.value,
                        sample.time_enabled,
                        sample.time_running,
                    ),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let report = SampleReport {
            notification: self.counter.get(),
            leader: self.registry.get(index).name().to_string(),
            ip: sample.ip,
            time_enabled: sample.time_enabled,
            time_running: sample.time_running,
            scaled,
            members,
        };
        (self.report)(&report);
        Ok(Outcome::Reported(self.counter.increment()))
    }
}
