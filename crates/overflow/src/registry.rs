use std::collections::HashMap;
use std::os::unix::io::RawFd;

use perf::PerfRing;

use crate::{Error, GroupRead, LayoutError, Lookup, ReadFormat};

/// Stable address of an event inside an [`EventRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventIndex(usize);

impl EventIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// One counter of a monitored group
pub struct MonitoredEvent {
    name: String,
    handle: RawFd,
    unique_id: u64,
    // Only group leaders own a sample buffer
    ring: Option<PerfRing>,
}

impl MonitoredEvent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> RawFd {
        self.handle
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn has_ring(&self) -> bool {
        self.ring.is_some()
    }

    pub fn ring_mut(&mut self) -> Option<&mut PerfRing> {
        self.ring.as_mut()
    }
}

struct PendingEvent {
    name: String,
    handle: RawFd,
    unique_id: Option<u64>,
    ring: Option<PerfRing>,
}

/// Collects the events of a group until their unique ids are known
#[derive(Default)]
pub struct RegistryBuilder {
    events: Vec<PendingEvent>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event; members are expected in the order they joined the group
    pub fn add(&mut self, name: impl Into<String>, handle: RawFd, ring: Option<PerfRing>) -> EventIndex {
        self.events.push(PendingEvent {
            name: name.into(),
            handle,
            unique_id: None,
            ring,
        });
        EventIndex(self.events.len() - 1)
    }

    /// Assign unique ids from a bootstrap group read of the leader.
    ///
    /// The kernel lists members in the order they joined the group, so the
    /// nth (value, id) pair belongs to the nth registered event.
    pub fn assign_unique_ids(
        &mut self,
        read_format: ReadFormat,
        bytes: &[u8],
    ) -> Result<&mut Self, LayoutError> {
        let read = GroupRead::parse(read_format, bytes)?;
        if read.members.len() != self.events.len() {
            return Err(LayoutError::MemberCount {
                reported: read.members.len() as u64,
                expected: self.events.len(),
            });
        }
        for (event, member) in self.events.iter_mut().zip(&read.members) {
            event.unique_id = Some(member.id);
        }
        Ok(self)
    }

    /// Freeze the registry; every event needs an id and keys must be unique
    pub fn build(self) -> Result<EventRegistry, Error> {
        let mut registry = EventRegistry {
            events: Vec::with_capacity(self.events.len()),
            by_handle: HashMap::new(),
            by_id: HashMap::new(),
        };

        for pending in self.events {
            let unique_id = pending
                .unique_id
                .ok_or_else(|| LayoutError::MissingUniqueId(pending.name.clone()))?;
            let index = EventIndex(registry.events.len());

            if registry.by_handle.insert(pending.handle, index).is_some() {
                return Err(LayoutError::Duplicate(Lookup::Handle(pending.handle)).into());
            }
            if registry.by_id.insert(unique_id, index).is_some() {
                return Err(LayoutError::Duplicate(Lookup::UniqueId(unique_id)).into());
            }

            registry.events.push(MonitoredEvent {
                name: pending.name,
                handle: pending.handle,
                unique_id,
                ring: pending.ring,
            });
        }
        Ok(registry)
    }
}

/// Lookup from kernel handles and sample ids back to monitored events
pub struct EventRegistry {
    events: Vec<MonitoredEvent>,
    by_handle: HashMap<RawFd, EventIndex>,
    by_id: HashMap<u64, EventIndex>,
}

impl EventRegistry {
    pub fn by_handle(&self, handle: RawFd) -> Result<EventIndex, Error> {
        self.by_handle
            .get(&handle)
            .copied()
            .ok_or(Error::UnknownEvent(Lookup::Handle(handle)))
    }

    pub fn by_unique_id(&self, id: u64) -> Result<EventIndex, Error> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or(Error::UnknownEvent(Lookup::UniqueId(id)))
    }

    pub fn get(&self, index: EventIndex) -> &MonitoredEvent {
        &self.events[index.0]
    }

    pub fn get_mut(&mut self, index: EventIndex) -> &mut MonitoredEvent {
        &mut self.events[index.0]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitoredEvent> {
        self.events.iter()
    }

    /// Events that own a sample buffer
    pub fn leaders(&self) -> impl Iterator<Item = &MonitoredEvent> {
        self.events.iter().filter(|event| event.has_ring())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perf::MemoryRingStorage;

    fn group_read(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    fn two_event_registry() -> EventRegistry {
        let ring = PerfRing::new(MemoryRingStorage::with_data_size(64)).unwrap();
        let mut builder = RegistryBuilder::new();
        builder.add("PERF_COUNT_HW_CPU_CYCLES", 10, Some(ring));
        builder.add("PERF_COUNT_HW_INSTRUCTIONS", 11, None);
        builder
            .assign_unique_ids(
                ReadFormat::GROUPED_SCALED,
                &group_read(&[2, 1000, 1000, 0, 71, 0, 72]),
            )
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_lookup_both_ways() {
        let registry = two_event_registry();
        assert_eq!(registry.len(), 2);

        let by_fd = registry.by_handle(11).unwrap();
        let by_id = registry.by_unique_id(72).unwrap();
        assert_eq!(by_fd, by_id);
        assert_eq!(registry.get(by_fd).name(), "PERF_COUNT_HW_INSTRUCTIONS");
        assert_eq!(registry.get(by_fd).handle(), 11);
        assert_eq!(registry.get(by_fd).unique_id(), 72);

        let leader = registry.by_handle(10).unwrap();
        assert_eq!(registry.get(leader).unique_id(), 71);
        assert_eq!(registry.leaders().count(), 1);
    }

    #[test]
    fn test_unknown_keys() {
        let registry = two_event_registry();
        assert!(matches!(
            registry.by_handle(12),
            Err(Error::UnknownEvent(Lookup::Handle(12)))
        ));
        assert!(matches!(
            registry.by_unique_id(70),
            Err(Error::UnknownEvent(Lookup::UniqueId(70)))
        ));
    }

    #[test]
    fn test_member_count_must_match() {
        let mut builder = RegistryBuilder::new();
        builder.add("PERF_COUNT_HW_CPU_CYCLES", 10, None);
        assert_eq!(
            builder
                .assign_unique_ids(ReadFormat::GROUPED_SCALED, &group_read(&[2, 1, 1, 0, 71, 0, 72]))
                .err(),
            Some(LayoutError::MemberCount {
                reported: 2,
                expected: 1
            })
        );
    }

    #[test]
    fn test_ids_required() {
        let mut builder = RegistryBuilder::new();
        builder.add("PERF_COUNT_HW_CPU_CYCLES", 10, None);
        assert!(matches!(
            builder.build(),
            Err(Error::Layout(LayoutError::MissingUniqueId(_)))
        ));
    }

    #[test]
    fn test_read_format_without_ids_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.add("PERF_COUNT_HW_CPU_CYCLES", 10, None);
        let format = ReadFormat::from_bits(ReadFormat::GROUP).unwrap();
        assert_eq!(
            builder.assign_unique_ids(format, &group_read(&[1, 0])).err(),
            Some(LayoutError::MissingGroupIds(ReadFormat::GROUP))
        );
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.add("a", 10, None);
        builder.add("b", 10, None);
        builder
            .assign_unique_ids(ReadFormat::GROUPED_SCALED, &group_read(&[2, 1, 1, 0, 71, 0, 72]))
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(Error::Layout(LayoutError::Duplicate(Lookup::Handle(10))))
        ));

        let mut builder = RegistryBuilder::new();
        builder.add("a", 10, None);
        builder.add("b", 11, None);
        builder
            .assign_unique_ids(ReadFormat::GROUPED_SCALED, &group_read(&[2, 1, 1, 0, 71, 0, 71]))
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(Error::Layout(LayoutError::Duplicate(Lookup::UniqueId(71))))
        ));
    }
}
