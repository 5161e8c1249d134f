use std::mem::size_of;

use perf::{FieldReader, PerfRingError};

use crate::LayoutError;

/// `PERF_SAMPLE_IP`
pub const SAMPLE_IP: u64 = 1 << 0;
/// `PERF_SAMPLE_READ`
pub const SAMPLE_READ: u64 = 1 << 4;

/// The `read_format` of a counter, which fixes the layout of both `read()`
/// results and the READ part of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFormat(u64);

impl ReadFormat {
    pub const TOTAL_TIME_ENABLED: u64 = 1 << 0;
    pub const TOTAL_TIME_RUNNING: u64 = 1 << 1;
    pub const ID: u64 = 1 << 2;
    pub const GROUP: u64 = 1 << 3;
    pub const LOST: u64 = 1 << 4;

    const SUPPORTED: u64 =
        Self::TOTAL_TIME_ENABLED | Self::TOTAL_TIME_RUNNING | Self::ID | Self::GROUP;

    /// Group read with member ids and both timings
    pub const GROUPED_SCALED: ReadFormat = ReadFormat(Self::SUPPORTED);

    pub fn from_bits(bits: u64) -> Result<Self, LayoutError> {
        if bits & !Self::SUPPORTED != 0 {
            return Err(LayoutError::UnsupportedReadFormat(bits));
        }
        Ok(ReadFormat(bits))
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn has_time_enabled(self) -> bool {
        self.0 & Self::TOTAL_TIME_ENABLED != 0
    }

    pub fn has_time_running(self) -> bool {
        self.0 & Self::TOTAL_TIME_RUNNING != 0
    }

    /// Attribution of member values needs both a group read and per-member ids
    pub fn require_grouped_ids(self) -> Result<Self, LayoutError> {
        if self.0 & (Self::GROUP | Self::ID) != (Self::GROUP | Self::ID) {
            return Err(LayoutError::MissingGroupIds(self.0));
        }
        Ok(self)
    }

    /// Size in bytes of a group read with `members` members
    pub fn group_read_len(self, members: usize) -> usize {
        let per_member = if self.0 & Self::ID != 0 { 2 } else { 1 };
        let mut words = members.saturating_mul(per_member).saturating_add(1);
        if self.has_time_enabled() {
            words = words.saturating_add(1);
        }
        if self.has_time_running() {
            words = words.saturating_add(1);
        }
        words.saturating_mul(size_of::<u64>())
    }
}

impl Default for ReadFormat {
    fn default() -> Self {
        Self::GROUPED_SCALED
    }
}

/// One member of a group: its value and the id the kernel assigned to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberValue {
    pub value: u64,
    pub id: u64,
}

/// Result of a `read()` on a group leader opened with [`ReadFormat::GROUP`] and [`ReadFormat::ID`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRead {
    pub time_enabled: Option<u64>,
    pub time_running: Option<u64>,
    pub members: Vec<MemberValue>,
}

impl GroupRead {
    /// Parse the group read layout:
    /// `nr, [time_enabled], [time_running], nr * (value, id)`
    pub fn parse(read_format: ReadFormat, bytes: &[u8]) -> Result<Self, LayoutError> {
        read_format.require_grouped_ids()?;

        let mut words = bytes
            .chunks_exact(size_of::<u64>())
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_ne_bytes(word)
            });
        let truncated = |needed| LayoutError::Truncated {
            len: bytes.len(),
            needed,
        };

        let nr = words.next().ok_or(truncated(size_of::<u64>()))?;
        let needed = read_format.group_read_len(usize::try_from(nr).unwrap_or(usize::MAX));
        if bytes.len() < needed {
            return Err(truncated(needed));
        }

        let mut next = || words.next().ok_or(truncated(needed));
        let time_enabled = read_format.has_time_enabled().then(&mut next).transpose()?;
        let time_running = read_format.has_time_running().then(&mut next).transpose()?;
        let mut members = Vec::with_capacity(nr as usize);
        for _ in 0..nr {
            let value = next()?;
            let id = next()?;
            members.push(MemberValue { value, id });
        }

        Ok(GroupRead {
            time_enabled,
            time_running,
            members,
        })
    }
}

/// Validated sample configuration of a group leader.
///
/// Samples are only decoded for leaders sampling exactly the instruction
/// pointer and a grouped read with ids. Keeping the check here ties the
/// counter configuration to what [`decode`] expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    read_format: ReadFormat,
}

impl SampleLayout {
    pub fn new(sample_type: u64, read_format: ReadFormat) -> Result<Self, LayoutError> {
        if sample_type != SAMPLE_IP | SAMPLE_READ {
            return Err(LayoutError::SampleType(sample_type));
        }
        let read_format = read_format.require_grouped_ids()?;
        Ok(SampleLayout { read_format })
    }

    pub fn sample_type(&self) -> u64 {
        SAMPLE_IP | SAMPLE_READ
    }

    pub fn read_format(&self) -> ReadFormat {
        self.read_format
    }
}

/// A decoded group sample, before scaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSample {
    pub ip: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub members: Vec<MemberValue>,
}

impl GroupSample {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Decode the body of a SAMPLE record.
///
/// Fields are read in the order the kernel writes them. Missing timings
/// default to 1 so that scaling leaves values unchanged.
pub fn decode<R: FieldReader>(
    reader: &mut R,
    layout: &SampleLayout,
) -> Result<GroupSample, PerfRingError> {
    let ip = reader.read_u64()?;
    let nr = reader.read_u64()?;

    let format = layout.read_format();
    let time_enabled = if format.has_time_enabled() {
        reader.read_u64()?
    } else {
        1
    };
    let time_running = if format.has_time_running() {
        reader.read_u64()?
    } else {
        1
    };

    // Refuse a member count the record cannot hold before allocating for it
    let needed = nr.saturating_mul(2 * size_of::<u64>() as u64);
    let available = reader.available();
    if needed > available {
        return Err(PerfRingError::BufferUnderrun {
            requested: needed,
            available,
        });
    }

    let mut members = Vec::with_capacity(nr as usize);
    for _ in 0..nr {
        let value = reader.read_u64()?;
        let id = reader.read_u64()?;
        members.push(MemberValue { value, id });
    }

    Ok(GroupSample {
        ip,
        time_enabled,
        time_running,
        members,
    })
}

/// Encode a group sample body the way the kernel lays it out
pub fn encode(sample: &GroupSample, layout: &SampleLayout) -> Vec<u8> {
    let format = layout.read_format();
    let mut words = vec![sample.ip, sample.members.len() as u64];
    if format.has_time_enabled() {
        words.push(sample.time_enabled);
    }
    if format.has_time_running() {
        words.push(sample.time_running);
    }
    for member in &sample.members {
        words.push(member.value);
        words.push(member.id);
    }
    words.iter().flat_map(|w| w.to_ne_bytes()).collect()
}
