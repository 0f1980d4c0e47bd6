//! Output sinks and their write schedule.

use std::ops::Range;

use hydra_arena::BufferList;
use hydra_core::{BufferSet, CommandFlags, SinkError};
use tracing::debug;

// ── WriteSchedule ───────────────────────────────────────────────────

/// When a sink is due, in simulation time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriteSchedule {
    frequency: Option<f64>,
    last_written: Option<f64>,
}

impl WriteSchedule {
    // Tolerance against accumulated timestep rounding.
    const SLACK: f64 = 1.0e-6;

    /// Due every `frequency` units of simulation time. Zero means every
    /// iteration.
    pub fn every(frequency: f64) -> Self {
        Self {
            frequency: Some(frequency.max(0.0)),
            last_written: None,
        }
    }

    /// Never due. The sink still writes when a write is forced.
    pub fn disabled() -> Self {
        Self {
            frequency: None,
            last_written: None,
        }
    }

    /// Configured frequency, `None` when disabled.
    pub fn frequency(&self) -> Option<f64> {
        self.frequency
    }

    /// Time of the last write.
    pub fn last_written(&self) -> Option<f64> {
        self.last_written
    }

    /// Whether a write is due at `t`.
    pub fn is_due(&self, t: f64) -> bool {
        let Some(freq) = self.frequency else {
            return false;
        };
        match self.last_written {
            None => true,
            Some(_) if freq == 0.0 => true,
            Some(last) => t - last >= freq * (1.0 - Self::SLACK),
        }
    }

    /// Records a write at `t`.
    pub fn mark_written(&mut self, t: f64) {
        self.last_written = Some(t);
    }
}

// ── OutputSink ──────────────────────────────────────────────────────

/// Particle data handed to a sink.
#[derive(Debug)]
pub struct WriteRequest<'a> {
    /// Simulation time.
    pub t: f64,
    /// Completed iterations.
    pub iteration: u64,
    /// [`CommandFlags::ALL_INTEGRATION_STEPS`] when both integration
    /// stages completed, [`CommandFlags::INITIALIZATION_STEP`] for the
    /// initial write.
    pub flags: CommandFlags,
    /// Columns materialized on the host for this write.
    pub buffers: BufferSet,
    /// Host arrays.
    pub particles: &'a BufferList,
    /// This node's index range in `particles`.
    pub range: Range<usize>,
}

/// A result writer.
pub trait OutputSink: Send {
    /// Name for logs and errors.
    fn name(&self) -> &str;

    /// The sink's schedule.
    fn schedule(&self) -> &WriteSchedule;

    /// Mutable access to the schedule.
    fn schedule_mut(&mut self) -> &mut WriteSchedule;

    /// Writes one frame.
    fn write(&mut self, request: &WriteRequest<'_>) -> Result<(), SinkError>;

    /// Whether the sink is due at `t`.
    fn need_write(&self, t: f64) -> bool {
        self.schedule().is_due(t)
    }

    /// Records a write at `t`, real or pretended.
    fn mark_written(&mut self, t: f64) {
        self.schedule_mut().mark_written(t);
    }
}

// ── SinkSet ─────────────────────────────────────────────────────────

/// Indices into a [`SinkSet`] of the sinks due at some time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DueSinks(Vec<usize>);

impl DueSinks {
    /// Whether no sink is due.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of due sinks.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Every registered sink.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn OutputSink>>,
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sinks.iter().map(|s| s.name()))
            .finish()
    }
}

impl SinkSet {
    /// Registers a sink.
    pub fn push(&mut self, sink: Box<dyn OutputSink>) {
        self.sinks.push(sink);
    }

    /// Registered sink count.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Sinks due at `t`.
    pub fn due(&self, t: f64) -> DueSinks {
        DueSinks(
            self.sinks
                .iter()
                .enumerate()
                .filter(|(_, s)| s.need_write(t))
                .map(|(i, _)| i)
                .collect(),
        )
    }

    /// Every sink, for forced writes.
    pub fn all(&self) -> DueSinks {
        DueSinks((0..self.sinks.len()).collect())
    }

    /// Largest frequency among `due`. Disabled sinks count as zero.
    pub fn max_frequency(&self, due: &DueSinks) -> f64 {
        due.0
            .iter()
            .filter_map(|&i| self.sinks.get(i)?.schedule().frequency())
            .fold(0.0, f64::max)
    }

    /// Marks `due` written at `t` without writing anything.
    pub fn fake_mark_written(&mut self, due: &DueSinks, t: f64) {
        debug!(sinks = due.len(), t, "skipping due writes");
        self.mark_written(due, t);
    }

    /// Marks `due` written at `t`.
    pub fn mark_written(&mut self, due: &DueSinks, t: f64) {
        for &i in &due.0 {
            if let Some(sink) = self.sinks.get_mut(i) {
                sink.mark_written(t);
            }
        }
    }

    /// Writes `request` to every sink in `due`, stopping at the first failure.
    pub fn write(&mut self, due: &DueSinks, request: &WriteRequest<'_>) -> Result<(), SinkError> {
        for &i in &due.0 {
            if let Some(sink) = self.sinks.get_mut(i) {
                sink.write(request)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        schedule: WriteSchedule,
        writes: Vec<f64>,
    }

    impl OutputSink for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn schedule(&self) -> &WriteSchedule {
            &self.schedule
        }
        fn schedule_mut(&mut self) -> &mut WriteSchedule {
            &mut self.schedule
        }
        fn write(&mut self, request: &WriteRequest<'_>) -> Result<(), SinkError> {
            self.writes.push(request.t);
            Ok(())
        }
    }

    #[test]
    fn schedule_due_by_frequency() {
        let mut s = WriteSchedule::every(0.1);
        assert!(s.is_due(0.0));
        s.mark_written(0.0);
        assert!(!s.is_due(0.05));
        assert!(s.is_due(0.1));
        // Rounding slack.
        assert!(s.is_due(0.1 - 1e-9));
    }

    #[test]
    fn zero_frequency_is_every_iteration() {
        let mut s = WriteSchedule::every(0.0);
        s.mark_written(1.0);
        assert!(s.is_due(1.0));
    }

    #[test]
    fn disabled_schedule_is_never_due() {
        let s = WriteSchedule::disabled();
        assert!(!s.is_due(0.0));
        assert_eq!(s.frequency(), None);
    }

    #[test]
    fn set_selects_and_marks_due_sinks() {
        let mut set = SinkSet::default();
        for freq in [0.5, 2.0] {
            set.push(Box::new(Counter {
                schedule: WriteSchedule::every(freq),
                writes: Vec::new(),
            }));
        }
        set.push(Box::new(Counter {
            schedule: WriteSchedule::disabled(),
            writes: Vec::new(),
        }));

        let due = set.due(0.0);
        assert_eq!(due.len(), 2);
        assert_eq!(set.max_frequency(&due), 2.0);
        set.fake_mark_written(&due, 0.0);

        let due = set.due(0.6);
        assert_eq!(due, DueSinks(vec![0]));

        let particles = BufferList::new(0);
        let request = WriteRequest {
            t: 0.6,
            iteration: 6,
            flags: CommandFlags::ALL_INTEGRATION_STEPS,
            buffers: BufferSet::empty(),
            particles: &particles,
            range: 0..0,
        };
        let all = set.all();
        set.write(&all, &request).unwrap();
        set.mark_written(&due, 0.6);
        assert!(set.due(0.7).is_empty());
    }
}
