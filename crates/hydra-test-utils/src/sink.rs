//! Output sinks for tests.

use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};

use hydra_core::{BufferSet, CommandFlags, SinkError};
use hydra_engine::{OutputSink, WriteRequest, WriteSchedule};

/// What a [`RecordingSink`] saw in one write.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRecord {
    pub t: f64,
    pub iteration: u64,
    pub flags: CommandFlags,
    pub buffers: BufferSet,
    pub range: Range<usize>,
    /// Identities in the node range, when `Info` is on the host.
    pub ids: Vec<u32>,
}

/// Sink appending a [`WriteRecord`] per write to a shared log.
#[derive(Debug)]
pub struct RecordingSink {
    name: String,
    schedule: WriteSchedule,
    records: Arc<Mutex<Vec<WriteRecord>>>,
}

impl RecordingSink {
    pub fn new(name: impl Into<String>, schedule: WriteSchedule) -> Self {
        Self {
            name: name.into(),
            schedule,
            records: Arc::default(),
        }
    }

    /// Handle on the log, valid after the sink moves into a simulation.
    pub fn records(&self) -> Arc<Mutex<Vec<WriteRecord>>> {
        Arc::clone(&self.records)
    }

    /// Snapshot of a log handle.
    pub fn snapshot(records: &Mutex<Vec<WriteRecord>>) -> Vec<WriteRecord> {
        records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl OutputSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> &WriteSchedule {
        &self.schedule
    }

    fn schedule_mut(&mut self) -> &mut WriteSchedule {
        &mut self.schedule
    }

    fn write(&mut self, request: &WriteRequest<'_>) -> Result<(), SinkError> {
        let ids = request
            .particles
            .info()
            .ok()
            .and_then(|info| info.get(request.range.clone()))
            .map(|info| info.iter().map(|p| p.id.0).collect())
            .unwrap_or_default();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WriteRecord {
                t: request.t,
                iteration: request.iteration,
                flags: request.flags,
                buffers: request.buffers,
                range: request.range.clone(),
                ids,
            });
        Ok(())
    }
}

/// Sink failing every write after the first `succeed` ones.
#[derive(Debug)]
pub struct FailingSink {
    schedule: WriteSchedule,
    succeed: usize,
    writes: usize,
}

impl FailingSink {
    pub fn new(schedule: WriteSchedule, succeed: usize) -> Self {
        Self {
            schedule,
            succeed,
            writes: 0,
        }
    }
}

impl OutputSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn schedule(&self) -> &WriteSchedule {
        &self.schedule
    }

    fn schedule_mut(&mut self) -> &mut WriteSchedule {
        &mut self.schedule
    }

    fn write(&mut self, _request: &WriteRequest<'_>) -> Result<(), SinkError> {
        self.writes += 1;
        if self.writes > self.succeed {
            return Err(SinkError::Write {
                sink: self.name().into(),
                reason: "disk full".into(),
            });
        }
        Ok(())
    }
}
