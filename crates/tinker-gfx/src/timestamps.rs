//! GPU timestamp queries.
//!
//! Each frame in flight owns a range of [`GPU_TIMESTAMP_NUM_MAX`] queries.
//! Results of a range are read back when the same virtual frame comes round
//! again, i.e. after its fence has been waited on.

use crate::backend::{CommandBufferId, DeviceCommand, GraphicsBackend, QueryPoolId};
use crate::error::{fatal, Result};
use tinker_core::limits::{GPU_TIMESTAMP_NUM_MAX, MAX_FRAMES_IN_FLIGHT};

/// Time between a timestamp and the one before it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimestampInterval {
    /// Name of the later timestamp.
    pub name: &'static str,
    pub micros: f64,
}

pub struct GpuTimestamps {
    pool: QueryPoolId,
    period_ns: f32,
    names: [Vec<&'static str>; MAX_FRAMES_IN_FLIGHT],
    intervals: Vec<TimestampInterval>,
    total_micros: f64,
}

impl GpuTimestamps {
    pub fn new(backend: &mut dyn GraphicsBackend) -> Result<Self> {
        let pool = backend
            .create_timestamp_query_pool(GPU_TIMESTAMP_NUM_MAX * MAX_FRAMES_IN_FLIGHT as u32)?;
        Ok(Self {
            pool,
            period_ns: backend.properties().timestamp_period,
            names: Default::default(),
            intervals: Vec::new(),
            total_micros: 0.0,
        })
    }

    #[inline]
    pub const fn query_index(frame: usize, id: u32) -> u32 {
        frame as u32 * GPU_TIMESTAMP_NUM_MAX + id
    }

    /// Timestamps written so far for `frame`.
    pub fn count(&self, frame: usize) -> u32 {
        self.names[frame].len() as u32
    }

    /// Read back `frame`'s results from its previous use and convert them.
    pub fn resolve(&mut self, backend: &mut dyn GraphicsBackend, frame: usize) -> Result<()> {
        let names = &self.names[frame];
        if names.is_empty() {
            return Ok(());
        }
        let mut ticks = vec![0u64; names.len()];
        backend.timestamp_results(self.pool, Self::query_index(frame, 0), &mut ticks)?;
        let (intervals, total) = convert(&ticks, names, self.period_ns);
        self.intervals = intervals;
        self.total_micros = total;
        Ok(())
    }

    /// Reset `frame`'s query range and forget its names.
    pub fn reset(&mut self, backend: &mut dyn GraphicsBackend, cmd: CommandBufferId, frame: usize) {
        backend.record(
            cmd,
            &DeviceCommand::ResetQueryPool {
                pool: self.pool,
                first: Self::query_index(frame, 0),
                count: GPU_TIMESTAMP_NUM_MAX,
            },
        );
        self.names[frame].clear();
    }

    /// Record the next timestamp of `frame`.
    pub fn write(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        cmd: CommandBufferId,
        frame: usize,
        name: &'static str,
    ) {
        let id = self.count(frame);
        if id >= GPU_TIMESTAMP_NUM_MAX {
            fatal(format!(
                "more than {GPU_TIMESTAMP_NUM_MAX} timestamps in frame {frame}"
            ));
        }
        backend.record(
            cmd,
            &DeviceCommand::WriteTimestamp {
                pool: self.pool,
                query: Self::query_index(frame, id),
            },
        );
        self.names[frame].push(name);
    }

    /// Intervals of the last resolved frame, begin marker excluded.
    pub fn timestamp_data(&self) -> &[TimestampInterval] {
        &self.intervals
    }

    /// First to last timestamp of the last resolved frame.
    pub fn total_frame_time_micros(&self) -> f64 {
        self.total_micros
    }

    pub fn period_ns(&self) -> f32 {
        self.period_ns
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_query_pool(self.pool);
    }
}

fn convert(ticks: &[u64], names: &[&'static str], period_ns: f32) -> (Vec<TimestampInterval>, f64) {
    let to_micros = |delta: u64| delta as f64 * f64::from(period_ns) * 1e-3;
    let intervals = ticks
        .windows(2)
        .zip(names.iter().skip(1))
        .map(|(pair, name)| TimestampInterval {
            name: *name,
            micros: to_micros(pair[1].saturating_sub(pair[0])),
        })
        .collect();
    let total = match (ticks.first(), ticks.last()) {
        (Some(first), Some(last)) => to_micros(last.saturating_sub(*first)),
        _ => 0.0,
    };
    (intervals, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use crate::backend::SubmitInfo;
    use approx::assert_relative_eq;

    #[test]
    fn ticks_convert_to_microseconds() {
        let (intervals, total) = convert(&[1_000, 3_000, 7_000], &["Begin", "Shadow", "Lit"], 2.0);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].name, "Shadow");
        assert_relative_eq!(intervals[0].micros, 4.0);
        assert_eq!(intervals[1].name, "Lit");
        assert_relative_eq!(intervals[1].micros, 8.0);
        assert_relative_eq!(total, 12.0);
    }

    #[test]
    fn query_ranges_do_not_overlap() {
        assert_eq!(GpuTimestamps::query_index(0, 5), 5);
        assert_eq!(GpuTimestamps::query_index(1, 0), GPU_TIMESTAMP_NUM_MAX);
    }

    #[test]
    fn written_timestamps_resolve_after_submit() {
        let mut backend = NullBackend::new();
        let mut timestamps = GpuTimestamps::new(&mut backend).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        timestamps.reset(&mut backend, cmd, 1);
        timestamps.write(&mut backend, cmd, 1, "Begin");
        backend.record(cmd, &DeviceCommand::Dispatch { x: 1, y: 1, z: 1 });
        timestamps.write(&mut backend, cmd, 1, "Cull");
        backend.end_command_buffer(cmd).unwrap();
        backend
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: None,
            })
            .unwrap();

        assert_eq!(timestamps.count(1), 2);
        timestamps.resolve(&mut backend, 1).unwrap();
        let data = timestamps.timestamp_data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].name, "Cull");
        assert_relative_eq!(data[0].micros, 2.0);
        assert_relative_eq!(timestamps.total_frame_time_micros(), 2.0);
    }
}
