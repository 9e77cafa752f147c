use chrono::{DateTime, SecondsFormat, Utc};
use std::{
    collections::VecDeque,
    time::{Instant, SystemTime, UNIX_EPOCH},
};
use tracing::info;

use crate::{
    error::{PowerMeterError, Result},
    types::{PowerSample, RecordingStatus, WindowPoint},
};

/// Number of recent samples kept for live display
pub const TELEMETRY_WINDOW_SIZE: usize = 60;

/// CSV header line of an exported recording
pub const CSV_HEADER: &str = "timestamp_ms,power_watts,cadence_rpm";

/// Rolling window of the most recent power samples, oldest first
#[derive(Debug, Clone, Default)]
pub struct TelemetryWindow {
    samples: VecDeque<PowerSample>,
}

impl TelemetryWindow {
    /// Append a sample, evicting the oldest past [`TELEMETRY_WINDOW_SIZE`]
    pub fn push(&mut self, sample: PowerSample) {
        if self.samples.len() == TELEMETRY_WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Number of samples held
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the window holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &PowerSample> {
        self.samples.iter()
    }

    /// Chart points stamped with wall-clock time
    #[must_use]
    pub fn points(&self) -> Vec<WindowPoint> {
        let now = Instant::now();
        let wall_now = SystemTime::now();
        self.samples
            .iter()
            .map(|sample| {
                let wall = wall_now
                    .checked_sub(now.saturating_duration_since(sample.timestamp))
                    .unwrap_or(UNIX_EPOCH);
                let time_ms = wall
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
                WindowPoint {
                    time_ms,
                    power: sample.power,
                }
            })
            .collect()
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// One recorded row, offset from the recording start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedSample {
    /// Milliseconds since the recording started
    pub offset_ms: u64,
    /// Instantaneous power in watts
    pub power: u16,
    /// Cadence in revolutions per minute
    pub cadence: u16,
}

/// A recording session; appended to while active, frozen once stopped
#[derive(Debug, Clone)]
pub struct Recording {
    started_at: Instant,
    started_wall: SystemTime,
    samples: Vec<RecordedSample>,
}

impl Recording {
    fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            started_wall: SystemTime::now(),
            samples: Vec::new(),
        }
    }

    fn append(&mut self, sample: &PowerSample) {
        let offset = sample.timestamp.saturating_duration_since(self.started_at);
        self.samples.push(RecordedSample {
            offset_ms: u64::try_from(offset.as_millis()).unwrap_or(u64::MAX),
            power: sample.power,
            cadence: sample.cadence,
        });
    }

    /// Monotonic start instant
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wall-clock start time
    #[must_use]
    pub const fn started_wall(&self) -> SystemTime {
        self.started_wall
    }

    /// Recorded rows in arrival order
    #[must_use]
    pub fn samples(&self) -> &[RecordedSample] {
        &self.samples
    }

    /// Serialize as CSV
    #[must_use]
    pub fn to_csv(&self) -> Vec<u8> {
        export_csv(self)
    }

    /// Suggested file name for the CSV export
    #[must_use]
    pub fn filename(&self) -> String {
        recording_filename(self.started_wall)
    }
}

/// Live window plus the active or last stopped recording
#[derive(Debug, Default)]
pub struct TelemetryStore {
    window: TelemetryWindow,
    active: Option<Recording>,
    last: Option<Recording>,
}

impl TelemetryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one power sample to the window and the active recording
    pub fn on_power_sample(&mut self, sample: PowerSample) {
        self.window.push(sample);
        if let Some(recording) = self.active.as_mut() {
            recording.append(&sample);
        }
    }

    /// Start a recording at the current instant
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::AlreadyRecording`] if one is running.
    pub fn start_recording(&mut self) -> Result<()> {
        self.start_recording_at(Instant::now())
    }

    /// Start a recording whose offsets are measured from `started_at`
    ///
    /// Discards the previously stopped recording.
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::AlreadyRecording`] if one is running.
    pub fn start_recording_at(&mut self, started_at: Instant) -> Result<()> {
        if self.active.is_some() {
            return Err(PowerMeterError::AlreadyRecording);
        }
        self.last = None;
        self.active = Some(Recording::new(started_at));
        info!("Recording started");
        Ok(())
    }

    /// Stop the running recording and return it
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::NotRecording`] if none is running.
    pub fn stop_recording(&mut self) -> Result<Recording> {
        let recording = self.active.take().ok_or(PowerMeterError::NotRecording)?;
        info!(samples = recording.samples.len(), "Recording stopped");
        self.last = Some(recording.clone());
        Ok(recording)
    }

    /// Check if a recording is running
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Most recently stopped recording, if not yet discarded
    #[must_use]
    pub const fn last_recording(&self) -> Option<&Recording> {
        self.last.as_ref()
    }

    /// Live window
    #[must_use]
    pub const fn window(&self) -> &TelemetryWindow {
        &self.window
    }

    /// Recording progress
    #[must_use]
    pub fn recording_status(&self) -> RecordingStatus {
        self.active.as_ref().map_or(
            RecordingStatus {
                active: false,
                samples: self.last.as_ref().map_or(0, |r| r.samples.len()),
                elapsed_ms: 0,
            },
            |recording| RecordingStatus {
                active: true,
                samples: recording.samples.len(),
                elapsed_ms: u64::try_from(recording.started_at.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            },
        )
    }

    /// Return to the initial empty state, discarding any recording
    pub fn reset(&mut self) {
        self.window.clear();
        self.active = None;
        self.last = None;
    }
}

/// Serialize a recording as CSV
///
/// Header line followed by one `offset,power,cadence` row per sample,
/// joined with `\n` and without a trailing newline.
#[must_use]
pub fn export_csv(recording: &Recording) -> Vec<u8> {
    let mut lines = Vec::with_capacity(recording.samples.len() + 1);
    lines.push(CSV_HEADER.to_string());
    lines.extend(
        recording
            .samples
            .iter()
            .map(|row| format!("{},{},{}", row.offset_ms, row.power, row.cadence)),
    );
    lines.join("\n").into_bytes()
}

/// File name for a CSV export created at `at`
#[must_use]
pub fn recording_filename(at: SystemTime) -> String {
    let at: DateTime<Utc> = at.into();
    format!(
        "power_data_{}.csv",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Format a duration in milliseconds as `HH:MM:SS`
#[must_use]
pub fn format_duration(ms: u64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    format!("{:02}:{:02}:{:02}", hours, minutes % 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PowerReading;
    use std::time::Duration;
    use tokio_test::assert_err;

    fn sample(at: Instant, power: u16, cadence: u16) -> PowerSample {
        PowerSample::at(at, PowerReading { power, cadence })
    }

    #[test]
    fn test_window_keeps_most_recent_sixty() {
        let mut store = TelemetryStore::new();
        let t0 = Instant::now();
        for i in 0..150u16 {
            store.on_power_sample(sample(t0 + Duration::from_millis(u64::from(i)), i, 80));
            assert!(store.window().len() <= TELEMETRY_WINDOW_SIZE);
        }

        let powers: Vec<u16> = store.window().iter().map(|s| s.power).collect();
        assert_eq!(powers, (90..150).collect::<Vec<u16>>());
    }

    #[test]
    fn test_recording_round_trip_csv() {
        let mut store = TelemetryStore::new();
        let t0 = Instant::now();

        store.start_recording_at(t0).unwrap();
        store.on_power_sample(sample(t0, 100, 90));
        store.on_power_sample(sample(t0 + Duration::from_millis(1000), 110, 92));
        let recording = store.stop_recording().unwrap();

        assert_eq!(
            String::from_utf8(export_csv(&recording)).unwrap(),
            "timestamp_ms,power_watts,cadence_rpm\n0,100,90\n1000,110,92"
        );
    }

    #[test]
    fn test_stopped_recording_is_frozen() {
        let mut store = TelemetryStore::new();
        let t0 = Instant::now();

        store.start_recording_at(t0).unwrap();
        store.on_power_sample(sample(t0, 200, 85));
        store.stop_recording().unwrap();
        store.on_power_sample(sample(t0 + Duration::from_secs(1), 210, 86));

        let last = store.last_recording().unwrap();
        assert_eq!(last.samples().len(), 1);
        assert_eq!(store.window().len(), 2);
        assert!(!store.is_recording());
        assert_eq!(store.recording_status().samples, 1);
    }

    #[test]
    fn test_recording_errors() {
        let mut store = TelemetryStore::new();
        assert!(matches!(
            assert_err!(store.stop_recording()),
            PowerMeterError::NotRecording
        ));

        store.start_recording().unwrap();
        assert!(matches!(
            assert_err!(store.start_recording()),
            PowerMeterError::AlreadyRecording
        ));
        assert!(store.recording_status().active);
    }

    #[test]
    fn test_start_discards_previous_recording() {
        let mut store = TelemetryStore::new();
        let t0 = Instant::now();
        store.start_recording_at(t0).unwrap();
        store.on_power_sample(sample(t0, 150, 70));
        store.stop_recording().unwrap();

        store.start_recording().unwrap();
        assert!(store.last_recording().is_none());
        assert_eq!(store.recording_status().samples, 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = TelemetryStore::new();
        store.start_recording().unwrap();
        store.on_power_sample(PowerSample::now(PowerReading {
            power: 250,
            cadence: 90,
        }));
        store.reset();

        assert!(store.window().is_empty());
        assert!(!store.is_recording());
        assert!(store.last_recording().is_none());
    }

    #[test]
    fn test_empty_recording_csv_is_header_only() {
        let mut store = TelemetryStore::new();
        store.start_recording().unwrap();
        let recording = store.stop_recording().unwrap();
        assert_eq!(recording.to_csv(), CSV_HEADER.as_bytes());
    }

    #[test]
    fn test_recording_filename() {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(
            recording_filename(at),
            "power_data_2023-11-14T22:13:20.123Z.csv"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(61_999), "00:01:01");
        assert_eq!(format_duration(3_723_000), "01:02:03");
    }

    #[test]
    fn test_window_points_follow_samples() {
        let mut window = TelemetryWindow::default();
        let now = Instant::now();
        window.push(sample(now, 120, 80));
        window.push(sample(now, 130, 80));
        let points = window.points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].power, 130);
        assert!(points[0].time_ms > 0);
    }
}
