//! Time-triggered maintenance entries.
//!
//! The framework does not run a scheduler of its own; it describes the
//! recurring log-maintenance work as [`ScheduleEntry`] values and hands
//! them to the embedder's [`Scheduler`] collaborator at startup. The
//! logger is likewise reached only through the [`LogMaintenance`] trait.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::error::Result;

static NEXT_SCHEDULE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for a schedule entry.
pub fn next_schedule_id() -> u64 {
    NEXT_SCHEDULE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Wall-clock time of day for the first run of a daily entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// One recurring maintenance job.
pub struct ScheduleEntry {
    pub id: u64,
    /// First run; `None` starts the entry immediately.
    pub first_run: Option<TimeOfDay>,
    pub interval: Duration,
    pub job: Box<dyn FnMut() + Send>,
}

/// The background scheduler collaborator. It owns the timing thread; the
/// framework only registers entries.
pub trait Scheduler {
    fn start(&self, entries: Vec<ScheduleEntry>) -> Result<()>;
}

/// Log-maintenance operations the schedule entries invoke.
pub trait LogMaintenance: Send + Sync + 'static {
    /// Flush buffered log records to their sink.
    fn sync_buffer(&self);
    /// Set the date-suffix format used when rotating.
    fn set_rotate_time_format(&self, format: &str);
    /// Rotate the error log.
    fn notify_rotate(&self);
    /// Limit how many days of rotated files are kept.
    fn set_keep_days(&self, days: u32);
    /// Delete rotated files older than the keep limit.
    fn delete_old_files(&self);
}

const SECONDS_PER_DAY: u64 = 86400;

pub(crate) fn build_entries(
    config: &ServiceConfig,
    log: Arc<dyn LogMaintenance>,
) -> Vec<ScheduleEntry> {
    let mut entries = Vec::with_capacity(3);

    {
        let log = log.clone();
        entries.push(ScheduleEntry {
            id: next_schedule_id(),
            first_run: None,
            interval: Duration::from_secs(config.sync_log_buff_interval),
            job: Box::new(move || log.sync_buffer()),
        });
    }

    if config.rotate_error_log {
        log.set_rotate_time_format("%Y%m%d");
        {
            let log = log.clone();
            entries.push(ScheduleEntry {
                id: next_schedule_id(),
                first_run: Some(TimeOfDay {
                    hour: 0,
                    minute: 0,
                    second: 0,
                }),
                interval: Duration::from_secs(SECONDS_PER_DAY),
                job: Box::new(move || log.notify_rotate()),
            });
        }

        if config.log_file_keep_days > 0 {
            log.set_keep_days(config.log_file_keep_days);
            entries.push(ScheduleEntry {
                id: next_schedule_id(),
                first_run: Some(TimeOfDay {
                    hour: 1,
                    minute: 0,
                    second: 0,
                }),
                interval: Duration::from_secs(SECONDS_PER_DAY),
                job: Box::new(move || log.delete_old_files()),
            });
        }
    }

    entries
}

/// Register the framework's maintenance entries with the scheduler:
/// a log-buffer flush, plus daily rotation and old-file deletion when
/// enabled in the configuration.
pub fn startup_schedule(
    config: &ServiceConfig,
    log: Arc<dyn LogMaintenance>,
    scheduler: &dyn Scheduler,
) -> Result<()> {
    scheduler.start(build_entries(config, log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLog {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingLog {
        fn record(&self, call: &str) {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    impl LogMaintenance for RecordingLog {
        fn sync_buffer(&self) {
            self.record("sync");
        }
        fn set_rotate_time_format(&self, format: &str) {
            self.record(&format!("format:{format}"));
        }
        fn notify_rotate(&self) {
            self.record("rotate");
        }
        fn set_keep_days(&self, days: u32) {
            self.record(&format!("keep:{days}"));
        }
        fn delete_old_files(&self) {
            self.record("delete");
        }
    }

    #[test]
    fn flush_entry_is_always_registered() {
        let log = Arc::new(RecordingLog::default());
        let config = ServiceConfig {
            sync_log_buff_interval: 5,
            ..Default::default()
        };
        let entries = build_entries(&config, log);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].first_run.is_none());
        assert_eq!(entries[0].interval, Duration::from_secs(5));
    }

    #[test]
    fn rotation_adds_midnight_entry() {
        let log = Arc::new(RecordingLog::default());
        let config = ServiceConfig {
            rotate_error_log: true,
            ..Default::default()
        };
        let entries = build_entries(&config, log.clone());
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1].first_run,
            Some(TimeOfDay {
                hour: 0,
                minute: 0,
                second: 0
            })
        );
        assert_eq!(entries[1].interval, Duration::from_secs(86400));
        assert!(log.calls().contains(&"format:%Y%m%d".to_string()));
    }

    #[test]
    fn keep_days_adds_deletion_entry() {
        let log = Arc::new(RecordingLog::default());
        let config = ServiceConfig {
            rotate_error_log: true,
            log_file_keep_days: 7,
            ..Default::default()
        };
        let mut entries = build_entries(&config, log.clone());
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[2].first_run,
            Some(TimeOfDay {
                hour: 1,
                minute: 0,
                second: 0
            })
        );
        assert!(log.calls().contains(&"keep:7".to_string()));

        // Entries drive the logger they were built over.
        for entry in &mut entries {
            (entry.job)();
        }
        let calls = log.calls();
        assert!(calls.contains(&"sync".to_string()));
        assert!(calls.contains(&"rotate".to_string()));
        assert!(calls.contains(&"delete".to_string()));
    }

    #[test]
    fn keep_days_without_rotation_is_ignored() {
        let log = Arc::new(RecordingLog::default());
        let config = ServiceConfig {
            log_file_keep_days: 7,
            ..Default::default()
        };
        assert_eq!(build_entries(&config, log).len(), 1);
    }

    #[test]
    fn ids_are_unique() {
        let a = next_schedule_id();
        let b = next_schedule_id();
        assert_ne!(a, b);
    }
}
