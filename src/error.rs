//! Error types shared across the crate.
//!
//! Recoverable failures (resource acquisition, bad configuration, misuse of a
//! scheduler's lifecycle) are reported through [`Error`]. Broken runtime
//! invariants are not errors: they go through [`abort_with`], which logs and
//! terminates the process.

use crate::fiber::FiberState;
use crate::log::Logger;
use crate::scheduler::SchedulerState;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn thread `{name}`")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("thread `{name}` panicked before it could be joined")]
    ThreadJoin { name: String },

    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("a scheduler needs at least one worker")]
    NoWorkers,

    #[error("affinity names worker {worker} but the scheduler has {workers} workers")]
    InvalidAffinity { worker: usize, workers: usize },

    #[error("scheduler `{name}` is {actual:?}, expected {expected:?}")]
    InvalidState {
        name: String,
        expected: SchedulerState,
        actual: SchedulerState,
    },

    #[error("scheduler `{name}` runs on its caller thread and must be stopped from it")]
    ForeignStop { name: String },

    #[error("a thread's main fiber cannot be scheduled")]
    MainFiberTask,

    #[error("failed to open log file `{}`", path.display())]
    LogAppender {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("fiber {id} cannot be recycled in state {state:?}")]
    NotRecyclable { id: u64, state: FiberState },

    #[error("invalid config key `{0}`")]
    InvalidConfigName(String),

    #[error("config key `{name}` holds a {actual}, not a {expected}")]
    ConfigTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid value for config key `{name}`")]
    ConfigValue {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("malformed YAML document")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read config file `{}`", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown log level `{0}`")]
    InvalidLogLevel(String),
}

/// Reports a fatal invariant violation and terminates the process.
///
/// Used when execution state can no longer be trusted (double resume, a
/// trampoline falling off its end, dropping a live fiber).
#[cold]
#[inline(never)]
pub fn abort_with(args: fmt::Arguments<'_>) -> ! {
    let message = args.to_string();
    Logger::system().fatal(&message);
    eprintln!("fibersched: fatal: {message}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::InvalidAffinity {
            worker: 7,
            workers: 2,
        };
        assert_eq!(
            err.to_string(),
            "affinity names worker 7 but the scheduler has 2 workers"
        );

        let err = Error::NotRecyclable {
            id: 3,
            state: FiberState::Hold,
        };
        assert_eq!(err.to_string(), "fiber 3 cannot be recycled in state Hold");
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error as _;

        let err = Error::ThreadSpawn {
            name: "worker_0".into(),
            source: io::Error::new(io::ErrorKind::OutOfMemory, "no threads left"),
        };
        let source = err.source().expect("spawn errors carry their io::Error");
        assert_eq!(source.to_string(), "no threads left");
    }
}
