//! The implementation of the `BJ_LOG` and `BJ_DUMP` environment variables.

use parking_lot::Mutex;
use std::{
    collections::HashSet,
    env,
    error::Error,
    fs::File,
    io::Write,
    path::PathBuf,
    sync::LazyLock,
};
use strum::{EnumCount, FromRepr};

/// How verbose should the compiler's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings (e.g. a function bailing out of the baseline tier).
    Warning,
    /// Log JIT events (e.g. a function starting/finishing compilation).
    JITEvent,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` defaults to stderr.
    ///
    /// Writes are serialised so that concurrent compilations don't interleave
    /// partial lines.
    path: Option<Mutex<PathBuf>>,
}

static LOG: LazyLock<Log> = LazyLock::new(|| match Log::new() {
    Ok(x) => x,
    Err(e) => {
        eprintln!("bj-error: {e}");
        Log {
            level: Verbosity::Error,
            path: None,
        }
    }
});

impl Log {
    fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("BJ_LOG") {
            Ok(s) => {
                let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
                    [path, level] => {
                        if path == "-" {
                            (None, level)
                        } else {
                            let path = PathBuf::from(path);
                            // If there's an existing log file, truncate it so that
                            // later appends aren't appending to a previous run.
                            File::create(&path).ok();
                            (Some(Mutex::new(path)), level)
                        }
                    }
                    [level] => (None, level),
                    [..] => return Err("BJ_LOG must be of the format `[<path|->:]<level>`".into()),
                };
                let level = level
                    .parse::<u8>()
                    .map_err(|e| format!("Invalid BJ_LOG level '{s}': {e}"))?;
                let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
                let level = Verbosity::from_repr(level)
                    .ok_or_else(|| format!("BJ_LOG level {level} exceeds maximum {max_level}"))?;
                Ok(Self { path, level })
            }
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "bj-error",
                Verbosity::Warning => "bj-warning",
                Verbosity::JITEvent => "bj-jit-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    let p = p.lock();
                    File::options()
                        .append(true)
                        .open(&*p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

pub(crate) fn log(level: Verbosity, msg: &str) {
    LOG.log(level, msg);
}

/// Which artefacts should be dumped to stderr after compilation?
#[derive(Eq, Hash, PartialEq)]
pub(crate) enum DumpPhase {
    /// The disassembled native code of a compiled function.
    Asm,
}

impl DumpPhase {
    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "asm" => Ok(Self::Asm),
            _ => Err(format!("Invalid BJ_DUMP value: {s}").into()),
        }
    }
}

static PHASES_TO_DUMP: LazyLock<HashSet<DumpPhase>> = LazyLock::new(|| {
    if let Ok(phases) = env::var("BJ_DUMP") {
        phases
            .split(',')
            .map(|x| DumpPhase::from_str(x).unwrap())
            .collect::<HashSet<DumpPhase>>()
    } else {
        HashSet::new()
    }
});

pub(crate) fn should_dump(phase: DumpPhase) -> bool {
    PHASES_TO_DUMP.contains(&phase)
}
