use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = std::env::var("SCOREP_SUBSTRATES_DYNAMIC_FILTERING_LOG_FILE").ok();
        let mut f: Box<dyn Write + Send> = if let Some(filename) = maybe_filename {
            match File::create(&filename) {
                Ok(file) => Box::new(file),
                Err(_) => Box::new(io::stderr()),
            }
        } else {
            Box::new(io::stderr())
        };

        if let Ok(buf_size) = std::env::var("SCOREP_SUBSTRATES_DYNAMIC_FILTERING_LOG_BUFFER") {
            if let Ok(size) = buf_size.parse::<usize>() {
                f = Box::new(BufWriter::with_capacity(size, f));
            }
        }

        let (default_level, level_map) = match std::env::var("SCOREP_SUBSTRATES_DYNAMIC_FILTERING_LOG") {
            Ok(spec) => parse_log_spec(&spec),
            Err(_) => (LogWarn, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn level_from_name(name: &str) -> Option<LogLevel> {
    match name.trim().to_ascii_lowercase().as_str() {
        "fatal" => Some(LogFatal),
        "error" => Some(LogError),
        "warn" => Some(LogWarn),
        "info" => Some(LogInfo),
        "debug" => Some(LogDebug),
        _ => None,
    }
}

/// Parses `SCOREP_SUBSTRATES_DYNAMIC_FILTERING_LOG`: a comma-separated
/// list of either a bare level (sets the default for modules with no
/// explicit entry) or a `module=level` pair (sets that module's entry in
/// `level_map`), mirroring the host project's own `set_logging` /
/// `set_all_logging` split. Unrecognized entries are ignored.
fn parse_log_spec(spec: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut default_level = LogWarn;
    let mut level_map = HashMap::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((module, level)) => {
                if let Some(level) = level_from_name(level) {
                    level_map.insert(module.trim().to_owned(), level);
                }
            }
            None => {
                if let Some(level) = level_from_name(entry) {
                    default_level = level;
                }
            }
        }
    }
    (default_level, level_map)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    match l.level_map.get(module_name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .unwrap()
        .to_string_lossy()
        .to_string()
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(m) = l.log_modules_cache.get(filename) {
        return m.to_owned();
    }
    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(level: LogLevel, filename: &str, line: u32, func_name: &str) -> NewLineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = level == LogFatal || level <= m.level;
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            write!(this, "[{}] {}() ", log_name(level), func_name).unwrap();
        }
        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }
        Ok(buf.len())
    }
}

pub fn log(level: LogLevel, filename: &str, line: u32, func_name: &str) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(level, filename, line, func_name)
}

macro_rules! log {
    ($log_level:expr, $($args:tt)*) => {{
        use std::io::Write;
        let mut stream = crate::log::log($log_level, file!(), line!(), module_path!());
        write!(stream, $($args)*).unwrap()
    }};
}

macro_rules! fatal {
    ($($args:tt)+) => {{
        {
            use std::io::Write;
            let mut stream = crate::log::log(crate::log::LogFatal, file!(), line!(), module_path!());
            write!(stream, $($args)+).unwrap();
        }
        crate::log::notifying_abort();
    }};
}

pub fn notifying_abort() -> ! {
    let bt = backtrace::Backtrace::new();
    let _ = write!(io::stderr(), "=== dynamic-filtering backtrace:\n{:?}\n", bt);
    std::process::abort();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_level_sets_the_default() {
        let (default_level, map) = parse_log_spec("debug");
        assert_eq!(default_level, LogDebug);
        assert!(map.is_empty());
    }

    #[test]
    fn module_level_pairs_populate_the_map_without_touching_the_default() {
        let (default_level, map) = parse_log_spec("registry=debug,patch=info");
        assert_eq!(default_level, LogWarn);
        assert_eq!(map.get("registry"), Some(&LogDebug));
        assert_eq!(map.get("patch"), Some(&LogInfo));
    }

    #[test]
    fn bare_level_and_module_overrides_combine() {
        let (default_level, map) = parse_log_spec("warn,unwind=debug");
        assert_eq!(default_level, LogWarn);
        assert_eq!(map.get("unwind"), Some(&LogDebug));
    }

    #[test]
    fn unrecognized_entries_are_ignored() {
        let (default_level, map) = parse_log_spec("nonsense,registry=also-nonsense");
        assert_eq!(default_level, LogWarn);
        assert!(map.is_empty());
    }
}
