use {
    log::{Level, Log, Metadata, Record},
    std::{
        cell::RefCell,
        io::{self, Write},
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering::Relaxed},
        },
        time::SystemTime,
    },
};

thread_local! {
    static BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

pub struct Logger {
    level: AtomicU32,
}

impl Logger {
    /// Installs a logger that writes to stderr. If another logger has
    /// already been installed, that logger stays in place.
    pub fn install_stderr(level: Level) -> Arc<Self> {
        let slf = Arc::new(Self {
            level: AtomicU32::new(level as _),
        });
        let res = log::set_boxed_logger(Box::new(LogWrapper {
            logger: slf.clone(),
        }));
        match res {
            Ok(()) => log::set_max_level(level.to_level_filter()),
            Err(_) => log::warn!("A logger has already been installed"),
        }
        slf
    }

    pub fn set_level(&self, level: Level) {
        self.level.store(level as _, Relaxed);
        log::set_max_level(level.to_level_filter());
    }

    pub fn level(&self) -> Level {
        match self.level.load(Relaxed) {
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

struct LogWrapper {
    logger: Arc<Logger>,
}

impl Log for LogWrapper {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as u32 <= self.logger.level.load(Relaxed)
    }

    fn log(&self, record: &Record) {
        if record.level() as u32 > self.logger.level.load(Relaxed) {
            return;
        }
        BUFFER.with(|buffer| {
            let buffer = &mut *buffer.borrow_mut();
            buffer.clear();
            let now = SystemTime::now();
            let _ = if let Some(mp) = record.module_path() {
                writeln!(
                    buffer,
                    "[{} {:5} {}] {}",
                    humantime::format_rfc3339_millis(now),
                    record.level(),
                    mp,
                    record.args(),
                )
            } else {
                writeln!(
                    buffer,
                    "[{} {:5}] {}",
                    humantime::format_rfc3339_millis(now),
                    record.level(),
                    record.args(),
                )
            };
            let _ = io::stderr().lock().write_all(buffer);
        });
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}
