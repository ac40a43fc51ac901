use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::Result;
use slog::{o, Drain, Record};

use crate::conf::logging::{Level, Log, To};
pub use slog::Logger;

/// Routes the `log` facade into `logger`. Fails when a logger is already installed.
pub fn logger_init(logger: &Logger, level: Level) -> Result<()> {
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
        .map_err(|e| anyhow::Error::msg(format!("logger init error, {:?}", e)))?;
    log::set_max_level(slog_log_to_level(level.inner()).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

fn timestamp_local(io: &mut dyn Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Builds the root logger from the `log` settings section.
pub fn config_logger(log: &Log) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(log.filename(), log.to));
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp_local).build().fuse();

    let drain = LevelFilter { drain, level: log.level.inner() }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    slog::Logger::root(drain, o!())
}

struct LevelFilter<D> {
    drain: D,
    level: slog::Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    filename: String,
    to: To,

    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("log file is not open"))
    }
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.file()?.write(buf)?,
            To::Both => {
                let _ = self.console.write(buf)?;
                self.file()?.write(buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => self.console.flush()?,
            To::File => self.file()?.flush()?,
            To::Both => {
                self.console.flush()?;
                self.file()?.flush()?;
            }
            To::Off => {}
        };
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(filename).map_err(|e| {
        io::Error::new(e.kind(), format!("logger file config error, filename: {}, {:?}", filename, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_both_ways() {
        for l in [log::Level::Trace, log::Level::Debug, log::Level::Info, log::Level::Warn, log::Level::Error] {
            assert_eq!(slog_log_to_level(log_to_slog_level(l)), l);
        }
        assert_eq!(slog_log_to_level(slog::Level::Critical), log::Level::Error);
    }

    #[test]
    fn off_swallows_everything() {
        let mut w = WriteFilter::new(String::new(), To::Off);
        assert_eq!(w.write(b"hello").unwrap(), 5);
        w.flush().unwrap();
        assert!(w.file.is_none());

        let log = Log { to: To::Off, ..Default::default() };
        let logger = config_logger(&log);
        slog::info!(logger, "dropped");
    }
}
