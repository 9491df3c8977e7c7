use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    sync::OnceLock,
};

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use indicatif::MultiProgress;

static PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

/// Progress bars drawn on stderr. Bars must be added here so that log lines
/// are printed above them instead of through them.
pub fn progress() -> &'static MultiProgress {
    PROGRESS.get_or_init(MultiProgress::new)
}

/// Writes every log line to stderr and to a file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        progress().suspend(|| io::stderr().write_all(buf))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn format_line(
    buf: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> io::Result<()> {
    writeln!(
        buf,
        "{} - {} - {}",
        buf.timestamp_millis(),
        record.level(),
        record.args()
    )
}

/// Installs the global logger; the log file is truncated. `RUST_LOG` overrides
/// the default `info` filter.
pub fn init<T: AsRef<Path>>(log_path: T) -> Result<()> {
    let log_path = log_path.as_ref();
    let file = File::create(log_path)
        .with_context(|| format!("failed to create log file {}", log_path.display()))?;
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(format_line)
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .context("logger already initialized")?;
    Ok(())
}
