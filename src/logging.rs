use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggingConfig;
use crate::core::error::Result;

/// Writes every log line to stdout and, when configured, to a log file.
#[derive(Clone)]
pub struct TeeMakeWriter {
    file: Option<Arc<Mutex<File>>>,
    suppress_stdout: bool,
}

impl TeeMakeWriter {
    pub fn new(file: Option<File>, suppress_stdout: bool) -> Self {
        Self {
            file: file.map(|f| Arc::new(Mutex::new(f))),
            suppress_stdout,
        }
    }
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub struct TeeWriter {
    file: Option<Arc<Mutex<File>>>,
    suppress_stdout: bool,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &self.file {
            file.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf)?;
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &self.file {
            file.lock().unwrap_or_else(PoisonError::into_inner).flush()?;
        }
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. A second call keeps the first subscriber.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = config.tracing_level()?;
    let file = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        }
        None => None,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(TeeMakeWriter::new(file, false))
        .with_ansi(config.file.is_none())
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        std::fs::write(&path, "previous run\n").unwrap();

        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let make_writer = TeeMakeWriter::new(Some(file), true);
        let mut writer = make_writer.make_writer();
        writer.write_all(b"task t1 completed\n").unwrap();
        writer.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "previous run\ntask t1 completed\n");
    }
}
