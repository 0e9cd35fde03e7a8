use std::{
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, LazyLock, Mutex},
    thread,
};

use anyhow::Result;
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    {ContentLimit, FileRotate},
};
use log::Log;
use simplelog::{ConfigBuilder, LevelFilter, WriteLogger};

/// Receives every formatted log line, e.g. the host app's log view.
pub type LogSink = Box<dyn Fn(String) + Send + Sync>;

static LOG_SINK: LazyLock<Mutex<Option<LogSink>>> = LazyLock::new(|| Mutex::new(None));

static LOG_SENDER: LazyLock<Mutex<Option<mpsc::Sender<String>>>> =
    LazyLock::new(|| Mutex::new(None));

struct MainLogger {
    write_logger: Box<WriteLogger<FileRotate<AppendTimestamp>>>,
}

impl Log for MainLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.write_logger.log(record);

        let message = format_line(record);
        match LOG_SENDER.lock().unwrap().as_ref() {
            // the dispatcher may be gone during shutdown
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => eprintln!("{}", message),
        }
    }

    fn flush(&self) {}
}

fn format_line(record: &log::Record) -> String {
    format!("{}:{} -- {}", record.level(), record.target(), record.args())
}

pub fn log_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join("logs/main.log")
}

/// Installs the global logger. Can only succeed once per process.
pub fn init(cache_dir: &Path) -> Result<()> {
    let log = FileRotate::new(
        log_path(cache_dir),
        AppendTimestamp::default(FileLimit::MaxFiles(3)),
        ContentLimit::Lines(1000),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let write_logger = WriteLogger::new(LevelFilter::Info, config, log);
    log::set_boxed_logger(Box::new(MainLogger { write_logger }))?;
    log::set_max_level(LevelFilter::Info);

    init_dispatcher();
    Ok(())
}

// Sink callbacks run on their own thread so a slow host never stalls the
// thread that logged.
fn init_dispatcher() {
    let mut guard = LOG_SENDER.lock().unwrap();
    if guard.is_some() {
        return;
    }

    let (tx, rx) = mpsc::channel::<String>();
    *guard = Some(tx);

    thread::spawn(move || {
        while let Ok(msg) = rx.recv() {
            let sink = LOG_SINK.lock().unwrap();
            match sink.as_ref() {
                Some(sink) => sink(msg),
                None => eprintln!("{}", msg),
            }
        }
    });
}

pub fn set_sink(sink: LogSink) {
    *LOG_SINK.lock().unwrap() = Some(sink);
}

pub fn clear_sink() {
    *LOG_SINK.lock().unwrap() = None;
}

/// The current log file and its rotated predecessors, for sharing.
pub fn log_files(cache_dir: &Path) -> Result<Vec<PathBuf>> {
    let folder = cache_dir.join("logs");
    let mut files: Vec<PathBuf> = fs::read_dir(folder)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempdir::TempDir;

    #[test]
    fn file_and_sink_receive_lines() {
        let dir = TempDir::new("logs").unwrap();
        init(dir.path()).unwrap();
        assert!(init(dir.path()).is_err());

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        set_sink(Box::new(move |line| sink_lines.lock().unwrap().push(line)));

        info!("hello from the test");
        for _ in 0..50 {
            if !lines.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        clear_sink();

        let lines = lines.lock().unwrap();
        assert!(lines
            .iter()
            .any(|l| l.starts_with("INFO:") && l.ends_with("-- hello from the test")));
        let files = log_files(dir.path()).unwrap();
        assert!(files.contains(&log_path(dir.path())));
    }
}
