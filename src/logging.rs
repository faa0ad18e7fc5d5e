use std::io;

use tracing::level_filters::LevelFilter;

/// Sends each formatted log line to the Workers console.
struct ConsoleWriter;

impl io::Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        worker::console_log!("{}", line.trim_end());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Installs the global subscriber. Later calls in the same isolate are no-ops.
pub fn init(level: LevelFilter) {
    // no clock in the isolate, timestamps come from the Workers log pipeline
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(|| ConsoleWriter)
        .try_init();
}
