/*
 * Copyright 2024 Oxide Computer Company
 */

use std::io::{IsTerminal, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use slog::{o, Drain, Logger, OwnedKVList, Record};

pub fn read_toml<P: AsRef<Path>, T>(n: P) -> Result<T>
where
    for<'de> T: Deserialize<'de>,
{
    let mut f = std::fs::File::open(n.as_ref())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    Ok(toml::from_str(&buf)?)
}

fn filter_level() -> slog::Level {
    match std::env::var("JENKRUN_DEBUG")
        .map(|v| v.to_ascii_lowercase())
        .as_deref()
    {
        Ok("yes") | Ok("1") | Ok("true") => slog::Level::Debug,
        _ => slog::Level::Info,
    }
}

/**
 * Create the progress log.  Records go to stdout, formatted for a human if
 * stdout is a terminal and as bunyan records otherwise.
 */
pub fn make_log(name: &'static str) -> Logger {
    let filter_level = filter_level();

    if std::io::stdout().is_terminal() {
        /*
         * Use a terminal-formatted logger for interactive processes.
         */
        let dec = slog_term::TermDecorator::new().stdout().build();
        let dr = Mutex::new(
            slog_term::FullFormat::new(dec).use_original_order().build(),
        )
        .filter_level(filter_level)
        .fuse();
        Logger::root(dr, o!("name" => name))
    } else {
        /*
         * Otherwise, emit bunyan-formatted records:
         */
        let dr = Mutex::new(
            slog_bunyan::with_name(name, std::io::stdout())
                .set_flush(true)
                .build(),
        )
        .filter_level(filter_level)
        .fuse();
        Logger::root(dr, o!())
    }
}

/**
 * A drain that writes nothing but the message text of each record, one per
 * line.  Consumers of the outcome stream look for literal framing lines, so
 * there must be no timestamp, level or key-value decoration.
 */
pub struct MessageDrain<W: Write> {
    out: Mutex<W>,
}

impl<W: Write> MessageDrain<W> {
    pub fn new(out: W) -> MessageDrain<W> {
        MessageDrain { out: Mutex::new(out) }
    }
}

impl<W: Write> Drain for MessageDrain<W> {
    type Ok = ();
    type Err = std::io::Error;

    fn log(
        &self,
        record: &Record,
        _values: &OwnedKVList,
    ) -> std::io::Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| std::io::Error::other("outcome log lock poisoned"))?;
        writeln!(out, "{}", record.msg())?;
        out.flush()
    }
}

/**
 * Create the outcome log: the stream that carries only the extracted
 * pipeline output, for consumption by whatever wraps this program.
 */
pub fn make_outcome_log<W>(out: W) -> Logger
where
    W: Write + Send + 'static,
{
    let dr = MessageDrain::new(out).filter_level(slog::Level::Info).fuse();
    Logger::root(dr, o!())
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub trait DurationExt {
    fn render(&self) -> String;
}

impl DurationExt for std::time::Duration {
    fn render(&self) -> String {
        let mut out = String::new();
        let mut secs = self.as_secs();
        let hours = secs / 3600;
        if hours > 0 {
            secs -= hours * 3600;
            out += &format!(" {} h", hours);
        }
        let minutes = secs / 60;
        if minutes > 0 || hours > 0 {
            secs -= minutes * 60;
            out += &format!(" {} m", minutes);
        }
        out += &format!(" {} s", secs);

        out.trim().to_string()
    }
}

/**
 * Interpret a number of seconds from configuration as an optional deadline.
 * Zero means "wait forever".
 */
pub fn secs_to_timeout(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn outcome_log_is_message_only() {
        let cap = Capture::default();
        let log = make_outcome_log(cap.clone());

        slog::info!(log, "START OF TASK [debug]"; "extra" => "ignored");
        slog::warn!(log, "second line");
        slog::debug!(log, "filtered out");

        let text = String::from_utf8(cap.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "START OF TASK [debug]\nsecond line\n");
    }

    #[test]
    fn duration_render() {
        let data = &[
            (0, "0 s"),
            (59, "59 s"),
            (61, "1 m 1 s"),
            (3600, "1 h 0 m 0 s"),
            (3725, "1 h 2 m 5 s"),
        ];

        for (secs, want) in data {
            assert_eq!(Duration::from_secs(*secs).render(), *want);
        }
    }

    #[test]
    fn zero_timeout_is_unbounded() {
        assert_eq!(secs_to_timeout(None), None);
        assert_eq!(secs_to_timeout(Some(0)), None);
        assert_eq!(secs_to_timeout(Some(90)), Some(Duration::from_secs(90)));
    }

    #[test]
    fn read_toml_file() {
        #[derive(Deserialize)]
        struct Thing {
            name: String,
            count: u32,
        }

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "name = \"widget\"\ncount = 3").unwrap();

        let t: Thing = read_toml(f.path()).unwrap();
        assert_eq!(t.name, "widget");
        assert_eq!(t.count, 3);
    }
}
