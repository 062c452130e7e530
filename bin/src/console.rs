/*
 * Copyright 2024 Oxide Computer Company
 */

use std::sync::OnceLock;

use regex::Regex;
use slog::{info, warn, Logger};

/**
 * The lines Jenkins writes at the end of the console log once a build has
 * reached its final state.
 */
pub const TERMINAL_MARKERS: &[&str] =
    &["Finished: SUCCESS", "Finished: FAILURE", "Finished: ABORTED"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Aborted,
}

impl Outcome {
    pub fn from_console(console: &str) -> Option<Outcome> {
        if console.contains("Finished: SUCCESS") {
            Some(Outcome::Success)
        } else if console.contains("Finished: FAILURE") {
            Some(Outcome::Failure)
        } else if console.contains("Finished: ABORTED") {
            Some(Outcome::Aborted)
        } else {
            None
        }
    }

    pub fn log(&self, log: &Logger) {
        match self {
            Outcome::Success => info!(log, "process succeeded!"),
            Outcome::Failure => warn!(log, "process failed!"),
            Outcome::Aborted => warn!(log, "process was aborted!"),
        }
    }
}

/**
 * A span of console output that describes how the remote playbook went.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Debug(String),
    Failure(String),
}

impl Block {
    pub fn kind(&self) -> &'static str {
        match self {
            Block::Debug(_) => "debug",
            Block::Failure(_) => "failure",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Block::Debug(s) | Block::Failure(s) => s,
        }
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, Block::Debug(_))
    }
}

/*
 * Both spans run through the first recap banner that follows them.  The
 * banner is padded out with a long run of asterisks; we require at least
 * thirty of them and take the whole run.
 */
fn debug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)TASK \[debug\].*?PLAY RECAP \*{30}\**").unwrap()
    })
}

fn failure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)fatal: .*?STDOUT:.*?PLAY RECAP \*{30}\**").unwrap()
    })
}

/**
 * Find the debug block in the console output or, only if there is none, the
 * failure block.  Where there are several candidate spans, the first wins.
 */
pub fn extract_block(console: &str) -> Option<Block> {
    if let Some(m) = debug_re().find(console) {
        return Some(Block::Debug(m.as_str().to_string()));
    }

    failure_re().find(console).map(|m| Block::Failure(m.as_str().to_string()))
}

/**
 * Extract the block from the console output and write it to the outcome
 * log, framed by START and END lines.  Finding nothing is not an error.
 */
pub fn report_block(out: &Logger, console: &str) -> Option<Block> {
    let block = extract_block(console);

    match &block {
        Some(b @ Block::Debug(_)) => {
            info!(out, "\nSTART OF TASK [{}]\n", b.kind());
            info!(out, "{}", b.text());
            info!(out, "\nEND OF TASK [{}]\n", b.kind());
        }
        Some(b @ Block::Failure(_)) => {
            warn!(out, "\nSTART OF TASK [{}]\n", b.kind());
            warn!(out, "{}", b.text());
            warn!(out, "\nEND OF TASK [{}]\n", b.kind());
        }
        None => {
            warn!(
                out,
                "No TASK [debug] or [failure] information found in the output."
            );
        }
    }

    block
}
