/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * A small driver for a headless Chromium, speaking the Chrome DevTools
 * Protocol over a websocket.  Only the handful of operations needed to fill
 * in and submit web forms, wait on page state and scrape text are provided.
 */

use std::time::Duration;

use jenkrun_common::DurationExt;
use thiserror::Error;

mod launch;
mod locator;
mod page;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use launch::{Browser, BrowserConfig};
pub use locator::Locator;
pub use page::Page;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("launching browser: {0}")]
    Launch(String),
    #[error("browser endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("devtools socket: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed devtools message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("devtools error {code} from {method}: {message}")]
    Protocol { method: String, code: i64, message: String },
    #[error("script raised an exception: {0}")]
    Script(String),
    #[error("no element matches {0}")]
    NoElement(String),
    #[error("select {locator} has no option {option:?}")]
    NoOption { locator: String, option: String },
    #[error("navigating to {url}: {reason}")]
    Navigation { url: String, reason: String },
    #[error("timed out after {} waiting for {what}", .after.render())]
    Timeout { what: String, after: Duration },
    #[error("devtools connection closed")]
    Closed,
    #[error("browser I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    /**
     * Errors from script evaluation that are expected while a page is in the
     * middle of a navigation (e.g., the execution context being destroyed)
     * and which are worth polling through.
     */
    pub fn is_transient(&self) -> bool {
        matches!(self, BrowserError::Script(_) | BrowserError::Protocol { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BrowserError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_message() {
        let e = BrowserError::Timeout {
            what: "console output".into(),
            after: Duration::from_secs(125),
        };
        assert_eq!(
            e.to_string(),
            "timed out after 2 m 5 s waiting for console output"
        );
        assert!(e.is_timeout());
        assert!(!e.is_transient());
    }

    #[test]
    fn transient_errors() {
        assert!(BrowserError::Script("context destroyed".into()).is_transient());
        assert!(!BrowserError::Closed.is_transient());
        assert!(!BrowserError::NoElement("x".into()).is_transient());
    }
}
