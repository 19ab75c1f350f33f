//! Frame recording for `--log` and `-p`.
//!
//! Separate from the tracing pipeline: this is the operator-facing raw frame
//! record, one line per frame with a timestamp, direction and peer address.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tm_link::FrameDirection;

#[derive(Clone)]
pub struct FrameLog {
    inner: Arc<FrameLogInner>,
}

struct FrameLogInner {
    file: Option<Mutex<File>>,
    echo: bool,
}

impl FrameLog {
    /// Returns `Ok(None)` when neither a file nor stdout echo is requested.
    pub fn open(path: Option<&Path>, echo: bool) -> std::io::Result<Option<FrameLog>> {
        if path.is_none() && !echo {
            return Ok(None);
        }
        let file = match path {
            Some(p) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(p)?,
            )),
            None => None,
        };
        Ok(Some(FrameLog {
            inner: Arc::new(FrameLogInner { file, echo }),
        }))
    }

    pub fn record(&self, dir: FrameDirection, peer: &str, text: &str) {
        let arrow = match dir {
            FrameDirection::Inbound => "<-",
            FrameDirection::Outbound => "->",
        };
        let line = format!(
            "{} {} {} {}\n",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            arrow,
            peer,
            text
        );
        if self.inner.echo {
            print!("{line}");
        }
        if let Some(file) = &self.inner.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(line.as_bytes());
        }
    }
}
