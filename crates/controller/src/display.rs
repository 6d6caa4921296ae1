//! Two-line status display: formatting plus the console adapter used when no
//! LCD is attached.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::ports::Display;

/// Characters per line on the 16x2 panel.
pub const LINE_WIDTH: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub primary: String,
    pub time_line: String,
}

/// `"<line> HH:MM"` counting down to `target`, or just `line` when there is
/// nothing to count down to.
pub fn primary_line(line: &str, target: Option<OffsetDateTime>, now: OffsetDateTime) -> String {
    let text = match target {
        Some(target) => {
            let remaining = (target - now).whole_minutes().max(0);
            format!("{line} {:02}:{:02}", remaining / 60, remaining % 60)
        }
        None => line.to_string(),
    };
    text.chars().take(LINE_WIDTH).collect()
}

/// Wall-clock line.
pub fn time_line(now: OffsetDateTime) -> String {
    format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
}

pub fn frame(line: &str, target: Option<OffsetDateTime>, now: OffsetDateTime) -> Frame {
    Frame {
        primary: primary_line(line, target, now),
        time_line: time_line(now),
    }
}

// ---------------------------------------------------------------------------
// Console display
// ---------------------------------------------------------------------------

/// Logs the primary line whenever it changes.
#[derive(Default)]
pub struct ConsoleDisplay {
    last: String,
}

impl Display for ConsoleDisplay {
    fn render(&mut self, primary: &str, time_line: &str) {
        if primary != self.last {
            info!(primary, time_line, "display");
            self.last = primary.to_string();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
