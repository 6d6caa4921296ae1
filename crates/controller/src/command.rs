//! Inbound command decoding.
//!
//! Every payload starts with a one-letter tag:
//!
//! | payload          | meaning                                             |
//! |------------------|-----------------------------------------------------|
//! | `cHH:MM:SSmmPP`  | configure start time, duration (min), period (h)    |
//! | `r`, `rH`, `rHH` | rain delay in hours; `0` or empty clears it         |
//! | `sMM`            | manual start for `MM` minutes                       |
//! | `t`              | manual stop                                         |
//! | `x`              | restart the controller                              |
//! | `a`              | drain the flow meter and report the volume          |
//!
//! Lengths and character classes are checked before any field is read.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Configure {
        /// `HH:MM:SS`; digits are checked here, ranges by the schedule.
        start: String,
        duration_minutes: u8,
        period_hours: u8,
    },
    RainDelay {
        hours: u32,
    },
    StartManual {
        minutes: u8,
    },
    StopManual,
    Restart,
    ResetMeter,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command payload")]
    Empty,
    #[error("command payload is not ASCII")]
    NotAscii,
    #[error("unknown command tag '{0}'")]
    UnknownTag(char),
    #[error("'{tag}' command expects {expected}, got {len} bytes")]
    Length {
        tag: char,
        expected: &'static str,
        len: usize,
    },
    #[error("'{tag}' command has unexpected character at offset {offset}")]
    Format { tag: char, offset: usize },
}

const TAG_CONFIGURE: u8 = b'c';
const TAG_RAIN_DELAY: u8 = b'r';
const TAG_START: u8 = b's';
const TAG_STOP: u8 = b't';
const TAG_RESTART: u8 = b'x';
const TAG_RESET_METER: u8 = b'a';

const CONFIGURE_LEN: usize = 13;

/// Decode one command payload.  Surrounding whitespace is ignored.
pub fn decode(payload: &[u8]) -> Result<Command, CommandError> {
    let p = payload.trim_ascii();
    let Some(&tag) = p.first() else {
        return Err(CommandError::Empty);
    };
    if !p.is_ascii() {
        return Err(CommandError::NotAscii);
    }

    match tag {
        TAG_CONFIGURE => decode_configure(p),
        TAG_RAIN_DELAY => {
            expect_len(p, 1..=3, "1-3 bytes")?;
            let hours = if p.len() == 1 { 0 } else { digits(p, 1, p.len())? };
            Ok(Command::RainDelay { hours })
        }
        TAG_START => {
            expect_len(p, 3..=3, "3 bytes")?;
            Ok(Command::StartManual {
                minutes: digits(p, 1, 3)? as u8,
            })
        }
        TAG_STOP => bare(p, Command::StopManual),
        TAG_RESTART => bare(p, Command::Restart),
        TAG_RESET_METER => bare(p, Command::ResetMeter),
        other => Err(CommandError::UnknownTag(char::from(other))),
    }
}

/// `cHH:MM:SSmmPP`
fn decode_configure(p: &[u8]) -> Result<Command, CommandError> {
    expect_len(p, CONFIGURE_LEN..=CONFIGURE_LEN, "13 bytes")?;

    for offset in [3, 6] {
        if p[offset] != b':' {
            return Err(CommandError::Format {
                tag: char::from(p[0]),
                offset,
            });
        }
    }
    // Validate the time digits without using the values yet.
    for (from, to) in [(1, 3), (4, 6), (7, 9)] {
        digits(p, from, to)?;
    }

    let start = String::from_utf8_lossy(&p[1..9]).into_owned();
    let duration_minutes = digits(p, 9, 11)? as u8;
    let period_hours = digits(p, 11, 13)? as u8;

    Ok(Command::Configure {
        start,
        duration_minutes,
        period_hours,
    })
}

fn bare(p: &[u8], cmd: Command) -> Result<Command, CommandError> {
    expect_len(p, 1..=1, "1 byte")?;
    Ok(cmd)
}

fn expect_len(
    p: &[u8],
    range: std::ops::RangeInclusive<usize>,
    expected: &'static str,
) -> Result<(), CommandError> {
    if range.contains(&p.len()) {
        Ok(())
    } else {
        Err(CommandError::Length {
            tag: char::from(p[0]),
            expected,
            len: p.len(),
        })
    }
}

/// Parse `p[from..to]` as decimal digits.  At most two digits are ever
/// passed, so the value fits in a `u32`.
fn digits(p: &[u8], from: usize, to: usize) -> Result<u32, CommandError> {
    let mut value = 0u32;
    for (offset, b) in p.iter().enumerate().take(to).skip(from) {
        if !b.is_ascii_digit() {
            return Err(CommandError::Format {
                tag: char::from(p[0]),
                offset,
            });
        }
        value = value * 10 + u32::from(b - b'0');
    }
    Ok(value)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- configure ----------------------------------------------------------

    #[test]
    fn configure_valid() {
        assert_eq!(
            decode(b"c06:30:004512"),
            Ok(Command::Configure {
                start: "06:30:00".into(),
                duration_minutes: 45,
                period_hours: 12,
            })
        );
    }

    #[test]
    fn configure_passes_out_of_range_time_through() {
        // Range checks belong to the schedule, not the decoder.
        assert!(matches!(
            decode(b"c25:00:001006"),
            Ok(Command::Configure { ref start, .. }) if start == "25:00:00"
        ));
    }

    #[test]
    fn configure_short_payload_rejected() {
        assert_eq!(
            decode(b"c06:30"),
            Err(CommandError::Length {
                tag: 'c',
                expected: "13 bytes",
                len: 6
            })
        );
    }

    #[test]
    fn configure_long_payload_rejected() {
        assert!(matches!(
            decode(b"c06:30:00451299"),
            Err(CommandError::Length { len: 15, .. })
        ));
    }

    #[test]
    fn configure_bad_separator_rejected() {
        assert_eq!(
            decode(b"c06-30:004512"),
            Err(CommandError::Format { tag: 'c', offset: 3 })
        );
    }

    #[test]
    fn configure_non_digit_rejected() {
        assert_eq!(
            decode(b"c06:30:0045x2"),
            Err(CommandError::Format { tag: 'c', offset: 11 })
        );
        assert_eq!(
            decode(b"c0a:30:004512"),
            Err(CommandError::Format { tag: 'c', offset: 2 })
        );
    }

    // -- rain delay -----------------------------------------------------------

    #[test]
    fn rain_delay_forms() {
        assert_eq!(decode(b"r"), Ok(Command::RainDelay { hours: 0 }));
        assert_eq!(decode(b"r0"), Ok(Command::RainDelay { hours: 0 }));
        assert_eq!(decode(b"r5"), Ok(Command::RainDelay { hours: 5 }));
        assert_eq!(decode(b"r48"), Ok(Command::RainDelay { hours: 48 }));
    }

    #[test]
    fn rain_delay_too_long_rejected() {
        assert!(matches!(decode(b"r100"), Err(CommandError::Length { .. })));
    }

    #[test]
    fn rain_delay_non_digit_rejected() {
        assert_eq!(
            decode(b"r1h"),
            Err(CommandError::Format { tag: 'r', offset: 2 })
        );
    }

    // -- manual start / stop ----------------------------------------------------

    #[test]
    fn start_manual_two_digits() {
        assert_eq!(decode(b"s15"), Ok(Command::StartManual { minutes: 15 }));
        assert_eq!(decode(b"s00"), Ok(Command::StartManual { minutes: 0 }));
    }

    #[test]
    fn start_manual_wrong_length_rejected() {
        assert!(matches!(decode(b"s5"), Err(CommandError::Length { .. })));
        assert!(matches!(decode(b"s120"), Err(CommandError::Length { .. })));
    }

    #[test]
    fn bare_commands() {
        assert_eq!(decode(b"t"), Ok(Command::StopManual));
        assert_eq!(decode(b"x"), Ok(Command::Restart));
        assert_eq!(decode(b"a"), Ok(Command::ResetMeter));
    }

    #[test]
    fn bare_command_with_trailing_bytes_rejected() {
        assert!(matches!(decode(b"tt"), Err(CommandError::Length { .. })));
    }

    #[test]
    fn surrounding_whitespace_ignored() {
        assert_eq!(decode(b"  t\n"), Ok(Command::StopManual));
        assert_eq!(decode(b"s30\r\n"), Ok(Command::StartManual { minutes: 30 }));
    }

    // -- general ------------------------------------------------------------------

    #[test]
    fn empty_payload_rejected() {
        assert_eq!(decode(b""), Err(CommandError::Empty));
        assert_eq!(decode(b"   "), Err(CommandError::Empty));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(decode(b"z"), Err(CommandError::UnknownTag('z')));
    }

    #[test]
    fn non_ascii_rejected() {
        assert_eq!(decode("sé".as_bytes()), Err(CommandError::NotAscii));
    }

    #[test]
    fn error_messages_are_readable() {
        let err = decode(b"s5").unwrap_err();
        assert_eq!(err.to_string(), "'s' command expects 3 bytes, got 2 bytes");
    }
}
