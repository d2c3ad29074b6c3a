//! Output Protocol Parser for the redaction worker's stdout.
//!
//! The worker prints two base64 JPEGs separated by `---SPLIT---`, possibly
//! surrounded by log lines. The contract:
//! - split on the LAST delimiter (earlier ones may appear in log text)
//! - in each section, the payload is the last non-blank line
//! - the first payload is fully redacted, the second leaves plates visible
//!
//! The delimiter is matched as a substring, so the inline form the stock
//! worker prints (`<auto>---SPLIT---<plate>` on one line) parses too.

use std::fmt;

use base64::Engine;
use thiserror::Error;

use crate::models::RedactedImages;

pub const DELIMITER: &str = "---SPLIT---";

/// Media type the worker is contracted to emit.
pub const PAYLOAD_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    AutoMosaic,
    PlateVisible,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoMosaic => write!(f, "auto-mosaic"),
            Self::PlateVisible => write!(f, "plate-visible"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Worker produced no output")]
    EmptyOutput,

    #[error("Delimiter ---SPLIT--- not found in worker output")]
    MissingDelimiter,

    #[error("No {0} payload in worker output")]
    MissingPayload(Section),

    #[error("{section} payload is not valid base64: {reason}")]
    InvalidPayload { section: Section, reason: String },
}

/// The two raw base64 payloads, borrowed from the worker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payloads<'a> {
    pub auto_mosaic: &'a str,
    pub plate_visible: &'a str,
}

/// Extract and validate both payloads from worker stdout.
pub fn split_payloads(stdout: &str) -> Result<Payloads<'_>, ProtocolError> {
    if stdout.trim().is_empty() {
        return Err(ProtocolError::EmptyOutput);
    }

    let split_at = stdout.rfind(DELIMITER).ok_or(ProtocolError::MissingDelimiter)?;
    let before = &stdout[..split_at];
    let after = &stdout[split_at + DELIMITER.len()..];

    let auto_mosaic =
        last_non_empty_line(before).ok_or(ProtocolError::MissingPayload(Section::AutoMosaic))?;
    let plate_visible =
        last_non_empty_line(after).ok_or(ProtocolError::MissingPayload(Section::PlateVisible))?;

    check_base64(Section::AutoMosaic, auto_mosaic)?;
    check_base64(Section::PlateVisible, plate_visible)?;

    Ok(Payloads {
        auto_mosaic,
        plate_visible,
    })
}

/// Parse worker stdout into the two variants as `data:image/jpeg` URIs.
pub fn parse_worker_output(stdout: &str) -> Result<RedactedImages, ProtocolError> {
    let payloads = split_payloads(stdout)?;
    Ok(RedactedImages {
        auto_mosaic_image: to_data_uri(payloads.auto_mosaic),
        plate_visible_image: to_data_uri(payloads.plate_visible),
    })
}

fn to_data_uri(payload: &str) -> String {
    format!("data:{PAYLOAD_MEDIA_TYPE};base64,{payload}")
}

fn last_non_empty_line(section: &str) -> Option<&str> {
    section
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
}

fn check_base64(section: Section, payload: &str) -> Result<(), ProtocolError> {
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map(|_| ())
        .map_err(|e| ProtocolError::InvalidPayload {
            section,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn log_lines_around_payloads_are_ignored() {
        let stdout = "init...\nAAAA\n---SPLIT---\nlog\nBBBB\n";
        let payloads = split_payloads(stdout).unwrap();
        assert_eq!(payloads.auto_mosaic, "AAAA");
        assert_eq!(payloads.plate_visible, "BBBB");
    }

    #[test]
    fn splits_on_last_delimiter() {
        let stdout = "debug: will print ---SPLIT--- between images\nAAAA\n---SPLIT---\nBBBB\n";
        let payloads = split_payloads(stdout).unwrap();
        assert_eq!(payloads.auto_mosaic, "AAAA");
        assert_eq!(payloads.plate_visible, "BBBB");
    }

    #[test]
    fn inline_delimiter_from_stock_worker() {
        let payloads = split_payloads("/9j/AAAA---SPLIT---/9j/BBBB\n").unwrap();
        assert_eq!(payloads.auto_mosaic, "/9j/AAAA");
        assert_eq!(payloads.plate_visible, "/9j/BBBB");
    }

    #[test]
    fn blank_lines_and_whitespace_tolerated() {
        let stdout = "\n\n   AAAA   \n\n\r\n---SPLIT---\n\n  BBBB\t\n\n";
        let payloads = split_payloads(stdout).unwrap();
        assert_eq!(payloads.auto_mosaic, "AAAA");
        assert_eq!(payloads.plate_visible, "BBBB");
    }

    #[test]
    fn empty_output_is_malformed() {
        assert_eq!(split_payloads(""), Err(ProtocolError::EmptyOutput));
        assert_eq!(split_payloads(" \n\n"), Err(ProtocolError::EmptyOutput));
    }

    #[test]
    fn missing_delimiter_is_malformed() {
        assert_eq!(split_payloads("AAAA\nBBBB\n"), Err(ProtocolError::MissingDelimiter));
    }

    #[test]
    fn empty_side_is_malformed() {
        assert_eq!(
            split_payloads("\n---SPLIT---\nBBBB\n"),
            Err(ProtocolError::MissingPayload(Section::AutoMosaic))
        );
        assert_eq!(
            split_payloads("AAAA\n---SPLIT---\n   \n"),
            Err(ProtocolError::MissingPayload(Section::PlateVisible))
        );
    }

    #[test]
    fn non_base64_payload_is_malformed() {
        let err = split_payloads("AAAA\n---SPLIT---\nTraceback (most recent call last):\n").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload { section: Section::PlateVisible, .. }
        ));
    }

    #[test]
    fn parse_wraps_payloads_as_jpeg_data_uris() {
        let images = parse_worker_output("AAAA\n---SPLIT---\nBBBB\n").unwrap();
        assert_eq!(images.auto_mosaic_image, "data:image/jpeg;base64,AAAA");
        assert_eq!(images.plate_visible_image, "data:image/jpeg;base64,BBBB");
    }

    fn base64_payload() -> impl Strategy<Value = String> {
        proptest::collection::vec(any::<u8>(), 1..64)
            .prop_map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    fn log_line() -> impl Strategy<Value = String> {
        // Log text with spaces so it can never be mistaken for a payload line.
        "[a-z]{1,8} [a-z :.]{0,20}"
    }

    proptest! {
        #[test]
        fn recovers_payloads_through_arbitrary_logs(
            auto in base64_payload(),
            plate in base64_payload(),
            pre in proptest::collection::vec(log_line(), 0..4),
            mid in proptest::collection::vec(log_line(), 0..4),
        ) {
            let mut stdout = String::new();
            for line in &pre {
                stdout.push_str(line);
                stdout.push('\n');
            }
            stdout.push_str(&format!("{auto}\n{DELIMITER}\n"));
            for line in &mid {
                stdout.push_str(line);
                stdout.push('\n');
            }
            stdout.push_str(&format!("{plate}\n"));

            let payloads = split_payloads(&stdout).unwrap();
            prop_assert_eq!(payloads.auto_mosaic, auto.as_str());
            prop_assert_eq!(payloads.plate_visible, plate.as_str());
        }

        #[test]
        fn never_yields_a_single_payload(stdout in "(?s).{0,200}") {
            match split_payloads(&stdout) {
                Ok(p) => {
                    prop_assert!(!p.auto_mosaic.is_empty());
                    prop_assert!(!p.plate_visible.is_empty());
                }
                Err(_) => {}
            }
        }
    }
}
