//! Tests for logging configuration parsing
//!
//! Covers the pure functions that turn `LOG_*` environment values into
//! subscriber settings.

use sitewhere_bridge::observability::logging::{parse_level, parse_spans, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_whitespace_is_not_trimmed() {
    assert_eq!(LogFormat::parse(" pretty "), LogFormat::Json);
    assert_eq!(LogFormat::parse("compact\n"), LogFormat::Json);
}

#[test]
fn test_level_names() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("Warn"), Level::WARN);
    assert_eq!(parse_level("INFO"), Level::INFO);
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("trace"), Level::TRACE);
}

#[test]
fn test_unknown_level_falls_back_to_info() {
    for input in ["", "verbose", "5", "warning"] {
        assert_eq!(parse_level(input), Level::INFO, "input: '{input}'");
    }
}

#[test]
fn test_spans_flag() {
    assert!(parse_spans("true"));
    assert!(parse_spans("True"));
    assert!(!parse_spans("yes"));
    assert!(!parse_spans("false"));
}

#[test]
fn test_init_logging_twice_does_not_panic() {
    sitewhere_bridge::observability::init_logging(Level::WARN, LogFormat::Compact, false);
    sitewhere_bridge::observability::init_logging(Level::DEBUG, LogFormat::Json, true);
}
