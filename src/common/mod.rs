//! Common utilities shared by the CLI, the runner and the mock peer

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result, TeardownWarning};

/// Take at most `max` bytes of `text`, backing off to a char boundary
pub fn truncate_to_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
