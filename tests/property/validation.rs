//! Property-based tests for content validation and wire decoding.
//!
//! Uses proptest to verify:
//! 1. Blank input is always rejected as empty.
//! 2. Accepted content is trimmed, non-empty and within the length limit,
//!    counted in characters.
//! 3. Random bytes never cause a panic when decoded as channel events or
//!    control frames.

use proptest::prelude::*;
use threadsync_proto::codec;
use threadsync_proto::message::{MAX_CONTENT_CHARS, ValidationError, validate_content};

proptest! {
    /// Whitespace-only input is empty.
    #[test]
    fn blank_is_empty(blank in "[ \t\r\n]{0,64}") {
        prop_assert_eq!(validate_content(&blank), Err(ValidationError::Empty));
    }

    /// Accepted content is the trimmed input.
    #[test]
    fn accepted_content_is_trimmed(
        pad_left in "[ \t\n]{0,8}",
        body in "[a-zA-Z0-9.,!?'é]{1,40}( [a-zA-Z0-9.,!?'é]{1,40}){0,4}",
        pad_right in "[ \t\n]{0,8}",
    ) {
        let raw = format!("{pad_left}{body}{pad_right}");
        prop_assert_eq!(validate_content(&raw), Ok(body));
    }

    /// The limit is counted in characters, not bytes.
    #[test]
    fn length_limit_counts_chars(extra in 0usize..8, c in prop::char::range('a', '\u{1F600}')) {
        prop_assume!(!c.is_whitespace());
        let at_limit: String = std::iter::repeat_n(c, MAX_CONTENT_CHARS).collect();
        prop_assert!(validate_content(&at_limit).is_ok());

        let over: String = std::iter::repeat_n(c, MAX_CONTENT_CHARS + 1 + extra).collect();
        prop_assert_eq!(
            validate_content(&over),
            Err(ValidationError::TooLong { len: MAX_CONTENT_CHARS + 1 + extra, max: MAX_CONTENT_CHARS })
        );
    }

    /// Random bytes are rejected gracefully.
    #[test]
    fn decode_random_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_event(&data);
        let _ = codec::decode_control(&data);
    }
}
