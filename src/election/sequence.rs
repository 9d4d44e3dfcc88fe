//! Ticket Sequence Codec
//!
//! The coordination service appends a zero-padded counter to the name of
//! every sequential node. Tickets are named `<prefix><sequence>`, e.g.
//! `node-0000000042`.

use crate::error::{Error, Result};

/// Width of the counter appended by the coordination service
pub const SEQUENCE_WIDTH: usize = 10;

/// Parse the sequence number from a ticket name or full ticket path.
///
/// The sequence is the trailing [`SEQUENCE_WIDTH`] digits, so any prefix
/// works, including one that ends in a digit or has no `-` at all.
pub fn parse_sequence(name: &str) -> Result<u64> {
    let invalid = || Error::InvalidSequence(name.to_string());
    let start = name.len().checked_sub(SEQUENCE_WIDTH).ok_or_else(invalid)?;
    let suffix = name.get(start..).ok_or_else(invalid)?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    suffix.parse::<u64>().map_err(|_| invalid())
}

/// Format a ticket name the way the coordination service assigns it
pub fn format_ticket(prefix: &str, sequence: u64) -> String {
    format!("{}{:0width$}", prefix, sequence, width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("node-0000000152").unwrap(), 152);
        assert_eq!(parse_sequence("/ElectMaster/node-0000000007").unwrap(), 7);
        assert_eq!(parse_sequence("lock-me-0000000003").unwrap(), 3);
        assert_eq!(parse_sequence("lock0000000007").unwrap(), 7);
        assert_eq!(parse_sequence("node-10000000005").unwrap(), 5);
        assert_eq!(parse_sequence("0000000042").unwrap(), 42);
    }

    #[test]
    fn test_parse_sequence_rejects_malformed_names() {
        for name in [
            "node-",
            "node-12a",
            "node",
            "node-+5",
            "node- 1",
            "",
            "42",
            "node-000000001",
            "node-00000000x1",
            "node-00000é000",
        ] {
            assert!(
                matches!(parse_sequence(name), Err(Error::InvalidSequence(_))),
                "{:?} should not parse",
                name
            );
        }
    }

    #[test]
    fn test_format_ticket() {
        assert_eq!(format_ticket("node-", 0), "node-0000000000");
        assert_eq!(format_ticket("node-", 151), "node-0000000151");
        assert_eq!(format_ticket("lock", 9), "lock0000000009");
    }

    #[test]
    fn test_format_then_parse_random_sequences() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let sequence: u64 = rng.gen_range(0..=9_999_999_999);
            assert_eq!(parse_sequence(&format_ticket("node-", sequence)).unwrap(), sequence);
            assert_eq!(parse_sequence(&format_ticket("node-1", sequence)).unwrap(), sequence);
        }
    }
}
