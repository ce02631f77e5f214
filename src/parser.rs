//! Header-parser selection (C6 step 1). Actual QUIC wire-format parsing is
//! out of scope (SPEC_FULL.md §1 Non-goals); this module only defines the
//! narrow capability the ingress dispatcher needs from whatever parser a
//! host plugs in, plus a minimal default so the engine is usable without one.

/// What the ingress dispatcher needs out of a single datagram's header:
/// enough to find the owning connection and to know where the next
/// coalesced datagram (if any) starts.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
    /// Destination connection ID bytes recovered from the header.
    pub dcid: Vec<u8>,
    /// Negotiated or proposed version tag, if the header carries one.
    pub version: u32,
    /// Byte offset, from the start of the slice handed to `parse_begin`, of
    /// the next datagram. Equal to the slice length when this is the last
    /// (or only) datagram in the buffer.
    pub consumed: usize,
    /// Whether this header matches the IETF short-header shape (top two
    /// bits `0b01`) that stateless-reset detection keys off of.
    pub is_short_header: bool,
}

/// Host-supplied (or default) capability for parsing a datagram's header
/// far enough to route it. Selection of *which* parser variant to use is
/// driven by the registry mode / connection version in by-endpoint mode;
/// elsewhere a single generic parser suffices.
pub trait HeaderParserSelector {
    /// Parses as much of `data` as needed to recover a [`ParsedHeader`].
    /// Returns `None` on malformed input.
    fn parse_begin(&mut self, data: &[u8]) -> Option<ParsedHeader>;
}

/// The default parser: treats the first byte as a DCID length prefix and
/// the following bytes as the DCID, consuming the entire remainder of the
/// buffer as one datagram. Adequate for hosts that don't coalesce multiple
/// QUIC packets per UDP datagram or that supply their own selector.
#[derive(Debug, Default)]
pub struct GenericCidParser;

impl HeaderParserSelector for GenericCidParser {
    fn parse_begin(&mut self, data: &[u8]) -> Option<ParsedHeader> {
        let (&len_byte, rest) = data.split_first()?;
        let len = len_byte as usize;
        if rest.len() < len {
            return None;
        }
        Some(ParsedHeader {
            dcid: rest[..len].to_vec(),
            version: 0,
            consumed: data.len(),
            is_short_header: data[0] & 0b1100_0000 == 0b0100_0000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_parser_reads_length_prefixed_dcid() {
        let mut p = GenericCidParser;
        let data = [3u8, b'a', b'b', b'c', 0xff];
        let parsed = p.parse_begin(&data).unwrap();
        assert_eq!(parsed.dcid, b"abc");
        assert_eq!(parsed.consumed, data.len());
    }

    #[test]
    fn generic_parser_rejects_truncated_dcid() {
        let mut p = GenericCidParser;
        let data = [5u8, b'a', b'b'];
        assert!(p.parse_begin(&data).is_none());
    }
}
