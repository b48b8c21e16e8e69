//! Chained extension structs.
//!
//! Descriptors can carry a chain of typed extension links. The union is
//! closed and versioned: new extensions are added as new variants, never by
//! subclassing. Wire layout per link is `u16 stype`, `u16 flags` (bit 0 =
//! mandatory), `u32 len`, then `len` payload bytes; a chain terminates with
//! stype 0. Decoding preserves link order, skips unknown optional links, and
//! rejects unknown mandatory ones. Traversal is capped so a corrupted length
//! field cannot loop forever.

use crate::cmd::{push_u16, push_u32, Reader, WireError};

/// Maximum number of links in one extension chain.
pub const MAX_EXTENSION_LINKS: usize = 16;

const STYPE_END: u16 = 0x0000;
const STYPE_PLACEMENT_HINT: u16 = 0x0001;
const STYPE_CONTENTS_TAG: u16 = 0x0002;

const FLAG_MANDATORY: u16 = 1 << 0;

/// Extension links understood on buffer descriptors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BufferExtension {
    /// Placement hint for the backing allocation.
    PlacementHint { heap: u32 },
    /// Free-form content tag recorded by diagnostic backends.
    ContentsTag { tag: String },
}

pub(crate) fn encode_extension_chain(out: &mut Vec<u8>, chain: &[BufferExtension]) {
    for ext in chain {
        match ext {
            BufferExtension::PlacementHint { heap } => {
                push_u16(out, STYPE_PLACEMENT_HINT);
                push_u16(out, FLAG_MANDATORY);
                push_u32(out, 4);
                push_u32(out, *heap);
            }
            BufferExtension::ContentsTag { tag } => {
                push_u16(out, STYPE_CONTENTS_TAG);
                push_u16(out, FLAG_MANDATORY);
                push_u32(out, tag.len() as u32);
                out.extend_from_slice(tag.as_bytes());
            }
        }
    }
    push_u16(out, STYPE_END);
}

pub(crate) fn decode_extension_chain(
    r: &mut Reader<'_>,
) -> Result<Vec<BufferExtension>, WireError> {
    let mut chain = Vec::new();
    for _ in 0..=MAX_EXTENSION_LINKS {
        let stype = r.read_u16()?;
        if stype == STYPE_END {
            return Ok(chain);
        }
        if chain.len() == MAX_EXTENSION_LINKS {
            return Err(WireError::ExtensionChainTooLong);
        }
        let flags = r.read_u16()?;
        let len = r.read_u32()? as usize;
        let payload = r.read_bytes(len)?;
        match stype {
            STYPE_PLACEMENT_HINT => {
                let mut pr = Reader::new(payload);
                let heap = pr.read_u32()?;
                if pr.remaining() != 0 {
                    return Err(WireError::TrailingBytes);
                }
                chain.push(BufferExtension::PlacementHint { heap });
            }
            STYPE_CONTENTS_TAG => {
                let tag = core::str::from_utf8(payload)
                    .map(str::to_owned)
                    .map_err(|_| WireError::InvalidUtf8)?;
                chain.push(BufferExtension::ContentsTag { tag });
            }
            unknown if flags & FLAG_MANDATORY != 0 => {
                return Err(WireError::UnknownMandatoryExtension(unknown));
            }
            // Unknown optional link: payload already skipped above.
            _ => {}
        }
    }
    Err(WireError::ExtensionChainTooLong)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<Vec<BufferExtension>, WireError> {
        let mut r = Reader::new(bytes);
        let chain = decode_extension_chain(&mut r)?;
        assert_eq!(r.remaining(), 0);
        Ok(chain)
    }

    #[test]
    fn chain_order_is_preserved() {
        let chain = vec![
            BufferExtension::ContentsTag { tag: "a".into() },
            BufferExtension::PlacementHint { heap: 1 },
            BufferExtension::ContentsTag { tag: "b".into() },
        ];
        let mut bytes = Vec::new();
        encode_extension_chain(&mut bytes, &chain);
        assert_eq!(decode(&bytes).unwrap(), chain);
    }

    #[test]
    fn unknown_optional_link_is_skipped() {
        let mut bytes = Vec::new();
        push_u16(&mut bytes, 0x00FE); // unknown stype
        push_u16(&mut bytes, 0); // optional
        push_u32(&mut bytes, 3);
        bytes.extend_from_slice(&[9, 9, 9]);
        push_u16(&mut bytes, STYPE_PLACEMENT_HINT);
        push_u16(&mut bytes, FLAG_MANDATORY);
        push_u32(&mut bytes, 4);
        push_u32(&mut bytes, 7);
        push_u16(&mut bytes, STYPE_END);

        assert_eq!(
            decode(&bytes).unwrap(),
            vec![BufferExtension::PlacementHint { heap: 7 }]
        );
    }

    #[test]
    fn unknown_mandatory_link_is_corruption() {
        let mut bytes = Vec::new();
        push_u16(&mut bytes, 0x00FE);
        push_u16(&mut bytes, FLAG_MANDATORY);
        push_u32(&mut bytes, 0);
        push_u16(&mut bytes, STYPE_END);

        assert_eq!(
            decode(&bytes),
            Err(WireError::UnknownMandatoryExtension(0x00FE))
        );
    }

    #[test]
    fn overlong_chain_is_rejected() {
        let mut bytes = Vec::new();
        for _ in 0..MAX_EXTENSION_LINKS + 1 {
            push_u16(&mut bytes, STYPE_PLACEMENT_HINT);
            push_u16(&mut bytes, FLAG_MANDATORY);
            push_u32(&mut bytes, 4);
            push_u32(&mut bytes, 0);
        }
        push_u16(&mut bytes, STYPE_END);

        assert_eq!(decode(&bytes), Err(WireError::ExtensionChainTooLong));
    }

    #[test]
    fn dangling_link_length_is_corruption() {
        let mut bytes = Vec::new();
        push_u16(&mut bytes, STYPE_CONTENTS_TAG);
        push_u16(&mut bytes, FLAG_MANDATORY);
        push_u32(&mut bytes, 64); // runs past the end
        bytes.extend_from_slice(b"short");

        assert_eq!(decode(&bytes), Err(WireError::UnexpectedEof));
    }
}
