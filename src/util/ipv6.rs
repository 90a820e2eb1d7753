//! IPv6 text codec
//!
//! Relay replies come back as the textual address of a relay candidate. These
//! helpers convert between that text and the raw 16 bytes that carry the reply.

use crate::error::{Result, TunnelError};

const GROUPS: usize = 8;

/// Render 16 bytes as canonical IPv6 text.
///
/// Groups are lowercase hex without leading zeros, and the longest run of two or
/// more zero groups collapses to `::`. Unlike `Ipv6Addr`'s `Display`, IPv4-mapped
/// addresses are never written in dotted form, so the output always decodes
/// with [`decode_ipv6`].
pub fn encode_ipv6(bytes: &[u8; 16]) -> String {
    let groups: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    // longest zero run, first one wins on ties
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < GROUPS {
        if groups[i] == 0 {
            let start = i;
            while i < GROUPS && groups[i] == 0 {
                i += 1;
            }
            let len = i - start;
            if len >= 2 && best.map_or(true, |(_, l)| len > l) {
                best = Some((start, len));
            }
        } else {
            i += 1;
        }
    }

    let hex = |gs: &[u16]| {
        gs.iter()
            .map(|g| format!("{:x}", g))
            .collect::<Vec<_>>()
            .join(":")
    };

    match best {
        Some((start, len)) => format!(
            "{}::{}",
            hex(&groups[..start]),
            hex(&groups[start + len..])
        ),
        None => hex(&groups),
    }
}

/// Parse IPv6 text into 16 bytes.
///
/// The first empty group marks where the `::` zero run is expanded. Any later
/// empty group is taken as one explicit zero group, so `1:2:3:4:5:6:7:` decodes
/// with a trailing zero. Relays encode against this exact expansion rule.
pub fn decode_ipv6(text: &str) -> Result<[u8; 16]> {
    if text.is_empty() {
        return Err(TunnelError::Format("empty address".to_string()));
    }
    if text.matches("::").count() > 1 {
        return Err(TunnelError::Format(format!(
            "more than one '::' in address {:?}",
            text
        )));
    }

    let mut groups: Vec<u16> = Vec::with_capacity(GROUPS);
    let mut skip_index = None;

    for (i, part) in text.split(':').enumerate() {
        if part.is_empty() {
            if skip_index.is_none() {
                skip_index = Some(i);
            } else {
                groups.push(0);
            }
            continue;
        }
        if part.len() > 4 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TunnelError::Format(format!(
                "invalid group {:?} in address {:?}",
                part, text
            )));
        }
        let value = u16::from_str_radix(part, 16)
            .map_err(|e| TunnelError::Format(format!("invalid group {:?}: {}", part, e)))?;
        groups.push(value);
    }

    if let Some(at) = skip_index {
        let missing = GROUPS.checked_sub(groups.len()).ok_or_else(|| {
            TunnelError::Format(format!("too many groups in address {:?}", text))
        })?;
        let tail = groups.split_off(at.min(groups.len()));
        groups.extend(std::iter::repeat(0).take(missing));
        groups.extend(tail);
    }

    if groups.len() != GROUPS {
        return Err(TunnelError::Format(format!(
            "address {:?} has {} groups, expected {}",
            text,
            groups.len(),
            GROUPS
        )));
    }

    let mut bytes = [0u8; 16];
    for (i, group) in groups.iter().enumerate() {
        bytes[i * 2..i * 2 + 2].copy_from_slice(&group.to_be_bytes());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_decode_common_forms() {
        assert_eq!(decode_ipv6("::").unwrap(), [0u8; 16]);
        assert_eq!(
            decode_ipv6("::1").unwrap(),
            Ipv6Addr::LOCALHOST.octets()
        );
        assert_eq!(
            decode_ipv6("fc01:203::ff").unwrap(),
            "fc01:203::ff".parse::<Ipv6Addr>().unwrap().octets()
        );
        assert_eq!(
            decode_ipv6("1:2:3:4:5:6:7:8").unwrap(),
            "1:2:3:4:5:6:7:8".parse::<Ipv6Addr>().unwrap().octets()
        );
        assert_eq!(
            decode_ipv6("abcd::").unwrap(),
            "abcd::".parse::<Ipv6Addr>().unwrap().octets()
        );
    }

    #[test]
    fn test_decode_trailing_empty_group_quirk() {
        // a lone trailing colon is the compression point and expands to one zero
        let bytes = decode_ipv6("1:2:3:4:5:6:7:").unwrap();
        assert_eq!(
            bytes,
            "1:2:3:4:5:6:7:0".parse::<Ipv6Addr>().unwrap().octets()
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode_ipv6("1::2::3"), Err(TunnelError::Format(_))));
        assert!(matches!(decode_ipv6("1:2:3"), Err(TunnelError::Format(_))));
        assert!(matches!(
            decode_ipv6("1:2:3:4:5:6:7:8:9"),
            Err(TunnelError::Format(_))
        ));
        assert!(matches!(decode_ipv6("1::g"), Err(TunnelError::Format(_))));
        assert!(matches!(decode_ipv6("12345::"), Err(TunnelError::Format(_))));
        assert!(matches!(decode_ipv6("10.0.0.1"), Err(TunnelError::Format(_))));
        assert!(matches!(decode_ipv6(""), Err(TunnelError::Format(_))));
    }

    #[test]
    fn test_encode_canonical() {
        assert_eq!(encode_ipv6(&[0u8; 16]), "::");
        assert_eq!(encode_ipv6(&Ipv6Addr::LOCALHOST.octets()), "::1");
        let mapped = "::ffff:10.0.0.1".parse::<Ipv6Addr>().unwrap().octets();
        assert_eq!(encode_ipv6(&mapped), "::ffff:a00:1");
        let two_runs = "1:0:0:2:0:0:0:3".parse::<Ipv6Addr>().unwrap().octets();
        assert_eq!(encode_ipv6(&two_runs), "1:0:0:2::3");
        let single_zero = "1:0:2:3:4:5:6:7".parse::<Ipv6Addr>().unwrap().octets();
        assert_eq!(encode_ipv6(&single_zero), "1:0:2:3:4:5:6:7");
    }

    #[test]
    fn test_roundtrip_patterns() {
        let mut samples: Vec<[u8; 16]> = vec![[0u8; 16], [0xff; 16]];
        for i in 0..16 {
            let mut one = [0u8; 16];
            one[i] = 0x5a;
            samples.push(one);
            let mut holes = [0xabu8; 16];
            holes[i] = 0;
            holes[15 - i] = 0;
            samples.push(holes);
        }
        let mut counting = [0u8; 16];
        for (i, b) in counting.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37);
        }
        samples.push(counting);

        for bytes in samples {
            let text = encode_ipv6(&bytes);
            assert_eq!(decode_ipv6(&text).unwrap(), bytes, "text {}", text);
        }
    }
}
