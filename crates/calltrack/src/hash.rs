/// Fast 32-bit string hash used to index the call and registration
/// tables. Mixes four-byte lumps with an XOR-shift and finishes with a
/// short avalanche so the low bits (the ones the shard index uses) see
/// the whole input. Not a cryptographic hash and not stable across
/// releases; nothing may persist these values.
pub fn hash32(data: &[u8]) -> u32 {
    let mut h: u32 = data.len() as u32;

    let mut lumps = data.chunks_exact(4);
    for lump in lumps.by_ref() {
        // Unwrap cannot fail: chunks_exact yields 4-byte slices.
        h = h.wrapping_add(u32::from_le_bytes(lump.try_into().unwrap()));
        h ^= h << 9;
    }

    let tail = lumps.remainder();
    if !tail.is_empty() {
        let mut v: u32 = 0;
        for (i, &b) in tail.iter().enumerate() {
            v |= (b as u32) << (8 * i);
        }
        h = h.wrapping_add(v);
        h ^= h << 9;
    }

    // Avalanche.
    h ^= h >> 16;
    h ^= h >> 8;
    h ^= h >> 4;
    h
}

#[cfg(test)]
mod test {
    use super::hash32;

    #[test]
    fn test_deterministic() {
        let a = hash32(b"a84b4c76e66710@pc33.atlanta.example.com");
        let b = hash32(b"a84b4c76e66710@pc33.atlanta.example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinguishes_close_inputs() {
        assert_ne!(hash32(b"call-1@host"), hash32(b"call-2@host"));
        assert_ne!(hash32(b"abc"), hash32(b"abd"));
        assert_ne!(hash32(b"abc"), hash32(b"abcd"));
        assert_ne!(hash32(b""), hash32(b"\0"));
    }

    #[test]
    fn test_low_bits_spread() {
        // The shard index is hash % 65536; sequential call-ids must not
        // collapse into a handful of shards.
        let mut shards = std::collections::HashSet::new();
        for i in 0..1000 {
            let id = format!("cid-{i}@monitor.example.org");
            shards.insert(hash32(id.as_bytes()) % 65536);
        }
        assert!(shards.len() > 900, "only {} distinct shards", shards.len());
    }
}
