//! Property-Based Tests for the Fragment Codec
//!
//! Uses proptest to check the XOR codec against every built-in scheme.
//!
//! # Test Properties
//!
//! 1. **Roundtrip Correctness**: decode(encode(block)) = block
//! 2. **Covering Subsets**: any present set the map deems fixable decodes
//! 3. **Determinism**: Same input always produces same output
//! 4. **Honest Failure**: sets the map deems unfixable are reported unrecoverable

#![cfg(test)]

use bytes::Bytes;
use proptest::prelude::*;

use super::codec::{join, CodecError, FragmentCodec};
use super::eccmap::lookup;

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for the smaller built-in schemes.
fn small_map_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["ecc/2x2", "ecc/4x4", "ecc/7x7", "ecc/13x13"])
}

/// Strategy for every built-in scheme.
fn any_map_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "ecc/2x2",
        "ecc/4x4",
        "ecc/7x7",
        "ecc/13x13",
        "ecc/18x18",
        "ecc/26x26",
        "ecc/64x64",
    ])
}

/// Strategy for block contents.
fn block_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..2000)
}

/// Strategy for a presence mask over `D + P` fragments.
fn mask_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 128)
}

fn apply_mask(fragments: &[Bytes], mask: &[bool]) -> Vec<Option<Bytes>> {
    fragments
        .iter()
        .zip(mask)
        .map(|(f, &keep)| keep.then(|| f.clone()))
        .collect()
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: Encoding then decoding without any losses returns the original block.
    #[test]
    fn prop_roundtrip_no_loss(name in any_map_strategy(), block in block_strategy()) {
        let codec = FragmentCodec::new(lookup(name)?);
        let fragment_size = codec.fragment_size_for(block.len());
        let encoded = codec.encode(&block, fragment_size)?;

        let data = encoded.data.iter().cloned().map(Some).collect();
        let parity = encoded.parity.iter().cloned().map(Some).collect();
        let recovered = codec.decode(data, parity)?;

        let joined = join(&recovered, block.len());
        prop_assert_eq!(joined.as_ref(), block.as_slice());
    }

    /// Property: Any fixable subset decodes; any unfixable subset is reported.
    #[test]
    fn prop_any_erasure_pattern(
        name in small_map_strategy(),
        block in block_strategy(),
        mask in mask_strategy(),
    ) {
        let map = lookup(name)?;
        let codec = FragmentCodec::new(map.clone());
        let d = map.data_fragments();
        let fragment_size = codec.fragment_size_for(block.len());
        let encoded = codec.encode(&block, fragment_size)?;

        let data_mask = &mask[..d];
        let parity_mask = &mask[d..d + map.parity_fragments()];
        let data = apply_mask(&encoded.data, data_mask);
        let parity = apply_mask(&encoded.parity, parity_mask);

        match codec.decode(data, parity) {
            Ok(recovered) => {
                prop_assert!(map.is_fixable(data_mask, parity_mask));
                prop_assert_eq!(recovered, encoded.data);
            }
            Err(CodecError::Unrecoverable { missing }) => {
                prop_assert!(!map.is_fixable(data_mask, parity_mask));
                prop_assert_eq!(missing, map.unrecoverable_data(data_mask, parity_mask));
            }
            Err(e) => prop_assert!(false, "unexpected error {}", e),
        }
    }

    /// Property: Losing a run of data fragments with all parities present agrees with the map.
    #[test]
    fn prop_correctable_data_losses(
        name in small_map_strategy(),
        block in block_strategy(),
        seed in any::<u64>(),
    ) {
        let map = lookup(name)?;
        let codec = FragmentCodec::new(map.clone());
        let d = map.data_fragments();
        let fragment_size = codec.fragment_size_for(block.len());
        let encoded = codec.encode(&block, fragment_size)?;

        let losses = map.correctable_errors().min(d);
        let mut data: Vec<Option<Bytes>> = encoded.data.iter().cloned().map(Some).collect();
        let start = (seed % d as u64) as usize;
        for k in 0..losses {
            data[(start + k) % d] = None;
        }
        let data_mask: Vec<bool> = data.iter().map(Option::is_some).collect();
        let parity = encoded.parity.iter().cloned().map(Some).collect();

        if map.is_fixable(&data_mask, &vec![true; map.parity_fragments()]) {
            prop_assert_eq!(codec.decode(data, parity)?, encoded.data);
        } else {
            let is_unrecoverable = matches!(
                codec.decode(data, parity),
                Err(CodecError::Unrecoverable { .. })
            );
            prop_assert!(is_unrecoverable);
        }
    }
}

// =============================================================================
// Determinism Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: Encode is byte-for-byte deterministic.
    #[test]
    fn prop_encode_deterministic(name in any_map_strategy(), block in block_strategy()) {
        let codec = FragmentCodec::new(lookup(name)?);
        let fragment_size = codec.fragment_size_for(block.len());
        let first = codec.encode(&block, fragment_size)?;
        let second = codec.encode(&block, fragment_size)?;
        prop_assert_eq!(first, second);
    }

    /// Property: Every fragment has exactly the requested size.
    #[test]
    fn prop_fragment_sizes_uniform(name in small_map_strategy(), block in block_strategy()) {
        let codec = FragmentCodec::new(lookup(name)?);
        let fragment_size = codec.fragment_size_for(block.len());
        let encoded = codec.encode(&block, fragment_size)?;
        for fragment in encoded.data.iter().chain(&encoded.parity) {
            prop_assert_eq!(fragment.len(), fragment_size);
        }
    }
}
