use ledgerd_consensus::{consensus_params, Network};
use ledgerd_pow::difficulty::{compact_to_target, hash_meets_target, target_to_compact};
use ledgerd_pow::{grind_nonce, validate_pow_header, PowError};
use ledgerd_primitives::block::BlockHeader;

#[test]
fn compact_to_target_roundtrip() {
    let bits = 0x1d00ffff;
    let target = compact_to_target(bits).expect("target");
    assert_eq!(target_to_compact(&target), bits);
}

#[test]
fn compact_target_layout() {
    let target = compact_to_target(0x207fffff).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    assert!(hash_meets_target(&[0x00u8; 32], &target));
    assert!(!hash_meets_target(&[0xffu8; 32], &target));
}

fn header(bits: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: [9u8; 32],
        merkle_root: [4u8; 32],
        time: 1_700_000_000,
        bits,
        nonce: 0,
    }
}

#[test]
fn regtest_headers_grind_quickly() {
    let params = consensus_params(Network::Regtest);
    let mut candidate = header(0x207fffff);
    assert!(grind_nonce(&mut candidate, &params, 10_000).expect("grind"));
    validate_pow_header(&candidate, &params).expect("ground header is valid");
}

#[test]
fn target_above_network_limit_is_rejected() {
    let params = consensus_params(Network::Mainnet);
    let candidate = header(0x207fffff);
    assert!(matches!(
        validate_pow_header(&candidate, &params),
        Err(PowError::InvalidBits(_))
    ));
    let zero = header(0);
    assert!(matches!(
        validate_pow_header(&zero, &params),
        Err(PowError::InvalidBits(_))
    ));
}
