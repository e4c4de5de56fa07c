use ledgerd_consensus::Hash256;
use ledgerd_primitives::block::{Block, BlockHeader};
use ledgerd_primitives::encoding::{Decoder, Encoder};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn push_hash_le(buffer: &mut Vec<u8>, start: u8) {
    for byte in 0u8..=0x1f {
        buffer.push(start.wrapping_add(byte));
    }
}

#[test]
fn serialize_block_header() {
    let header = BlockHeader {
        version: 4,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x01020304,
        bits: 0x0a0b0c0d,
        nonce: 0xdeadbeef,
    };

    let encoded = header.consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&4i32.to_le_bytes());
    push_hash_le(&mut expected, 0x00);
    push_hash_le(&mut expected, 0x20);
    expected.extend_from_slice(&0x01020304u32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b0c0du32.to_le_bytes());
    expected.extend_from_slice(&0xdeadbeefu32.to_le_bytes());

    assert_eq!(encoded.to_vec(), expected);
    let decoded = BlockHeader::consensus_decode(&encoded).expect("decode header");
    assert_eq!(decoded, header);
}

#[test]
fn serialize_transaction_layout() {
    let tx = Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint::new(seq_hash(0x40), 3),
            script_sig: vec![0x01, 0x02],
            sequence: 0xffff_fffe,
        }],
        vout: vec![TxOut {
            value: 5_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 77,
    };

    let encoded = tx.consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.push(1);
    push_hash_le(&mut expected, 0x40);
    expected.extend_from_slice(&3u32.to_le_bytes());
    expected.extend_from_slice(&[2, 0x01, 0x02]);
    expected.extend_from_slice(&0xffff_fffeu32.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&5_000i64.to_le_bytes());
    expected.extend_from_slice(&[1, 0x51]);
    expected.extend_from_slice(&77u32.to_le_bytes());
    assert_eq!(encoded, expected);

    let decoded = Transaction::consensus_decode(&encoded).expect("decode tx");
    assert_eq!(decoded, tx);
    assert_eq!(decoded.txid(), tx.txid());
}

#[test]
fn block_rejects_trailing_bytes() {
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1,
            bits: 0x207fffff,
            nonce: 0,
        },
        transactions: Vec::new(),
    };
    let mut encoded = block.consensus_encode();
    assert_eq!(Block::consensus_decode(&encoded).expect("decode"), block);
    encoded.push(0);
    assert!(Block::consensus_decode(&encoded).is_err());
}

#[test]
fn msb_varint_bit_patterns() {
    let cases: [(u64, &[u8]); 9] = [
        (0, &[0x00]),
        (0x7f, &[0x7f]),
        (0x80, &[0x80, 0x00]),
        (0x1234, &[0xa3, 0x34]),
        (0xffff, &[0x82, 0xfe, 0x7f]),
        (0x123456, &[0xc7, 0xe7, 0x56]),
        (0x8012_3456, &[0x86, 0xff, 0xc7, 0xe7, 0x56]),
        (0xffff_ffff, &[0x8e, 0xfe, 0xfe, 0xfe, 0x7f]),
        (
            u64::MAX,
            &[0x80, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0x7f],
        ),
    ];
    for (value, bytes) in cases {
        let mut encoder = Encoder::new();
        encoder.write_varint_msb(value);
        assert_eq!(encoder.into_inner(), bytes, "encoding {value:#x}");
        let mut decoder = Decoder::new(bytes);
        assert_eq!(decoder.read_varint_msb().expect("decode"), value);
        assert!(decoder.is_empty());
    }
}
