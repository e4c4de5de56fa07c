//! Legacy signature-operation counting.

use ledgerd_primitives::transaction::Transaction;

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Counts CHECKSIG-family opcodes, charging 20 per multisig. Stops at the
/// first truncated push, counting what was seen so far.
pub fn legacy_sigops(script: &[u8]) -> usize {
    let mut count = 0usize;
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let push_len = match opcode {
            0x01..=0x4b => Some(opcode as usize),
            OP_PUSHDATA1 => read_len::<1>(script, &mut cursor),
            OP_PUSHDATA2 => read_len::<2>(script, &mut cursor),
            OP_PUSHDATA4 => read_len::<4>(script, &mut cursor),
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                count += 1;
                None
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += 20;
                None
            }
            _ => None,
        };
        if let Some(len) = push_len {
            if cursor + len > script.len() {
                break;
            }
            cursor += len;
        } else if matches!(opcode, OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4) {
            break;
        }
    }
    count
}

fn read_len<const N: usize>(script: &[u8], cursor: &mut usize) -> Option<usize> {
    let bytes = script.get(*cursor..*cursor + N)?;
    *cursor += N;
    let mut buf = [0u8; 4];
    buf[..N].copy_from_slice(bytes);
    Some(u32::from_le_bytes(buf) as usize)
}

pub fn transaction_sigops(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .vin
        .iter()
        .map(|input| legacy_sigops(&input.script_sig))
        .sum();
    let outputs: usize = tx
        .vout
        .iter()
        .map(|output| legacy_sigops(&output.script_pubkey))
        .sum();
    inputs + outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_checksig_family() {
        let p2pkh = [
            &[0x76, 0xa9, 0x14][..],
            &[0u8; 20][..],
            &[0x88, OP_CHECKSIG][..],
        ]
        .concat();
        assert_eq!(legacy_sigops(&p2pkh), 1);
        assert_eq!(legacy_sigops(&[0x52, OP_CHECKMULTISIG]), 20);
        assert_eq!(legacy_sigops(&[OP_CHECKSIGVERIFY, OP_CHECKSIG]), 2);
    }

    #[test]
    fn pushed_bytes_are_not_opcodes() {
        assert_eq!(legacy_sigops(&[0x02, OP_CHECKSIG, OP_CHECKSIG]), 0);
        assert_eq!(legacy_sigops(&[OP_PUSHDATA1, 0x01, OP_CHECKSIG, OP_CHECKSIG]), 1);
        assert_eq!(legacy_sigops(&[OP_CHECKSIG, OP_PUSHDATA2, 0x05]), 1);
    }
}
