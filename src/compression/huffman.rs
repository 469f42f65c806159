//! Huffman codec
//!
//! A self-describing stream: the byte frequency table travels with the
//! data and both sides rebuild the same code tree from it. Used as the
//! second stage after ADPCM for WAVE payloads.

use crate::{Error, Result};

const FREQ_TABLE_SIZE: usize = 256 * 4;
const HEADER_SIZE: usize = FREQ_TABLE_SIZE + 4;

#[derive(Debug, Clone, Copy)]
enum Node {
    Leaf(u8),
    Branch { zero: usize, one: usize },
}

/// Build the code tree from a frequency table
///
/// Node selection is fully deterministic (lowest weight, then lowest
/// insertion id) so the encoder and decoder always agree on the tree.
fn build_tree(freq: &[u32; 256]) -> Option<(Vec<Node>, usize)> {
    let mut nodes: Vec<Node> = Vec::new();
    // (weight, node id); id doubles as the tie breaker
    let mut live: Vec<(u64, usize)> = Vec::new();

    for (byte, &count) in freq.iter().enumerate() {
        if count > 0 {
            nodes.push(Node::Leaf(byte as u8));
            live.push((count as u64, nodes.len() - 1));
        }
    }

    match live.len() {
        0 => return None,
        1 => return Some((nodes, live[0].1)),
        _ => {}
    }

    while live.len() > 1 {
        let mut first = 0;
        let mut second = 1;
        if live[second] < live[first] {
            std::mem::swap(&mut first, &mut second);
        }
        for i in 2..live.len() {
            if live[i] < live[first] {
                second = first;
                first = i;
            } else if live[i] < live[second] {
                second = i;
            }
        }

        let (w0, n0) = live[first];
        let (w1, n1) = live[second];
        nodes.push(Node::Branch { zero: n0, one: n1 });
        let merged = (w0 + w1, nodes.len() - 1);

        // Remove the higher index first so the lower stays valid
        let (hi, lo) = if first > second {
            (first, second)
        } else {
            (second, first)
        };
        live.swap_remove(hi);
        live.swap_remove(lo);
        live.push(merged);
    }

    let root = live[0].1;
    Some((nodes, root))
}

fn collect_codes(nodes: &[Node], node: usize, prefix: &mut Vec<bool>, codes: &mut [Vec<bool>; 256]) {
    match nodes[node] {
        Node::Leaf(byte) => {
            codes[byte as usize] = prefix.clone();
        }
        Node::Branch { zero, one } => {
            prefix.push(false);
            collect_codes(nodes, zero, prefix, codes);
            prefix.pop();
            prefix.push(true);
            collect_codes(nodes, one, prefix, codes);
            prefix.pop();
        }
    }
}

pub(super) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut freq = [0u32; 256];
    for &b in data {
        freq[b as usize] += 1;
    }

    let mut output = Vec::with_capacity(HEADER_SIZE + data.len() / 2);
    for &f in &freq {
        output.extend_from_slice(&f.to_le_bytes());
    }
    output.extend_from_slice(&(data.len() as u32).to_le_bytes());

    let Some((nodes, root)) = build_tree(&freq) else {
        return Ok(output);
    };

    // A single distinct byte value has a zero-length code; the length
    // field alone reconstructs such streams.
    if matches!(nodes[root], Node::Leaf(_)) {
        return Ok(output);
    }

    const EMPTY: Vec<bool> = Vec::new();
    let mut codes: [Vec<bool>; 256] = [EMPTY; 256];
    collect_codes(&nodes, root, &mut Vec::new(), &mut codes);

    let mut current = 0u8;
    let mut used = 0u32;
    for &b in data {
        for &bit in &codes[b as usize] {
            if bit {
                current |= 1 << used;
            }
            used += 1;
            if used == 8 {
                output.push(current);
                current = 0;
                used = 0;
            }
        }
    }
    if used > 0 {
        output.push(current);
    }

    Ok(output)
}

pub(super) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if data.len() < HEADER_SIZE {
        return Err(Error::compression("huffman data too short"));
    }

    let mut freq = [0u32; 256];
    for (i, f) in freq.iter_mut().enumerate() {
        let at = i * 4;
        *f = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    }
    let length = u32::from_le_bytes([
        data[FREQ_TABLE_SIZE],
        data[FREQ_TABLE_SIZE + 1],
        data[FREQ_TABLE_SIZE + 2],
        data[FREQ_TABLE_SIZE + 3],
    ]) as usize;

    if length == 0 {
        return Ok(Vec::new());
    }
    let Some((nodes, root)) = build_tree(&freq) else {
        return Err(Error::compression("huffman frequency table is empty"));
    };

    let mut output = Vec::with_capacity(length.max(expected_size));

    if let Node::Leaf(byte) = nodes[root] {
        output.resize(length, byte);
        return Ok(output);
    }

    let payload = &data[HEADER_SIZE..];
    let mut bit_pos = 0usize;
    for _ in 0..length {
        let mut node = root;
        loop {
            match nodes[node] {
                Node::Leaf(byte) => {
                    output.push(byte);
                    break;
                }
                Node::Branch { zero, one } => {
                    let byte_idx = bit_pos / 8;
                    if byte_idx >= payload.len() {
                        return Err(Error::compression("huffman stream truncated"));
                    }
                    let bit = payload[byte_idx] >> (bit_pos % 8) & 1;
                    bit_pos += 1;
                    node = if bit == 1 { one } else { zero };
                }
            }
        }
    }

    Ok(output)
}
