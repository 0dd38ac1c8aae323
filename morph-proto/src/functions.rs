/// Reversible byte-transform primitives used by the layered obfuscator.
///
/// Every primitive takes the input buffer, a key schedule of the same length
/// and the per-function initializer, and returns a freshly allocated buffer.
/// Primitives are stateless; `deobfuscate(obfuscate(x)) == x` holds for any
/// length including zero.

/// Signature shared by all obfuscation and deobfuscation functions.
pub type TransformFn = fn(&[u8], &[u8], &InitParam) -> Vec<u8>;

/// Per-function configuration carried alongside a function pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitParam {
    None,
    /// Forward byte map; must be a permutation of 0..=255.
    Substitution(Box<[u8; 256]>),
    /// Additive offset applied modulo 256.
    Offset(u8),
}

// ── Keyed / positional ───────────────────────────────────────────────

pub fn rotate_xor(input: &[u8], key: &[u8], _: &InitParam) -> Vec<u8> {
    let len = input.len();
    input
        .iter()
        .enumerate()
        .map(|(i, &b)| b.rotate_left((i % 8) as u32 + 1) ^ key[(i + len - 1) % len])
        .collect()
}

pub fn rotate_xor_inverse(input: &[u8], key: &[u8], _: &InitParam) -> Vec<u8> {
    let len = input.len();
    input
        .iter()
        .enumerate()
        .map(|(i, &b)| (b ^ key[(i + len - 1) % len]).rotate_right((i % 8) as u32 + 1))
        .collect()
}

/// XOR with the rolling key schedule. Self-inverse.
pub fn xor_with_key(input: &[u8], key: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().zip(key).map(|(b, k)| b ^ k).collect()
}

// ── Positional rearrangement ─────────────────────────────────────────

/// Swap each adjacent byte pair; an odd tail byte stays put. Self-inverse.
pub fn swap_neighbors(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    let mut out = input.to_vec();
    for pair in out.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    out
}

pub fn reverse_buffer(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().rev().copied().collect()
}

/// Swap the two halves of the buffer. For odd lengths the middle byte keeps
/// its position, which makes the transform its own inverse.
pub fn divide_and_swap(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    let len = input.len();
    let half = len / 2;
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&input[len - half..]);
    if len % 2 == 1 {
        out.push(input[half]);
    }
    out.extend_from_slice(&input[..half]);
    out
}

// ── Per-byte bit operations ──────────────────────────────────────────

pub fn rotate_left_1(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().map(|b| b.rotate_left(1)).collect()
}

pub fn rotate_right_1(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().map(|b| b.rotate_right(1)).collect()
}

pub fn bitwise_not(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().map(|b| !b).collect()
}

pub fn reverse_bits(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().map(|b| b.reverse_bits()).collect()
}

pub fn rotate_left_2(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().map(|b| b.rotate_left(2)).collect()
}

pub fn rotate_right_2(input: &[u8], _: &[u8], _: &InitParam) -> Vec<u8> {
    input.iter().map(|b| b.rotate_right(2)).collect()
}

// ── Initializer-driven ───────────────────────────────────────────────

/// Map every byte through the substitution table. Without a table the input
/// passes through unchanged.
pub fn substitute(input: &[u8], _: &[u8], init: &InitParam) -> Vec<u8> {
    match init {
        InitParam::Substitution(table) => input.iter().map(|&b| table[b as usize]).collect(),
        _ => input.to_vec(),
    }
}

pub fn substitute_inverse(input: &[u8], _: &[u8], init: &InitParam) -> Vec<u8> {
    match init {
        InitParam::Substitution(table) => {
            let inverse = invert_table(table);
            input.iter().map(|&b| inverse[b as usize]).collect()
        }
        _ => input.to_vec(),
    }
}

pub fn add_offset(input: &[u8], _: &[u8], init: &InitParam) -> Vec<u8> {
    let offset = match init {
        InitParam::Offset(v) => *v,
        _ => 0,
    };
    input.iter().map(|b| b.wrapping_add(offset)).collect()
}

pub fn sub_offset(input: &[u8], _: &[u8], init: &InitParam) -> Vec<u8> {
    let offset = match init {
        InitParam::Offset(v) => *v,
        _ => 0,
    };
    input.iter().map(|b| b.wrapping_sub(offset)).collect()
}

/// Build the inverse of a byte permutation.
pub fn invert_table(table: &[u8; 256]) -> [u8; 256] {
    let mut inverse = [0u8; 256];
    for (i, &v) in table.iter().enumerate() {
        inverse[v as usize] = i as u8;
    }
    inverse
}

/// True when `table` contains every byte value exactly once.
pub fn is_permutation(table: &[u8; 256]) -> bool {
    let mut seen = [false; 256];
    for &v in table.iter() {
        if seen[v as usize] {
            return false;
        }
        seen[v as usize] = true;
    }
    true
}
