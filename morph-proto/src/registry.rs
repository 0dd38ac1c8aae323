//! Ordered set of obfuscation function pairs plus the precomputed
//! ordered-selection tables used to turn a combo index into a layer list.

use crate::error::{Error, Result};
use crate::functions::{self, InitParam, TransformFn};
use crate::obfuscator::FunctionInitializer;
use std::sync::Arc;

/// Keeps any combo index representable in two header bytes.
pub const MAX_FUNCTIONS: usize = 17;
pub const MAX_LAYERS: u8 = 4;

#[derive(Debug, Clone)]
pub struct FunctionPair {
    pub obfuscate: TransformFn,
    pub deobfuscate: TransformFn,
    pub init: InitParam,
    pub index: usize,
}

/// All ordered selections without repetition of 1..=4 indices out of `n`.
///
/// Stored flat: entry `i` of layer `L` is `rows[L-1][i*L..(i+1)*L]`.
#[derive(Debug)]
pub struct PermutationTables {
    functions: usize,
    rows: [Vec<u8>; MAX_LAYERS as usize],
}

impl PermutationTables {
    pub fn build(functions: usize) -> Self {
        let rows = [1u8, 2, 3, 4].map(|layer| permutations(functions, layer as usize));
        Self { functions, rows }
    }

    pub fn function_count(&self) -> usize {
        self.functions
    }

    pub fn table(&self, layer: u8) -> Result<PermutationTable<'_>> {
        if layer == 0 || layer > MAX_LAYERS {
            return Err(Error::InvalidLayer(layer));
        }
        Ok(PermutationTable {
            layer: layer as usize,
            flat: &self.rows[layer as usize - 1],
        })
    }
}

/// Borrowed view of one layer's selection table.
#[derive(Debug, Clone, Copy)]
pub struct PermutationTable<'a> {
    layer: usize,
    flat: &'a [u8],
}

impl<'a> PermutationTable<'a> {
    pub fn len(&self) -> usize {
        self.flat.len() / self.layer
    }

    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a [u8]> {
        let start = index.checked_mul(self.layer)?;
        self.flat.get(start..start + self.layer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.flat.chunks_exact(self.layer)
    }
}

/// Recursive extension in index order: [0,1], [0,2], ..., [1,0], [1,2], ...
fn permutations(n: usize, length: usize) -> Vec<u8> {
    fn extend(current: &mut Vec<u8>, remaining: &[u8], length: usize, out: &mut Vec<u8>) {
        if current.len() == length {
            out.extend_from_slice(current);
            return;
        }
        for (i, &next) in remaining.iter().enumerate() {
            let rest: Vec<u8> = remaining
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &v)| v)
                .collect();
            current.push(next);
            extend(current, &rest, length, out);
            current.pop();
        }
    }

    let mut out = Vec::new();
    if length > n {
        return out;
    }
    let options: Vec<u8> = (0..n as u8).collect();
    extend(&mut Vec::with_capacity(length), &options, length, &mut out);
    out
}

#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    pairs: Vec<FunctionPair>,
    tables: Arc<PermutationTables>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            pairs: Vec::new(),
            tables: Arc::new(PermutationTables::build(0)),
        }
    }

    /// The eleven standard primitives, configured from `init`.
    pub fn standard(init: &FunctionInitializer) -> Self {
        let mut registry = Self::new();
        registry.push_standard(init);
        registry.tables = Arc::new(PermutationTables::build(registry.pairs.len()));
        registry
    }

    /// Like [`standard`](Self::standard), reusing tables built once for
    /// [`STANDARD_FUNCTIONS`] pairs.
    pub fn standard_with_tables(init: &FunctionInitializer, tables: Arc<PermutationTables>) -> Self {
        let mut registry = Self::new();
        registry.push_standard(init);
        registry.tables = if tables.function_count() == registry.pairs.len() {
            tables
        } else {
            Arc::new(PermutationTables::build(registry.pairs.len()))
        };
        registry
    }

    fn push_standard(&mut self, init: &FunctionInitializer) {
        let standard: [(TransformFn, TransformFn, InitParam); STANDARD_FUNCTIONS] = [
            (functions::rotate_xor, functions::rotate_xor_inverse, InitParam::None),
            (functions::swap_neighbors, functions::swap_neighbors, InitParam::None),
            (functions::reverse_buffer, functions::reverse_buffer, InitParam::None),
            (functions::divide_and_swap, functions::divide_and_swap, InitParam::None),
            (functions::rotate_left_1, functions::rotate_right_1, InitParam::None),
            (functions::xor_with_key, functions::xor_with_key, InitParam::None),
            (functions::bitwise_not, functions::bitwise_not, InitParam::None),
            (functions::reverse_bits, functions::reverse_bits, InitParam::None),
            (functions::rotate_left_2, functions::rotate_right_2, InitParam::None),
            (
                functions::substitute,
                functions::substitute_inverse,
                InitParam::Substitution(init.substitution_table.clone()),
            ),
            (functions::add_offset, functions::sub_offset, InitParam::Offset(init.random_offset)),
        ];
        for (obfuscate, deobfuscate, init) in standard {
            let index = self.pairs.len();
            self.pairs.push(FunctionPair { obfuscate, deobfuscate, init, index });
        }
    }

    /// Append a pair; the selection tables are rebuilt for the new count.
    pub fn add_function_pair(
        &mut self,
        obfuscate: TransformFn,
        deobfuscate: TransformFn,
        init: InitParam,
    ) -> Result<usize> {
        let index = self.pairs.len();
        if index >= MAX_FUNCTIONS {
            return Err(Error::CapacityExceeded { max: MAX_FUNCTIONS });
        }
        self.pairs.push(FunctionPair { obfuscate, deobfuscate, init, index });
        self.tables = Arc::new(PermutationTables::build(self.pairs.len()));
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pair(&self, index: usize) -> Option<&FunctionPair> {
        self.pairs.get(index)
    }

    pub fn permutation_table(&self, layer: u8) -> Result<PermutationTable<'_>> {
        self.tables.table(layer)
    }
}

pub const STANDARD_FUNCTIONS: usize = 11;
