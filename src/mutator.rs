//! AFL-family mutation stages over a fixed-width testcase buffer.
//!
//! A testcase's width is fixed by its contract's ABI layout (see
//! [crate::abi]), so unlike sFuzz's `Mutation.cpp` this crate drops the
//! length-changing havoc cases (byte deletion, chunk splice-resize):
//! every mutation here preserves `data.len()`, and the scheduler
//! renormalizes the result with [crate::abi::Layout::postprocess]
//! afterward so a flipped byte can never desynchronize a later slot's
//! offset. [splice] is the one stage that still changes length, by
//! design: it doubles the buffer so the fuzzer can replay it as two
//! sequential calls.

use rand::Rng;

use crate::r#const::{ARITH_MAX, EFF_MAP_SCALE2, EFF_MAX_PERC, HAVOC_STACK_POW2, INTERESTING_16, INTERESTING_32, INTERESTING_8, MAX_DET_EXTRAS, SPLICE_CYCLES};

/// Tracks which coarse byte-blocks of a testcase appear to influence
/// coverage, so the deterministic stages can skip blocks that don't.
/// Built once per testcase by [EffectorMap::probe], then reused across
/// every deterministic stage run against that testcase.
#[derive(Debug, Clone)]
pub struct EffectorMap {
    blocks: Vec<bool>,
}

impl EffectorMap {
    fn block_of(pos: usize) -> usize {
        pos >> EFF_MAP_SCALE2
    }

    fn block_count(len: usize) -> usize {
        (len >> EFF_MAP_SCALE2) + 1
    }

    /// Flip every byte in turn and ask `run` whether the coverage checksum
    /// changed; bytes whose flip never changes coverage are marked
    /// ineffective. If effective blocks cover more than [EFF_MAX_PERC] of
    /// the map, treat the whole buffer as effective (not worth tracking).
    pub fn probe(data: &[u8], mut run: impl FnMut(&[u8]) -> bool) -> Self {
        let mut blocks = vec![false; Self::block_count(data.len())];
        blocks[0] = true;
        if let Some(last) = Self::block_count(data.len()).checked_sub(1) {
            blocks[last] = true;
        }
        let mut buf = data.to_vec();
        for (i, block) in blocks.iter_mut().enumerate() {
            if *block {
                continue;
            }
            let start = i << EFF_MAP_SCALE2;
            let end = (start + (1 << EFF_MAP_SCALE2)).min(data.len());
            if start >= end {
                continue;
            }
            for b in &mut buf[start..end] {
                *b ^= 0xff;
            }
            if run(&buf) {
                *block = true;
            }
            for b in &mut buf[start..end] {
                *b ^= 0xff;
            }
        }
        let effective = blocks.iter().filter(|b| **b).count();
        if effective != blocks.len() && effective * 100 / blocks.len() > EFF_MAX_PERC {
            blocks.iter_mut().for_each(|b| *b = true);
        }
        EffectorMap { blocks }
    }

    /// An effector map that treats every byte as worth mutating; used when
    /// no prior coverage-probing run is available (e.g. the first pass
    /// over a freshly generated testcase).
    pub fn all_effective(len: usize) -> Self {
        EffectorMap { blocks: vec![true; Self::block_count(len)] }
    }

    pub fn is_effective(&self, pos: usize) -> bool {
        self.blocks.get(Self::block_of(pos)).copied().unwrap_or(true)
    }

    fn any_effective(&self, positions: &[usize]) -> bool {
        positions.iter().any(|&p| self.is_effective(p))
    }
}

fn could_be_bitflip(xor_val: u32) -> bool {
    if xor_val == 0 {
        return true;
    }
    let mut sh = 0;
    let mut v = xor_val;
    while v & 1 == 0 {
        v >>= 1;
        sh += 1;
    }
    if v == 1 {
        return true;
    }
    v <<= sh % 8;
    while v != 0 && v & 1 == 0 {
        v >>= 1;
    }
    v == 1
}

/// Run every deterministic stage (bitflip, arithmetic, interesting-value,
/// dictionary overlay) over `data`, feeding each candidate buffer to
/// `emit`. Mirrors sFuzz's `Mutation::singleWalkingBit` .. `overwriteWithDictionary`.
pub fn deterministic_stages(data: &[u8], eff: &EffectorMap, dict: &[Vec<u8>], mut emit: impl FnMut(&[u8])) {
    let len = data.len();
    let mut buf = data.to_vec();

    for bit in 0..len * 8 {
        buf[bit / 8] ^= 128 >> (bit % 8);
        emit(&buf);
        buf[bit / 8] ^= 128 >> (bit % 8);
    }

    if len >= 1 {
        for i in 0..len {
            if !eff.is_effective(i) {
                continue;
            }
            buf[i] ^= 0xff;
            emit(&buf);
            buf[i] ^= 0xff;
        }
    }
    for i in 0..len.saturating_sub(1) {
        if !eff.any_effective(&[i, i + 1]) {
            continue;
        }
        buf[i] ^= 0xff;
        buf[i + 1] ^= 0xff;
        emit(&buf);
        buf[i] ^= 0xff;
        buf[i + 1] ^= 0xff;
    }
    for i in 0..len.saturating_sub(3) {
        if !eff.any_effective(&[i, i + 1, i + 2, i + 3]) {
            continue;
        }
        for b in &mut buf[i..i + 4] {
            *b ^= 0xff;
        }
        emit(&buf);
        for b in &mut buf[i..i + 4] {
            *b ^= 0xff;
        }
    }

    for i in 0..len {
        if !eff.is_effective(i) {
            continue;
        }
        let orig = buf[i];
        for j in 1..=ARITH_MAX as i32 {
            for cand in [orig.wrapping_add(j as u8), orig.wrapping_sub(j as u8)] {
                if !could_be_bitflip((orig ^ cand) as u32) {
                    buf[i] = cand;
                    emit(&buf);
                }
            }
        }
        buf[i] = orig;
    }

    for i in 0..len {
        if !eff.is_effective(i) {
            continue;
        }
        let orig = buf[i];
        for &v in INTERESTING_8.iter() {
            let cand = v as u8;
            if could_be_bitflip((orig ^ cand) as u32) {
                continue;
            }
            buf[i] = cand;
            emit(&buf);
        }
        buf[i] = orig;
    }
    for i in 0..len.saturating_sub(1) {
        if !eff.any_effective(&[i, i + 1]) {
            continue;
        }
        let orig = u16::from_le_bytes([buf[i], buf[i + 1]]);
        for &v in INTERESTING_16.iter() {
            let cand = (v as u16).to_le_bytes();
            buf[i] = cand[0];
            buf[i + 1] = cand[1];
            emit(&buf);
        }
        let orig_bytes = orig.to_le_bytes();
        buf[i] = orig_bytes[0];
        buf[i + 1] = orig_bytes[1];
    }
    for i in 0..len.saturating_sub(3) {
        if !eff.any_effective(&[i, i + 1, i + 2, i + 3]) {
            continue;
        }
        let orig: [u8; 4] = buf[i..i + 4].try_into().unwrap();
        for &v in INTERESTING_32.iter() {
            buf[i..i + 4].copy_from_slice(&(v as u32).to_le_bytes());
            emit(&buf);
        }
        buf[i..i + 4].copy_from_slice(&orig);
    }

    let extras = if dict.len() > MAX_DET_EXTRAS { &dict[..MAX_DET_EXTRAS] } else { dict };
    for i in 0..len {
        for extra in extras {
            if extra.is_empty() || extra.len() > len - i || extra.as_slice() == &buf[i..i + extra.len()] {
                continue;
            }
            if !eff.any_effective(&(i..i + extra.len()).collect::<Vec<_>>()) {
                continue;
            }
            let saved: Vec<u8> = buf[i..i + extra.len()].to_vec();
            buf[i..i + extra.len()].copy_from_slice(extra);
            emit(&buf);
            buf[i..i + extra.len()].copy_from_slice(&saved);
        }
    }
}

/// One stacked round of random, length-preserving edits. Mirrors sFuzz's
/// `Mutation::havoc`, minus the byte-deletion and chunk-resize cases that
/// don't make sense against a fixed-width slot layout.
pub fn havoc(data: &[u8], dict: &[Vec<u8>], rng: &mut impl Rng) -> Vec<u8> {
    let mut buf = data.to_vec();
    if buf.is_empty() {
        return buf;
    }
    let stack = 1usize << (1 + rng.gen_range(0..HAVOC_STACK_POW2));
    for _ in 0..stack {
        let variant_count = if dict.is_empty() { 11 } else { 12 };
        match rng.gen_range(0..variant_count) {
            0 => {
                let pos = rng.gen_range(0..buf.len() * 8);
                buf[pos / 8] ^= 128 >> (pos % 8);
            }
            1 => {
                let pos = rng.gen_range(0..buf.len());
                buf[pos] = INTERESTING_8[rng.gen_range(0..INTERESTING_8.len())] as u8;
            }
            2 if buf.len() >= 2 => {
                let pos = rng.gen_range(0..buf.len() - 1);
                let v = INTERESTING_16[rng.gen_range(0..INTERESTING_16.len())] as u16;
                buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
            }
            3 if buf.len() >= 4 => {
                let pos = rng.gen_range(0..buf.len() - 3);
                let v = INTERESTING_32[rng.gen_range(0..INTERESTING_32.len())] as u32;
                buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
            }
            4 => {
                let pos = rng.gen_range(0..buf.len());
                buf[pos] = buf[pos].wrapping_sub(1 + rng.gen_range(0..ARITH_MAX) as u8);
            }
            5 => {
                let pos = rng.gen_range(0..buf.len());
                buf[pos] = buf[pos].wrapping_add(1 + rng.gen_range(0..ARITH_MAX) as u8);
            }
            6 if buf.len() >= 2 => {
                let pos = rng.gen_range(0..buf.len() - 1);
                let v = u16::from_le_bytes([buf[pos], buf[pos + 1]]).wrapping_sub(1 + rng.gen_range(0..ARITH_MAX) as u16);
                buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
            }
            7 if buf.len() >= 2 => {
                let pos = rng.gen_range(0..buf.len() - 1);
                let v = u16::from_le_bytes([buf[pos], buf[pos + 1]]).wrapping_add(1 + rng.gen_range(0..ARITH_MAX) as u16);
                buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
            }
            8 => {
                let pos = rng.gen_range(0..buf.len());
                buf[pos] ^= 1 + rng.gen_range(0..255u16) as u8;
            }
            9 if buf.len() >= 2 => {
                let copy_len = rng.gen_range(1..=(buf.len() / 2).max(1));
                let from = rng.gen_range(0..=(buf.len() - copy_len));
                let to = rng.gen_range(0..=(buf.len() - copy_len));
                if from != to {
                    let chunk: Vec<u8> = buf[from..from + copy_len].to_vec();
                    buf[to..to + copy_len].copy_from_slice(&chunk);
                }
            }
            10 => {
                let pos = rng.gen_range(0..buf.len());
                let len = rng.gen_range(1..=(buf.len() - pos).min(32));
                let fill = if rng.gen_bool(0.5) { rng.gen::<u8>() } else { buf[rng.gen_range(0..buf.len())] };
                for b in &mut buf[pos..pos + len] {
                    *b = fill;
                }
            }
            _ => {
                let extra = &dict[rng.gen_range(0..dict.len())];
                if extra.len() <= buf.len() {
                    let pos = rng.gen_range(0..=(buf.len() - extra.len()));
                    buf[pos..pos + extra.len()].copy_from_slice(extra);
                }
            }
        }
    }
    buf
}

/// Locate the first and last byte position where `a` and `b` disagree,
/// scanning only the shared `min(a.len(), b.len())` prefix.
fn locate_diffs(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    let min_len = a.len().min(b.len());
    let first = (0..min_len).find(|&i| a[i] != b[i])?;
    let last = (0..min_len).rev().find(|&i| a[i] != b[i])?;
    Some((first, last))
}

/// Splice `data` against a partner drawn from `candidates`, producing
/// `partner || data`, each half zero-padded up to `max(|partner|, |data|)`.
/// Mirrors sFuzz's `Mutation::splice` (`libfuzzer/Mutation.cpp`): tries up
/// to [SPLICE_CYCLES] random candidates, skipping ones identical to `data`
/// or whose first/last differing byte don't bracket a usable cut. Returns
/// `None` if every candidate is identical to `data` or no cycle finds a
/// usable one.
pub fn splice(data: &[u8], candidates: &[Vec<u8>], rng: &mut impl Rng) -> Option<Vec<u8>> {
    let distinct: Vec<&Vec<u8>> = candidates.iter().filter(|c| c.as_slice() != data).collect();
    if distinct.is_empty() {
        return None;
    }
    for _ in 0..SPLICE_CYCLES {
        let partner = distinct[rng.gen_range(0..distinct.len())];
        let Some((first_diff, last_diff)) = locate_diffs(data, partner) else {
            continue;
        };
        if last_diff < 2 || first_diff == last_diff {
            continue;
        }
        let max_len = data.len().max(partner.len());
        let mut out = vec![0u8; 2 * max_len];
        out[..partner.len()].copy_from_slice(partner);
        out[max_len..max_len + data.len()].copy_from_slice(data);
        return Some(out);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_effector_map_all_effective_everywhere() {
        let map = EffectorMap::all_effective(40);
        assert!(map.is_effective(0));
        assert!(map.is_effective(39));
    }

    #[test]
    fn test_deterministic_stages_preserve_length() {
        let data = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let eff = EffectorMap::all_effective(data.len());
        let mut max_len = 0;
        deterministic_stages(&data, &eff, &[], |buf| max_len = max_len.max(buf.len()));
        assert_eq!(max_len, data.len());
    }

    #[test]
    fn test_havoc_preserves_length() {
        let data = vec![0u8; 64];
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let out = havoc(&data, &[vec![0xde, 0xad]], &mut rng);
            assert_eq!(out.len(), data.len());
        }
    }

    #[test]
    fn test_splice_no_distinct_candidates_returns_none() {
        let data = vec![1u8; 16];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(splice(&data, &[data.clone()], &mut rng).is_none());
    }

    #[test]
    fn test_splice_doubles_length_as_partner_then_self() {
        let a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        b[4] = 9;
        b[10] = 3;
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let spliced = splice(&a, &[b.clone()], &mut rng).unwrap();
        assert_eq!(spliced.len(), 32);
        assert_eq!(&spliced[..16], b.as_slice());
        assert_eq!(&spliced[16..], a.as_slice());
    }

    #[test]
    fn test_splice_rejects_candidate_differing_by_one_byte() {
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        a[5] = 1;
        b[5] = 2;
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(splice(&a, &[b], &mut rng).is_none());
    }
}
