/// One layer's K and V cache tensors, shaped conceptually as
/// `[n_blocks, block_size, n_local_kv_heads, head_dim]` (§3). Stored as flat
/// buffers; real kernels would index these directly, we expose slot-level
/// read/write/copy so the surrounding paging logic can be tested without a
/// device.
#[derive(Debug, Clone)]
pub struct LayerKvCache {
    pub n_blocks: usize,
    pub block_size: usize,
    pub n_local_kv_heads: usize,
    pub head_dim: usize,
    k: Vec<f32>,
    v: Vec<f32>,
}

impl LayerKvCache {
    pub fn new(n_blocks: usize, block_size: usize, n_local_kv_heads: usize, head_dim: usize) -> Self {
        let len = n_blocks * block_size * n_local_kv_heads * head_dim;
        Self {
            n_blocks,
            block_size,
            n_local_kv_heads,
            head_dim,
            k: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    fn slot_len(&self) -> usize {
        self.n_local_kv_heads * self.head_dim
    }

    fn slot_range(&self, physical_slot: usize) -> std::ops::Range<usize> {
        let start = physical_slot * self.slot_len();
        start..start + self.slot_len()
    }

    /// Writes one token's K/V vectors into the slot `block_id * block_size +
    /// offset`, as used by the append-KV kernel driven from `slot_mapping`.
    pub fn write_slot(&mut self, physical_slot: usize, key: &[f32], value: &[f32]) {
        let range = self.slot_range(physical_slot);
        self.k[range.clone()].copy_from_slice(key);
        self.v[range].copy_from_slice(value);
    }

    pub fn read_slot(&self, physical_slot: usize) -> (&[f32], &[f32]) {
        let range = self.slot_range(physical_slot);
        (&self.k[range.clone()], &self.v[range])
    }

    /// Worker-mediated block-copy op used by copy-on-write: copies every
    /// occupied slot of `src_block` into `dst_block`.
    pub fn copy_block(&mut self, src_block: usize, dst_block: usize) {
        if src_block == dst_block {
            return;
        }
        let slot_len = self.slot_len();
        let src_start = src_block * self.block_size * slot_len;
        let dst_start = dst_block * self.block_size * slot_len;
        let len = self.block_size * slot_len;
        // `[T]::copy_within` handles the disjoint-range memmove safely (and
        // would even cope with overlap, which can't happen here since
        // src_block != dst_block), so there's no need to reach for unsafe.
        self.k.copy_within(src_start..src_start + len, dst_start);
        self.v.copy_within(src_start..src_start + len, dst_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_slot_round_trip() {
        let mut cache = LayerKvCache::new(4, 2, 1, 3);
        cache.write_slot(5, &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        let (k, v) = cache.read_slot(5);
        assert_eq!(k, &[1.0, 2.0, 3.0]);
        assert_eq!(v, &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn copy_block_duplicates_all_slots() {
        let mut cache = LayerKvCache::new(4, 2, 1, 2);
        // block 1 spans slots [2, 3]
        cache.write_slot(2, &[1.0, 1.0], &[2.0, 2.0]);
        cache.write_slot(3, &[3.0, 3.0], &[4.0, 4.0]);
        cache.copy_block(1, 2);
        let (k, v) = cache.read_slot(4);
        assert_eq!(k, &[1.0, 1.0]);
        assert_eq!(v, &[2.0, 2.0]);
        let (k, v) = cache.read_slot(5);
        assert_eq!(k, &[3.0, 3.0]);
        assert_eq!(v, &[4.0, 4.0]);
    }
}
