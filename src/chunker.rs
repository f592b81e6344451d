//! 把文件字节区间切成固定大小的分片

use crate::core::ChunkDescriptor;

/// 计算分片信息
///
/// `total_bytes <= chunk_size`（包括空文件）时只返回一个分片。
/// `chunk_size` 为 0 时按 1 处理。
pub fn split(total_bytes: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    let chunk_size = chunk_size.max(1);
    if total_bytes <= chunk_size {
        return vec![ChunkDescriptor::new(0, 0, total_bytes)];
    }

    let mut chunks = Vec::with_capacity(chunk_count(total_bytes, chunk_size));
    let mut offset = 0;
    let mut index = 0;

    while offset < total_bytes {
        let end = std::cmp::min(offset + chunk_size, total_bytes);
        chunks.push(ChunkDescriptor::new(index, offset, end));
        offset = end;
        index += 1;
    }

    chunks
}

/// 分片数量，不分配内存
pub fn chunk_count(total_bytes: u64, chunk_size: u64) -> usize {
    let chunk_size = chunk_size.max(1);
    if total_bytes <= chunk_size {
        return 1;
    }
    total_bytes.div_ceil(chunk_size) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(chunks: &[ChunkDescriptor], total_bytes: u64, chunk_size: u64) {
        let mut expected_start = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.start, expected_start, "gap or overlap before chunk {i}");
            if i + 1 < chunks.len() {
                assert_eq!(chunk.len(), chunk_size);
            } else {
                assert!(chunk.len() <= chunk_size.max(1));
            }
            expected_start = chunk.end;
        }
        assert_eq!(expected_start, total_bytes);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<u64>(), total_bytes);
    }

    #[test]
    fn test_exact_multiple() {
        let mib = 1024 * 1024;
        let chunks = split(5 * mib, mib);
        assert_eq!(chunks.len(), 5);
        assert_covers(&chunks, 5 * mib, mib);
    }

    #[test]
    fn test_last_chunk_shorter() {
        let chunks = split(10_001, 1000);
        assert_eq!(chunks.len(), 11);
        assert_eq!(chunks.last().unwrap().len(), 1);
        assert_covers(&chunks, 10_001, 1000);
    }

    #[test]
    fn test_small_file_single_chunk() {
        let chunks = split(500, 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 500));

        let chunks = split(1024, 1024);
        assert_eq!(chunks.len(), 1);

        let chunks = split(0, 1024);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn test_arbitrary_sizes_reconstruct_range() {
        for total in [1u64, 7, 999, 1000, 1001, 65_537, 3 * 1024 * 1024 + 17] {
            for size in [1u64, 3, 512, 1000, 4096, 1024 * 1024] {
                if total / size > 100_000 {
                    continue;
                }
                let chunks = split(total, size);
                assert_eq!(chunks.len(), chunk_count(total, size));
                assert_covers(&chunks, total, size);

                // 按序拼接各分片覆盖的字节，应当恰好还原 [0, total)
                let data: Vec<u64> = (0..total.min(5000)).collect();
                let rebuilt: Vec<u64> = chunks
                    .iter()
                    .flat_map(|c| c.start..c.end)
                    .take(data.len())
                    .collect();
                assert_eq!(rebuilt, data);
            }
        }
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let chunks = split(3, 0);
        assert_eq!(chunks.len(), 3);
        assert_covers(&chunks, 3, 1);
    }
}
