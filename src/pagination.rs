//! Partitioning of inclusive level ranges into pages.

use std::ops::RangeInclusive;

/// Split `range` into contiguous sub-ranges of at most `page_size` levels,
/// preserving order. An empty range yields no pages.
pub fn partition_ranges(page_size: i64, range: RangeInclusive<i64>) -> Vec<RangeInclusive<i64>> {
    assert!(page_size > 0, "page size must be positive");
    let (start, end) = (*range.start(), *range.end());
    if start > end {
        return Vec::new();
    }
    let mut pages = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let page_end = (cursor + page_size - 1).min(end);
        pages.push(cursor..=page_end);
        cursor = page_end + 1;
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_range_without_gaps() {
        let pages = partition_ranges(3, 1..=10);
        assert_eq!(pages, vec![1..=3, 4..=6, 7..=9, 10..=10]);

        let flattened: Vec<i64> = pages.into_iter().flatten().collect();
        assert_eq!(flattened, (1..=10).collect::<Vec<i64>>());
    }

    #[test]
    fn test_partition_page_size_bound() {
        for pages in partition_ranges(4, 0..=21) {
            assert!(pages.end() - pages.start() + 1 <= 4);
        }
    }

    #[test]
    fn test_partition_single_page() {
        assert_eq!(partition_ranges(100, 5..=7), vec![5..=7]);
    }

    #[test]
    fn test_partition_exact_multiple_has_no_empty_tail() {
        assert_eq!(partition_ranges(2, 1..=4), vec![1..=2, 3..=4]);
    }

    #[test]
    fn test_partition_empty_range() {
        assert!(partition_ranges(5, 3..=2).is_empty());
    }
}
