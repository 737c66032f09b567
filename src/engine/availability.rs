use crate::model::*;

// ── Display buckets ──────────────────────────────────────────────

/// One-hour buckets `[h, h+1)` for `open_hour <= h < close_hour`.
pub fn hour_buckets(open_hour: u32, close_hour: u32) -> Vec<Span> {
    (open_hour..close_hour.min(24))
        .map(|h| {
            let start = h as Ms * HOUR_MS;
            Span::new(start, start + HOUR_MS)
        })
        .collect()
}

/// Active load of every bucket. A bucket is full when the number of active
/// reservations overlapping it reaches `capacity`. This is a display
/// approximation; admission always counts against exact intervals.
pub fn bucket_loads(partition: Option<&Partition>, buckets: &[Span], capacity: u32) -> Vec<BucketInfo> {
    buckets
        .iter()
        .map(|&span| {
            let active = partition.map_or(0, |p| p.active_overlap_count(&span));
            BucketInfo {
                span,
                active,
                capacity,
                full: active >= capacity,
            }
        })
        .collect()
}

pub fn full_buckets(partition: Option<&Partition>, buckets: &[Span], capacity: u32) -> Vec<Span> {
    bucket_loads(partition, buckets, capacity)
        .into_iter()
        .filter(|b| b.full)
        .map(|b| b.span)
        .collect()
}
