use crate::model::*;

// ── Interval algebra over sorted span lists ───────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Sort then merge. For inputs assembled from several sources.
pub fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| (s.start, s.end));
    merge_overlapping(&spans)
}

/// `base − to_remove`. Both inputs sorted by start; `to_remove` may overlap
/// itself.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Keep the parts of `spans` inside `bounds`.
pub fn clamp_all(spans: &[Span], bounds: &Span) -> Vec<Span> {
    spans.iter().filter_map(|s| s.clamp(bounds)).collect()
}

/// True if some span in the sorted, disjoint list fully contains `target`.
pub fn covers(sorted: &[Span], target: &Span) -> bool {
    let idx = sorted.partition_point(|s| s.end < target.end);
    sorted
        .get(idx)
        .is_some_and(|s| s.contains_span(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        let base = vec![Span::new(100, 200)];
        assert_eq!(
            subtract_intervals(&base, &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&base, &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn subtract_one_removal_spanning_two_windows() {
        let base = vec![Span::new(0, 100), Span::new(200, 300)];
        let remove = vec![Span::new(50, 250)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(0, 50), Span::new(250, 300)]
        );
    }

    #[test]
    fn subtract_overlapping_removals() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 400), Span::new(200, 300), Span::new(350, 500)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(0, 100), Span::new(500, 1000)]
        );
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(400, 450), Span::new(500, 600)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 450), Span::new(500, 600)]
        );
    }

    #[test]
    fn normalize_sorts_first() {
        let spans = vec![Span::new(500, 600), Span::new(100, 200), Span::new(150, 300)];
        assert_eq!(normalize(spans), vec![Span::new(100, 300), Span::new(500, 600)]);
        assert!(normalize(Vec::new()).is_empty());
    }

    #[test]
    fn clamp_all_drops_outside() {
        let spans = vec![Span::new(0, 100), Span::new(150, 250), Span::new(300, 400)];
        assert_eq!(
            clamp_all(&spans, &Span::new(50, 200)),
            vec![Span::new(50, 100), Span::new(150, 200)]
        );
    }

    #[test]
    fn covers_requires_full_containment() {
        let free = vec![Span::new(0, 100), Span::new(200, 300)];
        assert!(covers(&free, &Span::new(200, 300)));
        assert!(covers(&free, &Span::new(10, 20)));
        assert!(!covers(&free, &Span::new(90, 210)));
        assert!(!covers(&free, &Span::new(250, 310)));
        assert!(!covers(&[], &Span::new(0, 1)));
    }
}
