//! Fixed quality-tier ordering for format lists.

const QUALITY_TIERS: [(&str, u8); 6] = [
    ("2160p", 5),
    ("1440p", 4),
    ("1080p", 3),
    ("720p", 2),
    ("480p", 1),
    ("360p", 0),
];

/// Tier of a resolution label. Labels outside the table, audio bitrates
/// included, have no tier and rank below 360p.
pub fn quality_rank(label: &str) -> Option<u8> {
    QUALITY_TIERS
        .iter()
        .find(|(tier, _)| *tier == label)
        .map(|(_, rank)| *rank)
}

/// Stable descending sort by tier; equal tiers keep source order.
pub fn sort_by_quality<T, F>(items: &mut [T], label: F)
where
    F: Fn(&T) -> &str,
{
    items.sort_by(|a, b| quality_rank(label(b)).cmp(&quality_rank(label(a))));
}
