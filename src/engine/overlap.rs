use crate::model::*;

/// Two blocks conflict when their intervals intersect at the same location
/// and both are bound to the same provider. Location-only blocks coexist
/// with everything.
pub fn blocks_overlap(a: &AppointmentBlock, b: &AppointmentBlock) -> bool {
    if a.location_id != b.location_id || !a.span.overlaps(&b.span) {
        return false;
    }
    match (a.owner, b.owner) {
        (BlockOwner::Provider(pa), BlockOwner::Provider(pb)) => pa == pb,
        (BlockOwner::LocationOnly, _) | (_, BlockOwner::LocationOnly) => false,
    }
}

/// Existing non-voided blocks that conflict with `candidate`. The candidate
/// itself (same id, i.e. an edit) is never reported.
pub fn find_overlaps<'a>(
    candidate: &AppointmentBlock,
    existing: impl IntoIterator<Item = &'a AppointmentBlock>,
) -> Vec<AppointmentBlock> {
    let mut hits: Vec<AppointmentBlock> = existing
        .into_iter()
        .filter(|b| b.id != candidate.id && !b.is_voided() && blocks_overlap(candidate, b))
        .cloned()
        .collect();
    hits.sort_by_key(|b| (b.span.start, b.id));
    hits
}
