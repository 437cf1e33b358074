// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The LV Allocator: policy-driven segment selection, extend/reduce/
//! remove, segment merge, and LV name generation.
//!
//! Every function here either fully commits or touches nothing: the
//! selection functions build new segments against scratch `PvMap`s and
//! only return them; the caller (`VolumeGroup`) is the one who mutates
//! real `PhysicalVolume` counters, and only after a selection call
//! returns `Ok`. A failed selection leaves the segment list and PV
//! counters exactly as they were, with no explicit rollback path
//! needed.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::lv::{AllocationPolicy, LogicalVolume, LvSegment, SegmentArea, SegmentType};
use crate::pv::{PhysicalVolume, PvMap};
use crate::types::LogicalExtent;

/// Select segments covering `[already_allocated, already_allocated +
/// extents)` of an LV's logical extent space under `policy`, drawing
/// from `pv_maps`. Does not mutate `lv` or any `PhysicalVolume`.
pub fn select(
    already_allocated: u32,
    extents: u32,
    policy: AllocationPolicy,
    pv_maps: &mut [PvMap],
) -> Result<Vec<LvSegment>> {
    match policy {
        AllocationPolicy::Contiguous => select_contiguous(already_allocated, extents, pv_maps),
        AllocationPolicy::NextFree => select_next_free(already_allocated, extents, pv_maps),
        AllocationPolicy::Striped { stripes, stripe_size } => {
            select_striped(already_allocated, extents, stripes, stripe_size, pv_maps)
        }
    }
}

fn linear_segment(le_cursor: u32, pv_index: usize, start: crate::types::PhysicalExtent, len: u32) -> LvSegment {
    LvSegment {
        le_start: LogicalExtent(le_cursor),
        le_len: len,
        ty: SegmentType::Striped,
        stripe_size: 0,
        areas: vec![SegmentArea { pv_index, start_pe: start }],
    }
}

/// One area per PV, largest first: a single linear segment per PV
/// until the LV is full.
fn select_contiguous(already_allocated: u32, extents: u32, pv_maps: &mut [PvMap]) -> Result<Vec<LvSegment>> {
    let mut segments = Vec::new();
    let mut allocated = 0u32;
    let mut le_cursor = already_allocated;

    for map in pv_maps.iter_mut() {
        if allocated >= extents {
            break;
        }
        let Some(area) = map.largest().copied() else { continue };
        let take = area.count.min(extents - allocated);
        let start = map.consume_largest(take).expect("area just inspected");
        segments.push(linear_segment(le_cursor, map.pv_index, start, take));
        allocated += take;
        le_cursor += take;
    }

    if allocated < extents {
        warn!("contiguous allocation short by {} extent(s)", extents - allocated);
        return Err(Error::InsufficientSpace);
    }
    debug!("contiguous: {} extent(s) across {} segment(s)", allocated, segments.len());
    Ok(segments)
}

/// All areas of a PV (still largest-first) before moving to the next
/// PV: a linear segment per area consumed.
fn select_next_free(already_allocated: u32, extents: u32, pv_maps: &mut [PvMap]) -> Result<Vec<LvSegment>> {
    let mut segments = Vec::new();
    let mut allocated = 0u32;
    let mut le_cursor = already_allocated;

    'outer: for map in pv_maps.iter_mut() {
        while let Some(area) = map.largest().copied() {
            if allocated >= extents {
                break 'outer;
            }
            let take = area.count.min(extents - allocated);
            let start = map.consume_largest(take).expect("area just inspected");
            segments.push(linear_segment(le_cursor, map.pv_index, start, take));
            allocated += take;
            le_cursor += take;
        }
    }

    if allocated < extents {
        warn!("next-free allocation short by {} extent(s)", extents - allocated);
        return Err(Error::InsufficientSpace);
    }
    debug!("next-free: {} extent(s) across {} segment(s)", allocated, segments.len());
    Ok(segments)
}

/// Re-select the `stripes` largest remaining areas every iteration,
/// emitting one striped segment per iteration. Ties break by PV-map
/// order.
fn select_striped(
    already_allocated: u32,
    extents: u32,
    stripes: u32,
    stripe_size: u64,
    pv_maps: &mut [PvMap],
) -> Result<Vec<LvSegment>> {
    let mut segments = Vec::new();
    let mut allocated = 0u32;
    let mut le_cursor = already_allocated;

    while allocated < extents {
        let mut candidates: Vec<(usize, u32)> = pv_maps
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.largest().map(|a| (i, a.count)))
            .collect();

        if (candidates.len() as u32) < stripes {
            warn!(
                "striped allocation short: {} candidate PV(s), need {}",
                candidates.len(),
                stripes
            );
            return Err(Error::InsufficientSpace);
        }

        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        let chosen = &candidates[..stripes as usize];
        let smallest_chosen = chosen.iter().map(|&(_, count)| count).min().unwrap();
        let remaining = extents - allocated;
        let per_stripe = smallest_chosen.min(remaining / stripes);

        if per_stripe == 0 {
            warn!("striped allocation cannot make progress: remaining extents don't divide evenly across stripes");
            return Err(Error::InsufficientSpace);
        }

        let mut areas = Vec::with_capacity(stripes as usize);
        for &(map_idx, _) in chosen {
            let start = pv_maps[map_idx]
                .consume_largest(per_stripe)
                .expect("candidate just inspected");
            areas.push(SegmentArea { pv_index: pv_maps[map_idx].pv_index, start_pe: start });
        }

        let len = per_stripe * stripes;
        segments.push(LvSegment {
            le_start: LogicalExtent(le_cursor),
            le_len: len,
            ty: SegmentType::Striped,
            stripe_size,
            areas,
        });
        allocated += len;
        le_cursor += len;
    }

    debug!("striped: {} extent(s) across {} segment(s)", allocated, segments.len());
    Ok(segments)
}

/// Coalesce adjacent segments sharing type, column count, stripe size,
/// and (per column) the same PV with a contiguous run
/// (`new.start_pe == old.start_pe + old.area_len`).
pub fn merge_segments(lv: &mut LogicalVolume) {
    let mut merged: Vec<LvSegment> = Vec::with_capacity(lv.segments.len());
    for seg in lv.segments.drain(..) {
        let mergeable = match merged.last() {
            Some(prev) => can_merge(prev, &seg),
            None => false,
        };
        if mergeable {
            merged.last_mut().unwrap().le_len += seg.le_len;
        } else {
            merged.push(seg);
        }
    }
    lv.segments = merged;
}

fn can_merge(a: &LvSegment, b: &LvSegment) -> bool {
    if a.ty != b.ty || a.stripe_size != b.stripe_size || a.area_count() != b.area_count() {
        return false;
    }
    if b.le_start.0 != a.le_start.0 + a.le_len {
        return false;
    }
    let a_area_len = a.area_len();
    a.areas
        .iter()
        .zip(b.areas.iter())
        .all(|(pa, pb)| pa.pv_index == pb.pv_index && pb.start_pe.0 == pa.start_pe.0 + a_area_len)
}

/// Select `extents` new extents under `policy`, append the resulting
/// segments to `lv`, update `pe_alloc_count` on every touched PV, debit
/// `free_count`, and merge. Used for both a fresh create (`lv.le_count
/// == 0`) and an extend.
pub fn extend(
    lv: &mut LogicalVolume,
    pvs: &mut [PhysicalVolume],
    free_count: &mut u64,
    extents: u32,
    pv_maps: &mut [PvMap],
) -> Result<()> {
    let already_allocated = lv.le_count;
    let new_segments = select(already_allocated, extents, lv.allocation_policy, pv_maps)?;

    for seg in &new_segments {
        let area_len = seg.area_len();
        for area in &seg.areas {
            pvs[area.pv_index].pe_alloc_count += area_len;
        }
    }
    lv.segments.extend(new_segments);
    lv.le_count += extents;
    *free_count -= u64::from(extents);
    merge_segments(lv);
    Ok(())
}

/// Remove `extents` logical extents from the tail of `lv`, releasing
/// the PV extents they held.
pub fn reduce(lv: &mut LogicalVolume, pvs: &mut [PhysicalVolume], free_count: &mut u64, extents: u32) -> Result<()> {
    if extents > lv.le_count {
        return Err(Error::BadParam("reduce: extents exceeds le_count".to_string()));
    }

    let mut check_remaining = extents;
    for seg in lv.segments.iter().rev() {
        if seg.le_len <= check_remaining {
            check_remaining -= seg.le_len;
        } else {
            let area_count = seg.area_count();
            if check_remaining % area_count != 0 {
                return Err(Error::BadParam(format!(
                    "reduce: {check_remaining} extent(s) does not divide evenly across {area_count} stripe(s)"
                )));
            }
            break;
        }
    }

    let mut remaining = extents;
    while remaining > 0 {
        let seg = lv.segments.last_mut().expect("le_count > 0 implies a last segment");
        if seg.le_len <= remaining {
            remaining -= seg.le_len;
            let seg = lv.segments.pop().unwrap();
            release_segment(&seg, pvs);
        } else {
            let area_count = seg.area_count();
            let release_area_len = remaining / area_count;
            seg.le_len -= remaining;
            for area in &seg.areas {
                pvs[area.pv_index].pe_alloc_count -= release_area_len;
            }
            remaining = 0;
        }
    }
    lv.le_count -= extents;
    *free_count += u64::from(extents);
    debug!("reduce: released {} extent(s) from {:?}", extents, lv.name);
    Ok(())
}

/// Release every segment of `lv`; the caller unlinks `lv` from the VG.
pub fn remove(lv: &LogicalVolume, pvs: &mut [PhysicalVolume], free_count: &mut u64) {
    for seg in &lv.segments {
        release_segment(seg, pvs);
    }
    *free_count += u64::from(lv.le_count);
}

fn release_segment(seg: &LvSegment, pvs: &mut [PhysicalVolume]) {
    let area_len = seg.area_len();
    for area in &seg.areas {
        pvs[area.pv_index].pe_alloc_count -= area_len;
    }
}

/// If no name is supplied: the smallest-unused `lvol<N>`.
pub fn generate_name(existing: &[&str]) -> String {
    let max_n = existing
        .iter()
        .filter_map(|n| n.strip_prefix("lvol"))
        .filter_map(|rest| rest.parse::<u64>().ok())
        .max();
    match max_n {
        Some(n) => format!("lvol{}", n + 1),
        None => "lvol0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lv::AllocationPolicy;
    use crate::pv::PvArea;
    use crate::types::PhysicalExtent;

    fn map(pv_index: usize, areas: &[(u32, u32)]) -> PvMap {
        PvMap::new(
            pv_index,
            areas
                .iter()
                .map(|&(start, count)| PvArea { pv_index, start_pe: PhysicalExtent(start), count })
                .collect(),
        )
    }

    /// Scenario 2: exact-fit contiguous allocation.
    #[test]
    fn contiguous_exact_fit_uses_one_pv() {
        let mut maps = [map(0, &[(0, 50)]), map(1, &[(0, 50)])];
        let segments = select_contiguous(0, 50, &mut maps).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].areas[0].pv_index, 0);
        assert_eq!(segments[0].le_len, 50);
    }

    /// Scenario 3: next-free spills across PV_B's two areas.
    #[test]
    fn next_free_spills_across_areas() {
        let mut maps = [map(0, &[(0, 30)]), map(1, &[(0, 20), (20, 10)])];
        let segments = select_next_free(0, 55, &mut maps).unwrap();
        let got: Vec<(usize, u32, u32)> = segments
            .iter()
            .map(|s| (s.areas[0].pv_index, s.areas[0].start_pe.0, s.le_len))
            .collect();
        assert_eq!(got, vec![(0, 0, 30), (1, 0, 20), (1, 20, 5)]);
    }

    /// Scenario 4: balanced striping across three equally-deep areas.
    #[test]
    fn striped_balanced_three_way() {
        let mut maps = [map(0, &[(0, 40)]), map(1, &[(0, 40)]), map(2, &[(0, 20)])];
        let segments = select_striped(0, 60, 3, 8, &mut maps).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].le_len, 60);
        assert_eq!(segments[0].area_len(), 20);
        assert_eq!(segments[0].areas.len(), 3);
    }

    /// Scenario 5: too few candidate PVs fails without partial state.
    #[test]
    fn striped_insufficient_pvs_fails() {
        let mut maps = [map(0, &[(0, 40)]), map(1, &[(0, 40)])];
        let err = select_striped(0, 60, 3, 8, &mut maps).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace));
    }

    #[test]
    fn merge_coalesces_contiguous_linear_extension() {
        let mut lv = LogicalVolume::new("lvol0".to_string(), AllocationPolicy::Contiguous);
        lv.segments.push(linear_segment(0, 0, PhysicalExtent(0), 10));
        lv.segments.push(linear_segment(10, 0, PhysicalExtent(10), 5));
        merge_segments(&mut lv);
        assert_eq!(lv.segments.len(), 1);
        assert_eq!(lv.segments[0].le_len, 15);
    }

    #[test]
    fn merge_leaves_non_adjacent_segments_separate() {
        let mut lv = LogicalVolume::new("lvol0".to_string(), AllocationPolicy::Contiguous);
        lv.segments.push(linear_segment(0, 0, PhysicalExtent(0), 10));
        lv.segments.push(linear_segment(10, 1, PhysicalExtent(0), 5));
        merge_segments(&mut lv);
        assert_eq!(lv.segments.len(), 2);
    }

    #[test]
    fn extend_then_reduce_restores_counters() {
        let mut pvs = vec![PhysicalVolume::new("pv0", 100)];
        let mut free_count = 100u64;
        let mut lv = LogicalVolume::new("lvol0".to_string(), AllocationPolicy::Contiguous);

        let mut maps = vec![map(0, &[(0, 100)])];
        extend(&mut lv, &mut pvs, &mut free_count, 40, &mut maps).unwrap();
        assert_eq!(pvs[0].pe_alloc_count, 40);
        assert_eq!(free_count, 60);

        reduce(&mut lv, &mut pvs, &mut free_count, 40).unwrap();
        assert_eq!(pvs[0].pe_alloc_count, 0);
        assert_eq!(free_count, 100);
        assert_eq!(lv.le_count, 0);
        assert!(lv.segments.is_empty());
    }

    #[test]
    fn failing_extend_leaves_pv_counters_untouched() {
        let mut pvs = vec![PhysicalVolume::new("pv0", 10), PhysicalVolume::new("pv1", 10)];
        let mut free_count = 20u64;
        let mut lv = LogicalVolume::new(
            "lvol0".to_string(),
            AllocationPolicy::Striped { stripes: 3, stripe_size: 8 },
        );

        let mut maps = vec![map(0, &[(0, 10)]), map(1, &[(0, 10)])];
        let err = extend(&mut lv, &mut pvs, &mut free_count, 9, &mut maps).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace));
        assert_eq!(pvs[0].pe_alloc_count, 0);
        assert_eq!(pvs[1].pe_alloc_count, 0);
        assert_eq!(free_count, 20);
        assert!(lv.segments.is_empty());
    }

    #[test]
    fn reduce_rejects_non_stripe_aligned_shrink() {
        let mut pvs = vec![PhysicalVolume::new("pv0", 10), PhysicalVolume::new("pv1", 10)];
        let mut free_count = 20u64;
        let mut lv = LogicalVolume::new(
            "lvol0".to_string(),
            AllocationPolicy::Striped { stripes: 2, stripe_size: 8 },
        );

        let mut maps = vec![map(0, &[(0, 10)]), map(1, &[(0, 10)])];
        extend(&mut lv, &mut pvs, &mut free_count, 10, &mut maps).unwrap();
        assert_eq!(lv.segments[0].area_count(), 2);

        let err = reduce(&mut lv, &mut pvs, &mut free_count, 3).unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));
        assert_eq!(lv.le_count, 10);
        assert_eq!(pvs[0].pe_alloc_count, 5);
        assert_eq!(pvs[1].pe_alloc_count, 5);
    }

    #[test]
    fn name_generation_finds_next_unused_lvol() {
        assert_eq!(generate_name(&[]), "lvol0");
        assert_eq!(generate_name(&["lvol0", "lvol3", "lvol1"]), "lvol4");
        assert_eq!(generate_name(&["data", "backup"]), "lvol0");
    }
}
