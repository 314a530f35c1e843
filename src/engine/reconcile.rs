//! Spot inventory reconciliation: the pure planning half of lot resize.
//!
//! The plan is computed from an immutable snapshot of a lot's spots; the
//! engine applies it afterwards under the lot's write lock, as a single WAL
//! record. Keeping the algorithm free of engine state makes every branch
//! testable without a running engine.

use std::collections::HashSet;

use crate::model::{ReconciliationPlan, Spot, SpotId};

use super::EngineError;

/// Compute the creations, deletions, and renumberings that move a lot from
/// its current spot set to `new_capacity`.
///
/// `fresh_ids` supplies identities for spots the plan may create; the
/// caller allocates at least `new_capacity - spots.len()` of them when
/// growing (extras are ignored, never consumed).
///
/// Guarantees on success:
/// - no spot in `delete` is occupied;
/// - final ordinals are exactly `1..=new_capacity`, no duplicates, no gaps;
/// - surviving spots keep their relative ordinal order;
/// - `new_capacity == spots.len()` yields an empty (no-op) plan.
pub fn plan_resize(
    spots: &[Spot],
    new_capacity: u32,
    fresh_ids: &[SpotId],
) -> Result<ReconciliationPlan, EngineError> {
    if new_capacity == 0 {
        return Err(EngineError::InvalidCapacity(new_capacity));
    }

    let current = spots.len() as u32;
    let occupied = spots.iter().filter(|s| !s.is_available()).count() as u32;
    if new_capacity < occupied {
        return Err(EngineError::CapacityBelowOccupancy {
            requested: new_capacity,
            occupied,
        });
    }

    let mut plan = ReconciliationPlan {
        new_capacity,
        ..Default::default()
    };
    if new_capacity == current {
        return Ok(plan);
    }

    // Staged view: (id, staged ordinal, freshly created). Starts as the
    // current snapshot sorted by ordinal.
    let mut staged: Vec<(SpotId, u32, bool)> =
        spots.iter().map(|s| (s.id, s.ordinal, false)).collect();
    staged.sort_by_key(|&(_, ordinal, _)| ordinal);

    if new_capacity > current {
        // Grow. Staged ordinals go strictly above the current maximum so
        // they cannot collide with any existing number.
        let max_ordinal = staged.last().map_or(0, |&(_, ordinal, _)| ordinal);
        let needed = (new_capacity - current) as usize;
        debug_assert!(
            fresh_ids.len() >= needed,
            "caller must allocate {needed} fresh spot ids"
        );
        for (i, &id) in fresh_ids[..needed].iter().enumerate() {
            staged.push((id, max_ordinal + 1 + i as u32, true));
        }
    } else {
        // Shrink. Drop the highest-ordinal Available spots first, biasing
        // the retained low numbers toward earlier-created spots. Occupied
        // spots are never candidates regardless of ordinal.
        let retain_available = (new_capacity - occupied) as usize;
        let mut available: Vec<&Spot> = spots.iter().filter(|s| s.is_available()).collect();
        available.sort_by_key(|s| std::cmp::Reverse(s.ordinal));

        let doomed: HashSet<SpotId> = available[..available.len() - retain_available]
            .iter()
            .map(|s| s.id)
            .collect();
        staged.retain(|(id, _, _)| !doomed.contains(id));
        plan.delete = available[..available.len() - retain_available]
            .iter()
            .map(|s| s.id)
            .collect();
    }

    // Renumbering pass: survivors and creations together, sorted by staged
    // ordinal, reassigned 1..=new_capacity with no gaps. Only the ordinal
    // changes — identity, occupant, and bookings ride along untouched.
    staged.sort_by_key(|&(_, ordinal, _)| ordinal);
    debug_assert_eq!(staged.len() as u32, new_capacity);
    for (i, &(id, ordinal, created)) in staged.iter().enumerate() {
        let final_ordinal = i as u32 + 1;
        if created {
            plan.create.push((id, final_ordinal));
        } else if final_ordinal != ordinal {
            plan.renumber.push((id, final_ordinal));
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingId, SpotState, UserId};

    fn available(id: u64, ordinal: u32) -> Spot {
        Spot::new(SpotId(id), ordinal)
    }

    fn occupied(id: u64, ordinal: u32) -> Spot {
        let mut s = Spot::new(SpotId(id), ordinal);
        s.state = SpotState::Occupied {
            user_id: UserId(100 + id),
            booking_id: BookingId(200 + id),
        };
        s
    }

    fn fresh(n: u64) -> Vec<SpotId> {
        (1_000..1_000 + n).map(SpotId).collect()
    }

    /// Apply a plan to a snapshot and return the surviving (id, ordinal)
    /// pairs sorted by ordinal, for invariant checks.
    fn apply(spots: &[Spot], plan: &ReconciliationPlan) -> Vec<(SpotId, u32)> {
        let deleted: HashSet<SpotId> = plan.delete.iter().copied().collect();
        let mut out: Vec<(SpotId, u32)> = spots
            .iter()
            .filter(|s| !deleted.contains(&s.id))
            .map(|s| {
                let renum = plan
                    .renumber
                    .iter()
                    .find(|(id, _)| *id == s.id)
                    .map(|&(_, o)| o);
                (s.id, renum.unwrap_or(s.ordinal))
            })
            .collect();
        out.extend(plan.create.iter().copied());
        out.sort_by_key(|&(_, o)| o);
        out
    }

    fn assert_contiguous(result: &[(SpotId, u32)], capacity: u32) {
        let ordinals: Vec<u32> = result.iter().map(|&(_, o)| o).collect();
        assert_eq!(ordinals, (1..=capacity).collect::<Vec<u32>>());
    }

    #[test]
    fn zero_capacity_rejected() {
        let spots = [available(1, 1)];
        assert!(matches!(
            plan_resize(&spots, 0, &[]),
            Err(EngineError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn same_capacity_is_noop() {
        let spots = [available(1, 1), occupied(2, 2)];
        let plan = plan_resize(&spots, 2, &[]).unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.new_capacity, 2);
    }

    #[test]
    fn grow_appends_after_current_max() {
        let spots = [available(1, 1), available(2, 2), available(3, 3)];
        let plan = plan_resize(&spots, 5, &fresh(2)).unwrap();
        assert!(plan.delete.is_empty());
        assert!(plan.renumber.is_empty());
        assert_eq!(plan.create, vec![(SpotId(1_000), 4), (SpotId(1_001), 5)]);
        assert_contiguous(&apply(&spots, &plan), 5);
    }

    #[test]
    fn grow_with_gapped_ordinals_renumbers_everything() {
        // Legacy/mid-flight state with gaps: ordinals 2, 5, 9.
        let spots = [available(1, 2), occupied(2, 5), available(3, 9)];
        let plan = plan_resize(&spots, 4, &fresh(1)).unwrap();
        let result = apply(&spots, &plan);
        assert_contiguous(&result, 4);
        // Relative order preserved; the new spot lands last.
        assert_eq!(
            result,
            vec![
                (SpotId(1), 1),
                (SpotId(2), 2),
                (SpotId(3), 3),
                (SpotId(1_000), 4)
            ]
        );
    }

    #[test]
    fn shrink_deletes_highest_available_first() {
        let spots = [
            available(1, 1),
            available(2, 2),
            available(3, 3),
            available(4, 4),
        ];
        let plan = plan_resize(&spots, 2, &[]).unwrap();
        assert_eq!(plan.delete, vec![SpotId(4), SpotId(3)]);
        assert!(plan.create.is_empty());
        assert!(plan.renumber.is_empty());
        assert_contiguous(&apply(&spots, &plan), 2);
    }

    #[test]
    fn shrink_never_deletes_occupied() {
        // Occupied spot sits at the highest ordinal.
        let spots = [available(1, 1), available(2, 2), occupied(3, 3)];
        let plan = plan_resize(&spots, 1, &[]).unwrap();
        assert_eq!(plan.delete, vec![SpotId(2), SpotId(1)]);
        // The occupied survivor is renumbered 3 -> 1.
        assert_eq!(plan.renumber, vec![(SpotId(3), 1)]);
        assert_contiguous(&apply(&spots, &plan), 1);
    }

    #[test]
    fn shrink_below_occupancy_rejected() {
        let spots = [occupied(1, 1), occupied(2, 2)];
        assert!(matches!(
            plan_resize(&spots, 1, &[]),
            Err(EngineError::CapacityBelowOccupancy {
                requested: 1,
                occupied: 2
            })
        ));
    }

    #[test]
    fn shrink_to_exact_occupancy() {
        let spots = [occupied(1, 1), available(2, 2), occupied(3, 3)];
        let plan = plan_resize(&spots, 2, &[]).unwrap();
        assert_eq!(plan.delete, vec![SpotId(2)]);
        let result = apply(&spots, &plan);
        assert_contiguous(&result, 2);
        assert_eq!(result, vec![(SpotId(1), 1), (SpotId(3), 2)]);
    }

    #[test]
    fn shrink_preserves_relative_order_of_survivors() {
        let spots = [
            available(1, 1),
            occupied(2, 2),
            available(3, 3),
            occupied(4, 4),
            available(5, 5),
        ];
        let plan = plan_resize(&spots, 3, &[]).unwrap();
        // Highest available ordinals (5, then 3) go.
        assert_eq!(plan.delete, vec![SpotId(5), SpotId(3)]);
        let result = apply(&spots, &plan);
        assert_eq!(
            result,
            vec![(SpotId(1), 1), (SpotId(2), 2), (SpotId(4), 3)]
        );
    }

    #[test]
    fn shrink_around_single_occupant() {
        // Capacity 3, S1 occupied. Resize to 2: S3 (highest available) is
        // deleted; S1 keeps its occupant; ordinals end up 1, 2.
        let spots = [occupied(1, 1), available(2, 2), available(3, 3)];
        let plan = plan_resize(&spots, 2, &[]).unwrap();
        assert_eq!(plan.delete, vec![SpotId(3)]);
        assert!(plan.renumber.is_empty());
        assert_contiguous(&apply(&spots, &plan), 2);
    }

    #[test]
    fn grow_does_not_reuse_freed_numbers() {
        // Survivor at ordinal 7 (a gap below it from past churn): new spots
        // must stage above 7, not fill the gap, then everything renumbers.
        let spots = [occupied(1, 7)];
        let plan = plan_resize(&spots, 3, &fresh(2)).unwrap();
        let result = apply(&spots, &plan);
        // Occupied survivor stays first (lowest staged ordinal).
        assert_eq!(
            result,
            vec![(SpotId(1), 1), (SpotId(1_000), 2), (SpotId(1_001), 3)]
        );
    }

    #[test]
    fn plan_survives_serialization() {
        let spots = [occupied(1, 1), available(2, 2), available(3, 3)];
        let plan = plan_resize(&spots, 2, &[]).unwrap();
        let bytes = bincode::serialize(&plan).unwrap();
        let decoded: ReconciliationPlan = bincode::deserialize(&bytes).unwrap();
        assert_eq!(plan, decoded);
    }
}
