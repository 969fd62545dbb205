//! Resume-point computation for subscriptions.

use crate::error::Result;
use crate::store::{Filter, MessageCollection, Order, TrackBound};
use crate::types::Sequence;

/// Where a subscription starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Only envelopes published after subscription start.
    Latest,
    /// Full replay from the oldest retained envelope.
    Earliest,
    /// Resume at a checkpoint, inclusive.
    At(Sequence),
}

/// Computes resume filters and track-bound advancement.
///
/// The tie-break asymmetry is deliberate: `Latest` anchors on the newest
/// existing envelope with a strict `>` so the anchor itself is never
/// re-delivered, while `Earliest` and `At` use `>=` because a checkpoint is
/// an inclusive replay boundary.
pub struct CursorStrategy;

impl CursorStrategy {
    /// Compute the track bound for a resume point, or None when no bound is
    /// needed (empty collection: accept everything that arrives).
    pub fn resume_bound(
        collection: &dyn MessageCollection,
        from: ResumeFrom,
    ) -> Result<Option<TrackBound>> {
        match from {
            ResumeFrom::Latest => {
                let newest = collection.find_one(&Filter::all(), Order::NaturalDesc)?;
                Ok(newest.map(|doc| TrackBound::Gt(doc.track)))
            }
            ResumeFrom::Earliest => {
                let oldest = collection.find_one(&Filter::all(), Order::NaturalAsc)?;
                Ok(oldest.map(|doc| TrackBound::Gte(doc.track)))
            }
            ResumeFrom::At(value) => Ok(Some(TrackBound::Gte(value))),
        }
    }

    /// Base filter plus the resume bound for `from`.
    ///
    /// Recomputed from scratch on every (re)initialization: the filter is a
    /// value, never an accumulator mutated across iterations.
    pub fn resume_filter(
        collection: &dyn MessageCollection,
        base: &Filter,
        from: ResumeFrom,
    ) -> Result<Filter> {
        let mut filter = base.clone();
        filter.track = Self::resume_bound(collection, from)?;
        Ok(filter)
    }

    /// Filter for the batch after one that ended at `last_seen`.
    pub fn advance_past(base: &Filter, last_seen: Sequence) -> Filter {
        base.clone().with_track(TrackBound::Gt(last_seen))
    }
}
