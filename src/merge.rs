//! Ordered merge of a fetched page into a live collection.
//!
//! The merge is identity-driven: an incoming item that matches an existing
//! item (per the caller's `same_item` predicate) replaces it, keeping its
//! position when the declared ordering still holds there; an incoming item
//! with no match is inserted where the comparator dictates. Incoming items
//! win ties with existing ones, and merging the same page twice produces the
//! same collection as merging it once.

use std::cmp::Ordering;

use tracing::warn;

use crate::protocol::insertion_point;

/// Fold `incoming` into `current`. `current` must already be sorted by `cmp`;
/// the result is sorted by `cmp` and contains no two items for which
/// `same_item` holds. Never fails: problem items degrade to a logged warning.
pub fn merge_sorted<T, C, S>(current: &[T], incoming: &[T], mut cmp: C, mut same_item: S) -> Vec<T>
where
    T: Clone,
    C: FnMut(&T, &T) -> Ordering,
    S: FnMut(&T, &T) -> bool,
{
    let mut out: Vec<T> = current.to_vec();
    // Tracks positions written by this merge call so a duplicate identity
    // inside one page can be reported rather than silently folded.
    let mut touched = vec![false; out.len()];

    for item in incoming {
        match out.iter().position(|existing| same_item(existing, item)) {
            Some(at) => {
                if touched[at] {
                    warn!("incoming page repeats an item identity; keeping the later occurrence");
                }
                out[at] = item.clone();
                touched[at] = true;
                if !ordered_at(&out, at, &mut cmp) {
                    let moved = out.remove(at);
                    let flag = touched.remove(at);
                    let to = insertion_point(&out, &moved, &mut cmp);
                    out.insert(to, moved);
                    touched.insert(to, flag);
                }
            }
            None => {
                let to = insertion_point(&out, item, &mut cmp);
                out.insert(to, item.clone());
                touched.insert(to, true);
            }
        }
    }

    out
}

fn ordered_at<T>(items: &[T], at: usize, cmp: &mut impl FnMut(&T, &T) -> Ordering) -> bool {
    let left_ok = at == 0 || cmp(&items[at - 1], &items[at]) != Ordering::Greater;
    let right_ok = at + 1 >= items.len() || cmp(&items[at], &items[at + 1]) != Ordering::Greater;
    left_ok && right_ok
}
