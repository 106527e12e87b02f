// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Bucket allocation
//!
//! Splits a balance of discrete buckets (cache ways) across partitions so
//! that the summed miss curves are as low as possible. Two strategies are
//! provided and [`partition`] picks between them the same way every caller
//! in this crate expects:
//!
//! Peekahead
//! ---------
//!
//! Each partition's curve is reduced once to its points of interest (POIs):
//! the vertices of every lower convex hull reachable from the curve start,
//! each tagged with the allocation size at which a later point makes it
//! obsolete. A priority queue then holds, per partition, the steepest move
//! reachable with the remaining balance. Moves are taken steepest first
//! until the balance runs out or no move reduces misses anymore. Since the
//! hulls are computed once, the cost is close to linear in the number of
//! buckets.
//!
//! Lookahead
//! ---------
//!
//! The classic UCP lookahead: for each partition, scan every reachable
//! future size and keep the one with the best misses saved per bucket.
//! Quadratic, but it can be told to hand out the whole balance, splitting
//! whatever no partition wants evenly.
//!
//! Both queues break ties toward the lowest partition index so that the
//! result only depends on the curves.

use crate::curve::MissCurve;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::warn;
use ordered_float::OrderedFloat;
use sorted_vec::SortedVec;
use std::cmp::Ordering;

/// Moves whose miss slope is not below this do not earn a bucket.
const MIN_MISS_SLOPE: f64 = -1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Peekahead,
    Lookahead,
}

/// Minimum allocation of `part`: none, one shared value, or per partition.
pub(crate) fn min_alloc(min_allocs: &[u32], part: usize) -> u32 {
    match min_allocs.len() {
        0 => 0,
        1 => min_allocs[0],
        _ => min_allocs[part],
    }
}

pub(crate) fn check_partition_args(
    balance: u32,
    min_allocs: &[u32],
    curves: &[&MissCurve],
) -> Result<()> {
    if curves.is_empty() {
        bail!("Cannot partition {} buckets across no curves", balance);
    }
    if min_allocs.len() > 1 && min_allocs.len() != curves.len() {
        bail!(
            "Got {} minimum allocations for {} partitions",
            min_allocs.len(),
            curves.len()
        );
    }

    let mut total: u64 = 0;
    for (part, curve) in curves.iter().enumerate() {
        if curve.is_empty() {
            bail!("Partition {} has an empty curve", part);
        }
        let min = min_alloc(min_allocs, part);
        if min as usize >= curve.domain() {
            bail!(
                "Minimum allocation {} of partition {} is outside its curve (domain {})",
                min,
                part,
                curve.domain()
            );
        }
        total += min as u64;
    }
    if total > balance as u64 {
        bail!(
            "Minimum allocations ({}) exceed the balance ({})",
            total,
            balance
        );
    }

    Ok(())
}

/// Allocate `balance` buckets across `curves`. Peekahead is used unless the
/// whole balance must be handed out, which only lookahead guarantees.
pub fn partition(
    balance: u32,
    min_allocs: &[u32],
    curves: &[&MissCurve],
    force_zero_balance: bool,
) -> Result<Vec<u32>> {
    let strategy = match force_zero_balance {
        true => Strategy::Lookahead,
        false => Strategy::Peekahead,
    };
    partition_with(strategy, balance, min_allocs, curves, force_zero_balance)
}

/// Like [`partition`] with an explicit strategy. When `force_zero_balance`
/// is set, whatever the strategy leaves over is split evenly.
pub fn partition_with(
    strategy: Strategy,
    balance: u32,
    min_allocs: &[u32],
    curves: &[&MissCurve],
    force_zero_balance: bool,
) -> Result<Vec<u32>> {
    check_partition_args(balance, min_allocs, curves)?;

    let mut allocs = match strategy {
        Strategy::Peekahead => peekahead(balance, min_allocs, curves),
        Strategy::Lookahead => lookahead(balance, min_allocs, curves),
    };

    let used: u32 = allocs.iter().sum();
    let left = balance.saturating_sub(used);
    if left > 0 && force_zero_balance {
        warn!("No utility left, splitting {} buckets evenly", left);
        split_evenly(&mut allocs, left);
    }

    debug!("{:?} allocation of {}: {:?}", strategy, balance, allocs);
    Ok(allocs)
}

/// Partition `p` of `n` receives `ceil((p+1)B/n) - ceil(pB/n)`, which sums
/// to exactly `B`.
fn split_evenly(allocs: &mut [u32], left: u32) {
    let n = allocs.len() as u64;
    let left = left as u64;
    let share = |p: u64| (p * left).div_ceil(n);
    for (p, alloc) in allocs.iter_mut().enumerate() {
        let p = p as u64;
        *alloc += (share(p + 1) - share(p)) as u32;
    }
}

trait UtilityOrdered {
    fn get_utility(&self) -> OrderedFloat<f64>;
    fn get_part(&self) -> usize;
}

impl dyn UtilityOrdered {
    // Higher utility sorts later, and so does the lower partition index on
    // a tie, so that SortedVec::pop() yields the move to take next.
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.get_utility()
            .cmp(&other.get_utility())
            .then_with(|| other.get_part().cmp(&self.get_part()))
    }
}

macro_rules! impl_ord_for_type {
    ($($t:ty),*) => {
        $(
            impl PartialEq for $t {
                fn eq(&self, other: &Self) -> bool {
                    <dyn UtilityOrdered>::cmp(self, other) == Ordering::Equal
                }
            }

            impl Eq for $t {}

            impl PartialOrd for $t {
                fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                    Some(self.cmp(other))
                }
            }

            impl Ord for $t {
                fn cmp(&self, other: &Self) -> Ordering {
                    <dyn UtilityOrdered>::cmp(self, other)
                }
            }
        )*
    };
}

/// A point of interest on a curve's hulls.
#[derive(Clone, Debug)]
struct Poi {
    x: i64,
    y: f64,
    /// Allocation size past which a later point supersedes this one.
    obsolescence: f64,
    /// Index of the point in the curve.
    i: usize,
}

fn below(prev: &Poi, next: &Poi, x: i64, y: f64) -> bool {
    let yy = prev.y + (next.y - prev.y) * (x - prev.x) as f64 / (next.x - prev.x) as f64;
    y < yy
}

/// Collect the POIs of every convex hull starting at the curve origin. The
/// last curve point is never a POI; it is reached through end moves.
fn all_hulls(xs: &[i64], ys: &[f64]) -> Vec<Poi> {
    let mut pois = vec![Poi {
        x: xs[0],
        y: ys[0],
        obsolescence: f64::INFINITY,
        i: 0,
    }];
    let mut hull: Vec<usize> = vec![0];

    for i in 1..xs.len().saturating_sub(1) {
        let next = Poi {
            x: xs[i],
            y: ys[i],
            obsolescence: f64::INFINITY,
            i,
        };

        while hull.len() > 1 {
            let cand = hull[hull.len() - 1];
            let prev = hull[hull.len() - 2];
            if below(&pois[prev], &next, pois[cand].x, pois[cand].y) {
                break;
            }

            // Immediate predecessors are never worth stopping at, anything
            // further back stays valid for smaller allocations.
            if pois[cand].x >= next.x - 1 && cand == pois.len() - 1 {
                pois.pop();
            } else if pois[cand].obsolescence == f64::INFINITY {
                pois[cand].obsolescence = (next.x - 1) as f64;
            }
            hull.pop();
        }

        hull.push(pois.len());
        pois.push(next);
    }

    pois
}

/// The first POI after `cur` reachable with `size` buckets that is still
/// on the hull at that size.
fn best_next(pois: &[Poi], size: u32, cur: usize) -> Option<usize> {
    let reach = pois[cur].x + size as i64;
    for (i, poi) in pois.iter().enumerate().skip(cur + 1) {
        if poi.x > reach {
            break;
        }
        if (reach as f64) < poi.obsolescence {
            return Some(i);
        }
    }
    None
}

#[derive(Clone, Copy, Debug)]
enum Target {
    Poi(usize),
    /// Concave region up to the balance; the partition is done afterwards.
    End(usize),
}

#[derive(Clone, Debug)]
struct PeekEntry {
    part: usize,
    mu: f64,
    alloc: u32,
    target: Target,
}

impl UtilityOrdered for PeekEntry {
    fn get_utility(&self) -> OrderedFloat<f64> {
        OrderedFloat(-self.mu)
    }

    fn get_part(&self) -> usize {
        self.part
    }
}

struct Shifted {
    xs: Vec<i64>,
    ys: Vec<f64>,
    pois: Vec<Poi>,
    current: Option<usize>,
}

impl Shifted {
    fn new(curve: &MissCurve, min: u32) -> Shifted {
        let skip = min as usize;
        let xs: Vec<i64> = curve.xs()[skip..]
            .iter()
            .map(|&x| x as i64 - min as i64)
            .collect();
        let ys: Vec<f64> = curve.ys()[skip..].to_vec();
        let pois = all_hulls(&xs, &ys);
        Shifted {
            xs,
            ys,
            pois,
            current: Some(0),
        }
    }

    fn best_move(&self, part: usize, balance: u32) -> Option<PeekEntry> {
        let c = self.current?;
        let cur = &self.pois[c];

        if let Some(n) = best_next(&self.pois, balance, c) {
            let next = &self.pois[n];
            return Some(PeekEntry {
                part,
                mu: (next.y - cur.y) / (next.x - cur.x) as f64,
                alloc: (next.x - cur.x) as u32,
                target: Target::Poi(n),
            });
        }

        let mut nexti = cur.i;
        while nexti < self.xs.len() - 1 && self.xs[nexti] < self.xs[cur.i] + balance as i64 {
            nexti += 1;
        }
        let alloc = self.xs[nexti] - self.xs[cur.i];
        if alloc <= 0 {
            return None;
        }

        Some(PeekEntry {
            part,
            mu: (self.ys[nexti] - self.ys[cur.i]) / alloc as f64,
            alloc: alloc as u32,
            target: Target::End(nexti),
        })
    }
}

fn peekahead(balance: u32, min_allocs: &[u32], curves: &[&MissCurve]) -> Vec<u32> {
    let mut balance = balance as i64;
    let mut parts: Vec<Shifted> = Vec::with_capacity(curves.len());
    for (p, curve) in curves.iter().enumerate() {
        let min = min_alloc(min_allocs, p);
        balance -= min as i64;
        let shifted = Shifted::new(curve, min);
        balance -= shifted.xs[0];
        parts.push(shifted);
    }
    let mut balance = balance.max(0) as u32;
    let mut indices = vec![0usize; curves.len()];

    let mut queue: SortedVec<PeekEntry> = SortedVec::new();
    for (p, part) in parts.iter().enumerate() {
        if let Some(entry) = part.best_move(p, balance) {
            queue.insert(entry);
        }
    }

    while balance > 0 {
        let next = match queue.pop() {
            Some(next) => next,
            None => {
                debug!("Peekahead: queue is empty at balance {}", balance);
                break;
            }
        };
        let p = next.part;

        if balance >= next.alloc {
            let (current, i) = match next.target {
                Target::Poi(n) => (Some(n), parts[p].pois[n].i),
                Target::End(i) => (None, i),
            };
            parts[p].current = current;
            if next.mu < MIN_MISS_SLOPE {
                debug!(
                    "Peekahead: {} buckets -> {} (mu {:.4}), balance {}",
                    next.alloc, p, next.mu, balance
                );
                indices[p] = i;
                balance -= next.alloc;
            } else {
                debug!("Peekahead: no utility left at balance {}", balance);
                break;
            }
        } else if let Target::End(_) = next.target {
            continue;
        }

        if let Some(entry) = parts[p].best_move(p, balance) {
            queue.insert(entry);
        }
    }

    parts
        .iter()
        .enumerate()
        .map(|(p, part)| min_alloc(min_allocs, p) + part.xs[indices[p]].max(0) as u32)
        .collect()
}

#[derive(Clone, Debug)]
struct CandAlloc {
    slope: f64,
    part: usize,
    buckets: u32,
}

impl UtilityOrdered for CandAlloc {
    fn get_utility(&self) -> OrderedFloat<f64> {
        OrderedFloat(self.slope)
    }

    fn get_part(&self) -> usize {
        self.part
    }
}

impl_ord_for_type!(PeekEntry, CandAlloc);

/// The best misses-saved-per-bucket move for a partition currently holding
/// `alloc` buckets, looking at most `balance` buckets ahead.
fn best_alloc(curve: &MissCurve, part: usize, alloc: u32, balance: u32) -> Option<CandAlloc> {
    let mut best = CandAlloc {
        slope: 0.0,
        part,
        buckets: 0,
    };

    let base = curve.at(alloc, 0);
    for s in alloc + 1..=curve.max_x() {
        let size = s - alloc;
        if size > balance {
            break;
        }
        let slope = (base - curve.at(s, 0)) / size as f64;
        if slope > best.slope {
            best.slope = slope;
            best.buckets = size;
        }
    }

    match best.buckets {
        0 => None,
        _ => Some(best),
    }
}

fn lookahead(balance: u32, min_allocs: &[u32], curves: &[&MissCurve]) -> Vec<u32> {
    let mut allocs: Vec<u32> = (0..curves.len()).map(|p| min_alloc(min_allocs, p)).collect();
    let mut balance = balance - allocs.iter().sum::<u32>();

    let mut queue: SortedVec<CandAlloc> = SortedVec::new();
    for (p, curve) in curves.iter().enumerate() {
        if let Some(ca) = best_alloc(curve, p, allocs[p], balance) {
            queue.insert(ca);
        }
    }

    while balance > 0 {
        let ca = match queue.pop() {
            Some(ca) => ca,
            None => break,
        };

        if ca.buckets <= balance {
            allocs[ca.part] += ca.buckets;
            balance -= ca.buckets;
            debug!(
                "Lookahead: {} buckets -> {} (slope {:.4}), balance {}",
                ca.buckets, ca.part, ca.slope, balance
            );
        }

        // A move that no longer fits still gets a chance at a smaller size.
        if balance > 0 {
            if let Some(next) = best_alloc(curves[ca.part], ca.part, allocs[ca.part], balance) {
                queue.insert(next);
            }
        }
    }

    allocs
}
