//! C9 — Query Join-Order Optimizer.
//!
//! Chooses the evaluation order of a query's table filters and, for each
//! filter in that order, the index access path to use. Search strategy
//! depends on the filter count `n` (spec §4.9):
//!
//! - `n == 1` or the caller forces the input order: evaluate it once.
//! - `n <= MAX_BRUTE_FORCE_FILTERS`: enumerate every permutation, bailing
//!   out early via [`can_stop`] once the search has run long enough
//!   relative to the best cost found so far.
//! - otherwise: brute-force as many leading positions as
//!   [`MAX_BRUTE_FORCE`] affords, greedily fill the rest, then refine with
//!   a bounded genetic search.
//!
//! This crate knows nothing about SQL predicates or column types — a
//! [`Filter`] is an opaque table reference with a row-count estimate and a
//! small menu of [`IndexCandidate`]s, each already carrying the cost its
//! owning index reported (spec's `getCost`). That keeps the optimizer
//! decoupled from `btree`/`hash`/`scan`, which is what actually computes
//! those costs; the planner only searches orderings.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::time::Instant;

use catalog::IndexKind;
use common::{Config, DbError, DbResult, TableId};
use rand::seq::SliceRandom;
use rand::Rng;

/// Every 128th permutation (brute force) or genetic-search iteration is a
/// checkpoint where the search may bail out early (spec §4.9/§5).
const STOP_CHECK_INTERVAL: u64 = 128;

/// One index an optimizer can choose for a [`Filter`], with the cost its
/// owning index already computed for this query (spec's per-kind cost
/// formulas: `1` range-table virtual, `2` equality hash hit, `rowCount +
/// COST_ROW_OFFSET` scan, `10*(rowCount + COST_ROW_OFFSET) + 200` primary
/// B-tree scan — those constants live with the indexes that report them,
/// in `scan`/`hash`/`btree`, not here).
#[derive(Clone, Debug)]
pub struct IndexCandidate {
    pub name: String,
    pub kind: IndexKind,
    /// Must be strictly positive (spec §4.9 numerical invariant).
    pub cost: i64,
    /// Other filters (by position in the original, unordered `Filter`
    /// slice) whose presence *earlier* in the evaluation order makes this
    /// candidate's quoted cost valid — modeling a join condition that only
    /// becomes an indexable equality once the other side is bound. Empty
    /// means the candidate is always available (e.g. a full scan).
    pub enabled_by: Vec<usize>,
}

/// A table reference participating in the join, independent of its
/// position in the final plan.
#[derive(Clone, Debug)]
pub struct Filter {
    pub table: TableId,
    pub name: String,
    pub row_count: i64,
    pub options: Vec<IndexCandidate>,
}

impl Filter {
    /// The cheapest candidate usable given the set of filters already
    /// placed earlier in a candidate order. Every filter must carry at
    /// least one always-available option (typically a full scan) or this
    /// returns `None`, which is a modeling bug, not a runtime condition.
    fn best_option(&self, placed: &HashSet<usize>) -> Option<&IndexCandidate> {
        self.options
            .iter()
            .filter(|o| o.enabled_by.is_empty() || o.enabled_by.iter().any(|p| placed.contains(p)))
            .min_by_key(|o| o.cost)
    }
}

/// A single filter's resolved position and access path within a [`Plan`].
#[derive(Clone, Debug, PartialEq)]
pub struct PlanItem {
    pub filter: usize,
    pub index_name: String,
    pub kind: IndexKind,
    pub cost: i64,
}

/// The optimizer's output: a filter evaluation order plus the chosen
/// access path and total estimated cost.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    /// Filter indices (into the input slice) in evaluation order.
    pub order: Vec<usize>,
    pub items: Vec<PlanItem>,
    pub cost: f64,
}

impl Plan {
    /// Spec §4.9: "after search, `bestPlan.removeUnusableIndexConditions()`".
    /// In this core, predicate applicability is already folded into each
    /// `IndexCandidate.enabled_by` check during cost evaluation — a
    /// candidate that made it into `items` was, by construction, usable at
    /// its resolved position. There is no separate predicate tree to prune
    /// (SQL expressions are an out-of-scope collaborator per spec §1), so
    /// this is a no-op kept as a named step for parity with the spec's
    /// post-search pass.
    pub fn remove_unusable_index_conditions(&self) -> &Self {
        self
    }
}

/// Evaluate the fixed cost of running `order` against `filters`: a running
/// nested-loop accumulator where each filter's cost is incurred once per
/// row estimated to reach it, and its own row count multiplies into the
/// count driving every filter placed after it.
fn calculate_cost(order: &[usize], filters: &[Filter]) -> DbResult<(f64, Vec<PlanItem>)> {
    let mut placed = HashSet::with_capacity(order.len());
    let mut items = Vec::with_capacity(order.len());
    let mut running = 1.0f64;
    let mut total = 0.0f64;
    for &idx in order {
        let filter = &filters[idx];
        let chosen = filter.best_option(&placed).ok_or_else(|| {
            DbError::Optimizer(format!(
                "filter {} ({}) has no usable index candidate",
                idx, filter.name
            ))
        })?;
        if chosen.cost <= 0 {
            return Err(DbError::Optimizer(format!(
                "filter {} ({}) reported non-positive cost {} from index {}",
                idx, filter.name, chosen.cost, chosen.name
            )));
        }
        total += running * chosen.cost as f64;
        running *= filter.row_count.max(1) as f64;
        placed.insert(idx);
        items.push(PlanItem {
            filter: idx,
            index_name: chosen.name.clone(),
            kind: chosen.kind.clone(),
            cost: chosen.cost,
        });
    }
    Ok((total, items))
}

/// Spec §4.9's `canStop(x)`: checked every `STOP_CHECK_INTERVAL`-th
/// candidate; stops once the search has already run for a time
/// proportional to the best cost found so far, so a cheap plan cuts the
/// search short and an expensive one gets more scrutiny.
fn can_stop(x: u64, best_cost: f64, started: Instant) -> bool {
    x % STOP_CHECK_INTERVAL == 0
        && best_cost >= 0.0
        && started.elapsed().as_nanos() as f64 > best_cost * 100_000.0
}

/// Enumerate every permutation of `0..n` via Heap's algorithm, calling
/// `visit` with each and stopping as soon as it returns `true`.
fn for_each_permutation(n: usize, mut visit: impl FnMut(&[usize]) -> bool) {
    let mut a: Vec<usize> = (0..n).collect();
    let mut c = vec![0usize; n];
    if visit(&a) {
        return;
    }
    let mut i = 0;
    while i < n {
        if c[i] < i {
            if i % 2 == 0 {
                a.swap(0, i);
            } else {
                a.swap(c[i], i);
            }
            if visit(&a) {
                return;
            }
            c[i] += 1;
            i = 0;
        } else {
            c[i] = 0;
            i += 1;
        }
    }
}

/// Exhaustive search over every permutation of `filters`, bailing out early
/// via [`can_stop`]. Used for `n <= max_brute_force_filters`.
fn brute_force_all(filters: &[Filter]) -> DbResult<Plan> {
    let n = filters.len();
    let started = Instant::now();
    let mut best: Option<(f64, Vec<usize>, Vec<PlanItem>)> = None;
    let mut err: Option<DbError> = None;
    let mut count: u64 = 0;

    for_each_permutation(n, |order| {
        count += 1;
        match calculate_cost(order, filters) {
            Ok((cost, items)) => {
                if best.as_ref().map(|(c, ..)| cost < *c).unwrap_or(true) {
                    best = Some((cost, order.to_vec(), items));
                }
            }
            Err(e) => {
                err = Some(e);
                return true;
            }
        }
        can_stop(count, best.as_ref().map(|(c, ..)| *c).unwrap_or(-1.0), started)
    });

    if let Some(e) = err {
        return Err(e);
    }
    let (cost, order, items) = best.ok_or_else(|| DbError::Optimizer("no filters to plan".into()))?;
    Ok(Plan { order, items, cost })
}

/// Largest `k` such that `n * k*(k-1)/2 * perms(n, k) <= max_brute_force`
/// (spec §4.9's `calculateBruteForceSome` sizing rule). `perms(n, k) =
/// n! / (n-k)!`.
fn brute_force_prefix_len(n: usize, max_brute_force: usize) -> usize {
    let mut k = 1usize;
    while k <= n {
        let perms_n_k: u128 = ((n - k + 1)..=n).map(|v| v as u128).product();
        let budget = (n as u128) * (k as u128) * (k.saturating_sub(1) as u128) / 2 * perms_n_k;
        if budget > max_brute_force as u128 {
            break;
        }
        k += 1;
    }
    k.saturating_sub(1).max(1).min(n)
}

/// Partial search for `n > max_brute_force_filters`: brute force the first
/// `k` positions, then greedily append the remaining filters one at a time,
/// each time picking whichever unused filter minimizes the incremental
/// cost of the order built so far.
fn brute_force_some(filters: &[Filter], max_brute_force: usize) -> DbResult<Plan> {
    let n = filters.len();
    let k = brute_force_prefix_len(n, max_brute_force);

    let all: Vec<usize> = (0..n).collect();
    let started = Instant::now();
    let mut best_prefix: Option<(f64, Vec<usize>)> = None;
    let mut count = 0u64;

    for_each_k_permutation(&all, k, |prefix| {
        count += 1;
        // Cost of the prefix alone, ignoring the filters not yet placed;
        // a lower bound that's consistent enough to rank prefixes by.
        match calculate_cost(prefix, filters) {
            Ok((cost, _)) => {
                if best_prefix.as_ref().map(|(c, _)| cost < *c).unwrap_or(true) {
                    best_prefix = Some((cost, prefix.to_vec()));
                }
            }
            Err(_) => {}
        }
        can_stop(count, best_prefix.as_ref().map(|(c, _)| *c).unwrap_or(-1.0), started)
    });

    let mut order = best_prefix
        .map(|(_, p)| p)
        .unwrap_or_else(|| all[..k].to_vec());

    let mut remaining: Vec<usize> = all.into_iter().filter(|i| !order.contains(i)).collect();
    while !remaining.is_empty() {
        let mut best_choice: Option<(f64, usize)> = None;
        for &candidate in &remaining {
            let mut trial = order.clone();
            trial.push(candidate);
            if let Ok((cost, _)) = calculate_cost(&trial, filters) {
                if best_choice.as_ref().map(|(c, _)| cost < *c).unwrap_or(true) {
                    best_choice = Some((cost, candidate));
                }
            }
        }
        let (_, chosen) = best_choice
            .ok_or_else(|| DbError::Optimizer("greedy fill found no usable filter".into()))?;
        order.push(chosen);
        remaining.retain(|&i| i != chosen);
    }

    let (cost, items) = calculate_cost(&order, filters)?;
    Ok(Plan { order, items, cost })
}

/// Calls `visit` with every ordered `k`-subset (as a full-length prefix
/// vector) drawn from `items`, stopping once it returns `true`.
fn for_each_k_permutation(items: &[usize], k: usize, mut visit: impl FnMut(&[usize]) -> bool) {
    fn recurse(
        items: &[usize],
        k: usize,
        chosen: &mut Vec<usize>,
        used: &mut Vec<bool>,
        visit: &mut dyn FnMut(&[usize]) -> bool,
    ) -> bool {
        if chosen.len() == k {
            return visit(chosen);
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            chosen.push(items[i]);
            if recurse(items, k, chosen, used, visit) {
                return true;
            }
            chosen.pop();
            used[i] = false;
        }
        false
    }
    let mut chosen = Vec::with_capacity(k);
    let mut used = vec![false; items.len()];
    recurse(items, k, &mut chosen, &mut used, &mut visit);
}

/// Spec §4.9's `calculateGenetic`: refines a starting order for up to
/// `max_genetic_iterations` rounds. Every 128th round reseeds by shuffling
/// the whole order from scratch; otherwise it swaps two positions that
/// haven't been swapped since the last improvement (tracked in
/// `switched`), keeping the swap whenever it lowers cost and resetting the
/// tracked-switches set when it does.
fn calculate_genetic(
    filters: &[Filter],
    mut order: Vec<usize>,
    mut best_cost: f64,
    max_iterations: usize,
    rng: &mut impl Rng,
) -> DbResult<(Vec<usize>, f64)> {
    let n = order.len();
    if n < 2 {
        return Ok((order, best_cost));
    }
    let mut switched: HashSet<(usize, usize)> = HashSet::new();

    for iteration in 1..=max_iterations {
        let mut candidate = order.clone();
        if iteration % STOP_CHECK_INTERVAL as usize == 0 {
            candidate.shuffle(rng);
            switched.clear();
        } else {
            let (i, j) = pick_unswitched_pair(n, &switched, rng);
            candidate.swap(i, j);
        }

        let (cost, _) = calculate_cost(&candidate, filters)?;
        if cost < best_cost {
            best_cost = cost;
            order = candidate;
            switched.clear();
        }
    }
    Ok((order, best_cost))
}

/// Picks a position pair not already recorded in `switched`, marking it
/// before returning so the same pair isn't retried until the next
/// improvement clears the set. Falls back to any distinct pair once every
/// pair has been tried (an `n`-filter order has only `n*(n-1)/2` pairs).
fn pick_unswitched_pair(
    n: usize,
    switched: &HashSet<(usize, usize)>,
    rng: &mut impl Rng,
) -> (usize, usize) {
    let total_pairs = n * (n - 1) / 2;
    for _ in 0..total_pairs.max(1) * 4 {
        let i = rng.gen_range(0..n);
        let mut j = rng.gen_range(0..n);
        while j == i {
            j = rng.gen_range(0..n);
        }
        let key = (i.min(j), i.max(j));
        if !switched.contains(&key) {
            return (i, j);
        }
    }
    let i = rng.gen_range(0..n);
    let mut j = rng.gen_range(0..n);
    while j == i {
        j = rng.gen_range(0..n);
    }
    (i, j)
}

/// Entry point: choose a filter order and per-filter index for `filters`.
///
/// `force_join_order` (spec's `FORCE_JOIN_ORDER` setting) skips the search
/// entirely and costs the input order as given — callers set this when a
/// query hint pins the join order. `rng` drives the genetic search's
/// reseed-shuffle and position swaps; pass a seeded `rand::rngs::StdRng`
/// for reproducible plans (invariant 5).
pub fn optimize(
    filters: &[Filter],
    force_join_order: bool,
    config: &Config,
    rng: &mut impl Rng,
) -> DbResult<Plan> {
    if filters.is_empty() {
        return Err(DbError::Optimizer("cannot plan zero filters".into()));
    }
    let n = filters.len();

    let plan = if force_join_order || n == 1 {
        let order: Vec<usize> = (0..n).collect();
        let (cost, items) = calculate_cost(&order, filters)?;
        Plan { order, items, cost }
    } else if n <= config.max_brute_force_filters {
        brute_force_all(filters)?
    } else {
        log::debug!(
            "optimizer: {} filters exceeds max_brute_force_filters ({}), \
             falling back to partial brute force + genetic search",
            n,
            config.max_brute_force_filters
        );
        let partial = brute_force_some(filters, config.max_brute_force)?;
        let (order, cost) = calculate_genetic(
            filters,
            partial.order,
            partial.cost,
            config.max_genetic_iterations,
            rng,
        )?;
        let (_, items) = calculate_cost(&order, filters)?;
        Plan { order, items, cost }
    };

    plan.remove_unusable_index_conditions();
    Ok(plan)
}
