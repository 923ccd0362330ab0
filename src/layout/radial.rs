//! Radial breadth-first layout
//!
//! The highest-degree node sits at the origin. Each node spreads its
//! unplaced neighbors evenly across an angular budget; a child's own budget
//! points away from the neighbors it already has, skipping an 80 degree
//! window around each of them. Edge length shrinks by 0.8 per level.
//! Nodes not reachable from the root go on an outer circle.

use std::collections::VecDeque;

use super::{Adjacency, Positions};

pub const DEFAULT_BASE_DISTANCE: f64 = 2.0;

/// Width of the window kept clear around an existing neighbor, in degrees
const EXCLUSION_DEGREES: f64 = 80.0;
const LEVEL_SHRINK: f64 = 0.8;
/// Half-width of a lone child's budget, in degrees
const SINGLE_CHILD_HALF_SPREAD: f64 = 150.0;

type Arc = (f64, f64);

pub fn radial_layout(nodes: &[String], edges: &[(String, String)], base: f64) -> Positions {
    let adj = Adjacency::new(nodes, edges);
    let n = adj.len();
    if n == 0 {
        return Positions::new();
    }

    // Highest degree wins; names are sorted so the first maximum is the
    // smallest name
    let root = (0..n)
        .rev()
        .max_by_key(|&i| adj.neighbors[i].len())
        .unwrap_or(0);

    let mut pos: Vec<Option<(f64, f64)>> = vec![None; n];
    let mut visited = vec![false; n];
    pos[root] = Some((0.0, 0.0));
    visited[root] = true;

    let mut queue: VecDeque<(usize, usize, Arc)> = VecDeque::new();
    queue.push_back((root, 0, (0.0, 360.0)));

    while let Some((current, level, budget)) = queue.pop_front() {
        let children: Vec<usize> = adj.neighbors[current]
            .iter()
            .copied()
            .filter(|&c| !visited[c])
            .collect();
        if children.is_empty() {
            continue;
        }
        for &child in &children {
            visited[child] = true;
        }

        let Some(origin) = pos[current] else {
            continue;
        };
        let distance = base * LEVEL_SHRINK.powi(level as i32);
        for (child, angle) in children.iter().zip(spread(budget, children.len())) {
            let rad = angle.to_radians();
            pos[*child] = Some((origin.0 + distance * rad.cos(), origin.1 + distance * rad.sin()));
        }

        for (index, &child) in children.iter().enumerate() {
            let child_budget = child_budget(&adj, &pos, child, index, children.len());
            queue.push_back((child, level + 1, child_budget));
        }
    }

    let stray: Vec<usize> = (0..n).filter(|&i| pos[i].is_none()).collect();
    for (k, &i) in stray.iter().enumerate() {
        let angle = (k as f64 * 360.0 / stray.len() as f64).to_radians();
        pos[i] = Some((2.0 * base * angle.cos(), 2.0 * base * angle.sin()));
    }

    adj.names
        .into_iter()
        .zip(pos)
        .map(|(name, p)| (name, p.unwrap_or((0.0, 0.0))))
        .collect()
}

/// `count` angles evenly inside `budget`, excluding its endpoints
fn spread((start, end): Arc, count: usize) -> Vec<f64> {
    if end - start < 1.0 {
        return vec![start; count];
    }
    let step = (end - start) / (count + 1) as f64;
    (1..=count).map(|i| start + i as f64 * step).collect()
}

/// Direction in degrees `[0, 360)` from `from` to `to`
fn bearing(from: (f64, f64), to: (f64, f64)) -> f64 {
    (to.1 - from.1).atan2(to.0 - from.0).to_degrees().rem_euclid(360.0)
}

/// Circular mean of angles in degrees
fn circular_mean(angles: &[f64]) -> f64 {
    let (sx, sy) = angles.iter().fold((0.0, 0.0), |(sx, sy), a| {
        let r = a.to_radians();
        (sx + r.cos(), sy + r.sin())
    });
    if sx.abs() < 1e-12 && sy.abs() < 1e-12 {
        return angles.first().copied().unwrap_or(0.0);
    }
    sy.atan2(sx).to_degrees().rem_euclid(360.0)
}

/// Arcs of the circle left after clearing a window around each angle.
///
/// Arcs are `(start, end)` with `end > start`; one may extend past 360.
fn free_arcs(occupied: &[f64], width: f64) -> Vec<Arc> {
    let mut blocked: Vec<Arc> = Vec::new();
    for &angle in occupied {
        let start = (angle - width / 2.0).rem_euclid(360.0);
        let end = start + width;
        if end > 360.0 {
            blocked.push((start, 360.0));
            blocked.push((0.0, end - 360.0));
        } else {
            blocked.push((start, end));
        }
    }
    blocked.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut merged: Vec<Arc> = Vec::new();
    for arc in blocked {
        match merged.last_mut() {
            Some(last) if arc.0 <= last.1 => last.1 = last.1.max(arc.1),
            _ => merged.push(arc),
        }
    }

    let mut free = Vec::new();
    let mut cursor = 0.0;
    for (start, end) in &merged {
        if *start > cursor {
            free.push((cursor, *start));
        }
        cursor = f64::max(cursor, *end);
    }
    if cursor < 360.0 {
        free.push((cursor, 360.0));
    }

    // Join the arcs touching 0 and 360 into one that wraps
    if free.len() > 1 {
        let first = free[0];
        let last = free[free.len() - 1];
        if first.0 == 0.0 && last.1 == 360.0 {
            free.pop();
            free[0] = (last.0, first.1 + 360.0);
        }
    }
    free
}

fn arc_contains((start, end): Arc, angle: f64) -> bool {
    (start..=end).contains(&angle) || (start..=end).contains(&(angle + 360.0))
}

fn angular_gap(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Budget for the `index`-th of `total` children of one parent
fn child_budget(
    adj: &Adjacency,
    pos: &[Option<(f64, f64)>],
    child: usize,
    index: usize,
    total: usize,
) -> Arc {
    let Some(origin) = pos[child] else {
        return (0.0, 360.0);
    };
    let placed: Vec<f64> = adj.neighbors[child]
        .iter()
        .filter_map(|&peer| pos[peer])
        .map(|p| bearing(origin, p))
        .collect();

    if placed.is_empty() {
        let size = 360.0 / total.max(1) as f64;
        return (index as f64 * size, (index + 1) as f64 * size);
    }

    let outward = (circular_mean(&placed) + 180.0).rem_euclid(360.0);
    if total <= 1 {
        return (
            outward - SINGLE_CHILD_HALF_SPREAD,
            outward + SINGLE_CHILD_HALF_SPREAD,
        );
    }

    let arcs = free_arcs(&placed, EXCLUSION_DEGREES);
    let best = arcs
        .iter()
        .copied()
        .find(|&arc| arc_contains(arc, outward))
        .or_else(|| {
            arcs.iter().copied().min_by(|a, b| {
                let ca = angular_gap((a.0 + a.1) / 2.0, outward);
                let cb = angular_gap((b.0 + b.1) / 2.0, outward);
                ca.total_cmp(&cb)
            })
        })
        .unwrap_or((outward - 90.0, outward + 90.0));

    let size = (best.1 - best.0) / total as f64;
    (best.0 + index as f64 * size, best.0 + (index + 1) as f64 * size)
}
