//! Kamada-Kawai stress minimization
//!
//! Springs between every pair of nodes with rest length proportional to
//! their hop distance. Nodes are moved one at a time, always the one with
//! the largest energy gradient, by Newton-Raphson steps. Starts from a
//! circle so the result is deterministic.

use std::f64::consts::TAU;

use super::{Adjacency, Positions};

const EPSILON: f64 = 1e-4;
const MAX_OUTER_ITERATIONS_PER_NODE: usize = 50;
const MAX_INNER_ITERATIONS: usize = 50;

pub fn kamada_kawai_layout(nodes: &[String], edges: &[(String, String)]) -> Positions {
    let adj = Adjacency::new(nodes, edges);
    let n = adj.len();
    match n {
        0 => return Positions::new(),
        1 => return Positions::from([(adj.names[0].clone(), (0.0, 0.0))]),
        _ => {}
    }

    let dist = distance_matrix(&adj);
    // Rest lengths fill the unit square; stiffness falls with distance
    let max_dist = dist.iter().flatten().cloned().fold(1.0, f64::max);
    let unit = 1.0 / max_dist;
    let length = |i: usize, j: usize| unit * dist[i][j];
    let stiffness = |i: usize, j: usize| 1.0 / (dist[i][j] * dist[i][j]);

    let mut pos: Vec<(f64, f64)> = (0..n)
        .map(|i| {
            let angle = TAU * i as f64 / n as f64;
            (angle.cos(), angle.sin())
        })
        .collect();

    let gradient = |pos: &[(f64, f64)], m: usize| -> (f64, f64) {
        let (xm, ym) = pos[m];
        let mut gx = 0.0;
        let mut gy = 0.0;
        for i in (0..n).filter(|&i| i != m) {
            let dx = xm - pos[i].0;
            let dy = ym - pos[i].1;
            let d = (dx * dx + dy * dy).sqrt().max(1e-9);
            let k = stiffness(m, i);
            let l = length(m, i);
            gx += k * (dx - l * dx / d);
            gy += k * (dy - l * dy / d);
        }
        (gx, gy)
    };
    let magnitude = |(gx, gy): (f64, f64)| (gx * gx + gy * gy).sqrt();

    for _ in 0..MAX_OUTER_ITERATIONS_PER_NODE * n {
        let Some((m, delta)) = (0..n)
            .map(|m| (m, magnitude(gradient(&pos, m))))
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            break;
        };
        if delta < EPSILON {
            break;
        }

        for _ in 0..MAX_INNER_ITERATIONS {
            let (gx, gy) = gradient(&pos, m);
            if magnitude((gx, gy)) < EPSILON {
                break;
            }
            let (xm, ym) = pos[m];
            let (mut hxx, mut hxy, mut hyy) = (0.0, 0.0, 0.0);
            for i in (0..n).filter(|&i| i != m) {
                let dx = xm - pos[i].0;
                let dy = ym - pos[i].1;
                let d = (dx * dx + dy * dy).sqrt().max(1e-9);
                let d3 = d * d * d;
                let k = stiffness(m, i);
                let l = length(m, i);
                hxx += k * (1.0 - l * dy * dy / d3);
                hxy += k * (l * dx * dy / d3);
                hyy += k * (1.0 - l * dx * dx / d3);
            }
            let det = hxx * hyy - hxy * hxy;
            if det.abs() < 1e-12 {
                break;
            }
            let step_x = (-gx * hyy + gy * hxy) / det;
            let step_y = (gx * hxy - gy * hxx) / det;
            pos[m] = (xm + step_x, ym + step_y);
        }
    }

    rescale(&mut pos);
    adj.names.into_iter().zip(pos).collect()
}

/// All-pairs hop distances; unreachable pairs sit one hop beyond the
/// longest finite distance
fn distance_matrix(adj: &Adjacency) -> Vec<Vec<f64>> {
    let hops: Vec<Vec<Option<usize>>> = (0..adj.len()).map(|i| adj.bfs_distances(i)).collect();
    let longest = hops.iter().flatten().flatten().copied().max().unwrap_or(0);
    let disconnected = (longest + 1) as f64;
    hops.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|d| d.map(|d| d as f64).unwrap_or(disconnected))
                .collect()
        })
        .collect()
}

/// Center on the mean and scale the largest coordinate to 1
fn rescale(pos: &mut [(f64, f64)]) {
    let n = pos.len() as f64;
    let (cx, cy) = pos
        .iter()
        .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
    let (cx, cy) = (cx / n, cy / n);
    let mut extent: f64 = 0.0;
    for p in pos.iter_mut() {
        p.0 -= cx;
        p.1 -= cy;
        extent = extent.max(p.0.abs()).max(p.1.abs());
    }
    if extent > 0.0 {
        for p in pos.iter_mut() {
            p.0 /= extent;
            p.1 /= extent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(ns: &[&str]) -> Vec<String> {
        ns.iter().map(|s| s.to_string()).collect()
    }

    fn edges(es: &[(&str, &str)]) -> Vec<(String, String)> {
        es.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    fn distance(p: (f64, f64), q: (f64, f64)) -> f64 {
        ((p.0 - q.0).powi(2) + (p.1 - q.1).powi(2)).sqrt()
    }

    #[test]
    fn test_trivial_graphs() {
        assert!(kamada_kawai_layout(&[], &[]).is_empty());
        let one = kamada_kawai_layout(&names(&["r1"]), &[]);
        assert_eq!(one["r1"], (0.0, 0.0));
    }

    #[test]
    fn test_result_is_within_unit_box() {
        let nodes = names(&["r1", "sw1", "sw2", "host1", "host2", "fw1"]);
        let links = edges(&[
            ("r1", "sw1"),
            ("r1", "sw2"),
            ("sw1", "host1"),
            ("sw2", "host2"),
            ("sw2", "fw1"),
        ]);
        let positions = kamada_kawai_layout(&nodes, &links);
        assert_eq!(positions.len(), 6);
        let extent = positions
            .values()
            .map(|(x, y)| x.abs().max(y.abs()))
            .fold(0.0, f64::max);
        assert!((extent - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic() {
        let nodes = names(&["a", "b", "c", "d"]);
        let links = edges(&[("a", "b"), ("b", "c"), ("c", "d"), ("d", "a")]);
        assert_eq!(
            kamada_kawai_layout(&nodes, &links),
            kamada_kawai_layout(&nodes, &links)
        );
    }

    #[test]
    fn test_path_ends_are_farthest_apart() {
        let nodes = names(&["a", "b", "c"]);
        let links = edges(&[("a", "b"), ("b", "c")]);
        let p = kamada_kawai_layout(&nodes, &links);
        let ends = distance(p["a"], p["c"]);
        assert!(ends > distance(p["a"], p["b"]));
        assert!(ends > distance(p["b"], p["c"]));
    }

    #[test]
    fn test_disconnected_nodes_are_placed() {
        let nodes = names(&["a", "b", "c"]);
        let links = edges(&[("a", "b")]);
        let p = kamada_kawai_layout(&nodes, &links);
        assert_eq!(p.len(), 3);
        assert!(p.values().all(|(x, y)| x.is_finite() && y.is_finite()));
    }
}
