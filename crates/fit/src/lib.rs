use std::collections::{HashMap, HashSet};

use cloud_io::PointCloud;
use geom_core::{kd_key, Plane};
use nalgebra::{Matrix3, Point3, SymmetricEigen, Vector3};
use params::ScaledTolerances;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefineError {
    #[error("point cloud has no planar groups")]
    NoGroups,
    #[error("none of the {input} planar groups survived refinement")]
    NoUsableGroups { input: usize },
    #[error("group `{group}` references point {index}, but the cloud has {points} points")]
    IndexOutOfRange {
        group: String,
        index: usize,
        points: usize,
    },
}

/// Least-squares plane through a point set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PlaneFit {
    pub plane: Plane,
    pub centroid: Point3<f64>,
    pub rms: f64,
}

/// A planar group after refinement: point-disjoint from every other group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefinedGroup {
    pub label: String,
    pub indices: Vec<usize>,
    pub plane: Plane,
    pub rms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefineReport {
    pub input_groups: usize,
    pub reassigned_points: usize,
    pub dropped_small: usize,
    pub dropped_residual: usize,
    pub merged: usize,
    pub output_groups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refinement {
    pub groups: Vec<RefinedGroup>,
    pub report: RefineReport,
}

pub fn fit_plane(points: &[Point3<f64>]) -> Option<PlaneFit> {
    if points.len() < 3 {
        return None;
    }
    let centroid = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords)
        / points.len() as f64;
    let mut cov = Matrix3::zeros();
    for p in points {
        let v = p.coords - centroid;
        cov += v * v.transpose();
    }
    let eigen = SymmetricEigen::new(cov);
    let idx = smallest_index(&eigen.eigenvalues);
    // two vanishing eigenvalues: the points are collinear
    let mut sorted = [
        eigen.eigenvalues[0],
        eigen.eigenvalues[1],
        eigen.eigenvalues[2],
    ];
    sorted.sort_by(f64::total_cmp);
    if sorted[1] <= 1e-12 * sorted[2].max(f64::MIN_POSITIVE) {
        return None;
    }
    let normal: Vector3<f64> = eigen.eigenvectors.column(idx).into_owned();
    let centroid = Point3::from(centroid);
    let plane = Plane::from_point_normal(&centroid, &normal)?;
    let sum_sq: f64 = points
        .iter()
        .map(|p| plane.signed_distance(p).powi(2))
        .sum();
    Some(PlaneFit {
        plane,
        centroid,
        rms: (sum_sq / points.len() as f64).sqrt(),
    })
}

/// Least-squares fit, falling back to a supplied plane when the points are
/// too few or collinear. The residual is measured against whichever plane is
/// used.
pub fn fit_plane_or_hint(points: &[Point3<f64>], hint: Option<&Plane>) -> Option<PlaneFit> {
    if let Some(fit) = fit_plane(points) {
        return Some(fit);
    }
    let plane = *hint?;
    if points.is_empty() {
        return None;
    }
    let centroid = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords)
        / points.len() as f64;
    let sum_sq: f64 = points
        .iter()
        .map(|p| plane.signed_distance(p).powi(2))
        .sum();
    Some(PlaneFit {
        plane,
        centroid: Point3::from(centroid),
        rms: (sum_sq / points.len() as f64).sqrt(),
    })
}

fn smallest_index(values: &Vector3<f64>) -> usize {
    let mut idx = 0;
    let mut min = values[0];
    if values[1] < min {
        min = values[1];
        idx = 1;
    }
    if values[2] < min {
        idx = 2;
    }
    idx
}

fn gather(cloud: &PointCloud, indices: &[usize]) -> Vec<Point3<f64>> {
    indices.iter().map(|&i| cloud.points[i]).collect()
}

#[derive(Debug, Clone)]
struct WorkingGroup {
    id: usize,
    label: String,
    indices: Vec<usize>,
    hint: Option<Plane>,
    fit: Option<PlaneFit>,
}

impl WorkingGroup {
    fn refit(&mut self, cloud: &PointCloud) {
        self.fit = fit_plane_or_hint(&gather(cloud, &self.indices), self.hint.as_ref());
    }
}

/// Fits, deduplicates, filters and merges the input groups.
pub fn refine_groups(
    cloud: &PointCloud,
    tolerances: &ScaledTolerances,
) -> Result<Refinement, RefineError> {
    if cloud.groups.is_empty() {
        return Err(RefineError::NoGroups);
    }
    for group in &cloud.groups {
        if let Some(&index) = group.indices.iter().find(|&&i| i >= cloud.points.len()) {
            return Err(RefineError::IndexOutOfRange {
                group: group.label.clone(),
                index,
                points: cloud.points.len(),
            });
        }
    }
    let mut report = RefineReport {
        input_groups: cloud.groups.len(),
        ..RefineReport::default()
    };

    let mut groups: Vec<WorkingGroup> = cloud
        .groups
        .par_iter()
        .enumerate()
        .map(|(id, group)| {
            let mut indices = group.indices.clone();
            indices.sort_unstable();
            indices.dedup();
            let hint = group
                .plane
                .and_then(|[a, b, c, d]| Plane::new(Vector3::new(a, b, c), d));
            let fit = fit_plane_or_hint(&gather(cloud, &indices), hint.as_ref());
            WorkingGroup {
                id,
                label: group.label.clone(),
                indices,
                hint,
                fit,
            }
        })
        .collect();

    report.reassigned_points = make_disjoint(cloud, &mut groups);

    let before = groups.len();
    groups.retain(|group| {
        let keep = group.indices.len() >= tolerances.min_inliers && group.fit.is_some();
        if !keep {
            warn!(
                label = %group.label,
                inliers = group.indices.len(),
                "dropping group with too few inliers"
            );
        }
        keep
    });
    report.dropped_small = before - groups.len();

    let before = groups.len();
    groups.retain(|group| {
        let rms = group.fit.map_or(f64::INFINITY, |fit| fit.rms);
        let keep = rms <= tolerances.max_rms;
        if !keep {
            warn!(label = %group.label, rms, "dropping group with excessive residual");
        }
        keep
    });
    report.dropped_residual = before - groups.len();

    report.merged = merge_coplanar(cloud, &mut groups, tolerances);

    let mut refined: Vec<RefinedGroup> = groups
        .into_iter()
        .filter_map(|group| {
            let fit = group.fit?;
            Some(RefinedGroup {
                label: group.label,
                indices: group.indices,
                plane: fit.plane,
                rms: fit.rms,
            })
        })
        .collect();
    refined.sort_by(|a, b| {
        b.indices
            .len()
            .cmp(&a.indices.len())
            .then(a.indices.first().cmp(&b.indices.first()))
    });

    if refined.is_empty() {
        return Err(RefineError::NoUsableGroups {
            input: report.input_groups,
        });
    }
    report.output_groups = refined.len();
    info!(
        input = report.input_groups,
        output = report.output_groups,
        merged = report.merged,
        reassigned = report.reassigned_points,
        "refined planar groups"
    );
    Ok(Refinement {
        groups: refined,
        report,
    })
}

/// Gives each point claimed by several groups to the group whose plane is
/// closest. Returns the number of points removed from some group.
fn make_disjoint(cloud: &PointCloud, groups: &mut [WorkingGroup]) -> usize {
    let mut owners: HashMap<usize, Vec<usize>> = HashMap::new();
    for (gid, group) in groups.iter().enumerate() {
        for &idx in &group.indices {
            owners.entry(idx).or_default().push(gid);
        }
    }
    let mut winner: HashMap<usize, usize> = HashMap::new();
    for (&idx, claimants) in &owners {
        if claimants.len() < 2 {
            continue;
        }
        let point = cloud.points[idx];
        let best = claimants
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let da = groups[a]
                    .fit
                    .map_or(f64::INFINITY, |f| f.plane.signed_distance(&point).abs());
                let db = groups[b]
                    .fit
                    .map_or(f64::INFINITY, |f| f.plane.signed_distance(&point).abs());
                da.total_cmp(&db).then(a.cmp(&b))
            })
            .unwrap_or(claimants[0]);
        winner.insert(idx, best);
    }
    if winner.is_empty() {
        return 0;
    }
    let mut removed = 0usize;
    for (gid, group) in groups.iter_mut().enumerate() {
        let before = group.indices.len();
        group
            .indices
            .retain(|idx| winner.get(idx).map_or(true, |&w| w == gid));
        if group.indices.len() != before {
            removed += before - group.indices.len();
            group.refit(cloud);
        }
    }
    debug!(shared = winner.len(), removed, "resolved shared points");
    removed
}

fn build_kdtree(cloud: &PointCloud, indices: &[usize]) -> kiddo::KdTree<f64, 3> {
    let mut kdtree = kiddo::KdTree::new();
    for &i in indices {
        kdtree.add(&kd_key(&cloud.points[i]), i as u64);
    }
    kdtree
}

/// Checks whether `small` should be folded into `large`; returns the angle
/// between their planes when it should.
fn merge_score(
    cloud: &PointCloud,
    large: &WorkingGroup,
    small: &WorkingGroup,
    tolerances: &ScaledTolerances,
) -> Option<f64> {
    let (lf, sf) = (large.fit?, small.fit?);
    let angle = lf.plane.angle_to(&sf.plane);
    if angle > tolerances.merge_angle_rad {
        return None;
    }
    let close = small
        .indices
        .iter()
        .filter(|&&i| lf.plane.signed_distance(&cloud.points[i]).abs() <= tolerances.merge_distance)
        .count();
    if (close as f64) < tolerances.merge_min_fraction * small.indices.len() as f64 {
        return None;
    }
    let kdtree = build_kdtree(cloud, &large.indices);
    let limit = tolerances.adjacency_distance * tolerances.adjacency_distance;
    let adjacent = small.indices.iter().any(|&i| {
        kdtree
            .nearest_one::<kiddo::SquaredEuclidean>(&kd_key(&cloud.points[i]))
            .distance
            <= limit
    });
    adjacent.then_some(angle)
}

fn merge_coplanar(
    cloud: &PointCloud,
    groups: &mut Vec<WorkingGroup>,
    tolerances: &ScaledTolerances,
) -> usize {
    let mut merged = 0usize;
    let mut blocked: HashSet<(usize, usize)> = HashSet::new();
    loop {
        groups.sort_by(|a, b| b.indices.len().cmp(&a.indices.len()).then(a.id.cmp(&b.id)));
        let pairs: Vec<(usize, usize)> = (0..groups.len())
            .flat_map(|i| ((i + 1)..groups.len()).map(move |j| (i, j)))
            .filter(|&(i, j)| !blocked.contains(&(groups[i].id, groups[j].id)))
            .collect();
        let snapshot: &[WorkingGroup] = groups;
        let best = pairs
            .par_iter()
            .filter_map(|&(i, j)| {
                merge_score(cloud, &snapshot[i], &snapshot[j], tolerances).map(|a| (a, i, j))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then((a.1, a.2).cmp(&(b.1, b.2))));
        let Some((angle, i, j)) = best else {
            break;
        };

        let mut indices = groups[i].indices.clone();
        indices.extend_from_slice(&groups[j].indices);
        indices.sort_unstable();
        let fit = fit_plane(&gather(cloud, &indices));
        if fit.map_or(true, |f| f.rms > tolerances.max_rms) {
            debug!(
                a = %groups[i].label,
                b = %groups[j].label,
                "merged plane exceeds residual limit, keeping groups apart"
            );
            blocked.insert((groups[i].id, groups[j].id));
            continue;
        }
        debug!(
            into = %groups[i].label,
            from = %groups[j].label,
            angle_deg = angle.to_degrees(),
            "merging coplanar groups"
        );
        groups[i].indices = indices;
        groups[i].fit = fit;
        groups.remove(j);
        merged += 1;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_io::PlanarGroup;
    use params::Tolerances;

    fn grid(n: usize, map: impl Fn(f64, f64) -> Point3<f64>) -> Vec<Point3<f64>> {
        let mut points = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let u = (i as f64 + 0.5) / n as f64;
                let v = (j as f64 + 0.5) / n as f64;
                points.push(map(u, v));
            }
        }
        points
    }

    fn cloud_from(patches: Vec<Vec<Point3<f64>>>) -> PointCloud {
        let mut cloud = PointCloud::new();
        for (idx, patch) in patches.into_iter().enumerate() {
            let start = cloud.points.len();
            cloud.points.extend(patch);
            cloud.groups.push(PlanarGroup {
                label: format!("g{idx}"),
                indices: (start..cloud.points.len()).collect(),
                plane: None,
            });
        }
        cloud
    }

    fn tolerances() -> ScaledTolerances {
        Tolerances::default().scaled(3f64.sqrt())
    }

    #[test]
    fn fit_plane_recovers_tilted_plane() {
        let points = grid(8, |u, v| Point3::new(u, v, 0.5 * u + 0.25 * v + 1.0));
        let fit = fit_plane(&points).expect("plane fits");
        let expected = Vector3::new(-0.5, -0.25, 1.0).normalize();
        assert!(fit.plane.normal.dot(&expected).abs() > 1.0 - 1e-9);
        assert!(fit.rms < 1e-9);
    }

    #[test]
    fn fit_plane_rejects_collinear_points() {
        let points: Vec<_> = (0..10).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        assert!(fit_plane(&points).is_none());
        assert!(fit_plane(&points[..2]).is_none());
    }

    #[test]
    fn zero_groups_is_an_error() {
        let mut cloud = PointCloud::new();
        cloud.points.push(Point3::origin());
        assert_eq!(
            refine_groups(&cloud, &tolerances()).unwrap_err(),
            RefineError::NoGroups
        );
    }

    #[test]
    fn tiny_group_leaves_nothing_usable() {
        let cloud = cloud_from(vec![vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
        ]]);
        assert_eq!(
            refine_groups(&cloud, &tolerances()).unwrap_err(),
            RefineError::NoUsableGroups { input: 1 }
        );
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut cloud = cloud_from(vec![grid(6, |u, v| Point3::new(u, v, 0.0))]);
        cloud.groups[0].indices.push(1_000_000);
        assert_eq!(
            refine_groups(&cloud, &tolerances()).unwrap_err(),
            RefineError::IndexOutOfRange {
                group: "g0".into(),
                index: 1_000_000,
                points: 36,
            }
        );
    }

    #[test]
    fn collinear_group_falls_back_to_its_given_plane() {
        let line: Vec<_> = (0..12).map(|i| Point3::new(i as f64 / 11.0, 0.0, 0.0)).collect();
        let mut cloud = cloud_from(vec![line]);
        assert_eq!(
            refine_groups(&cloud, &tolerances()).unwrap_err(),
            RefineError::NoUsableGroups { input: 1 }
        );

        cloud.groups[0].plane = Some([0.0, 0.0, 2.0, 0.0]);
        let refined = refine_groups(&cloud, &tolerances()).expect("refined");
        assert_eq!(refined.groups.len(), 1);
        let group = &refined.groups[0];
        assert!((group.plane.normal.z - 1.0).abs() < 1e-12);
        assert!(group.rms < 1e-12);
    }

    #[test]
    fn split_coplanar_patches_are_merged() {
        let left = grid(6, |u, v| Point3::new(0.5 * u, v, 0.0));
        let right = grid(6, |u, v| Point3::new(0.5 + 0.5 * u, v, 0.0));
        let wall = grid(6, |u, v| Point3::new(u, 0.0, v));
        let cloud = cloud_from(vec![left, right, wall]);
        let refined = refine_groups(&cloud, &tolerances()).expect("refined");
        assert_eq!(refined.groups.len(), 2);
        assert_eq!(refined.report.merged, 1);
        assert_eq!(refined.groups[0].indices.len(), 72);
    }

    #[test]
    fn distant_parallel_patches_stay_separate() {
        let floor = grid(6, |u, v| Point3::new(u, v, 0.0));
        let ceiling = grid(6, |u, v| Point3::new(u, v, 1.0));
        let cloud = cloud_from(vec![floor, ceiling]);
        let refined = refine_groups(&cloud, &tolerances()).expect("refined");
        assert_eq!(refined.groups.len(), 2);
        assert_eq!(refined.report.merged, 0);
    }

    #[test]
    fn refined_groups_are_point_disjoint() {
        let floor = grid(6, |u, v| Point3::new(u, v, 0.0));
        let wall = grid(6, |u, v| Point3::new(u, 0.0, v));
        let mut cloud = cloud_from(vec![floor, wall]);
        // the wall also claims three floor points
        cloud.groups[1].indices.extend([0, 1, 2]);
        let refined = refine_groups(&cloud, &tolerances()).expect("refined");
        let mut seen = std::collections::HashSet::new();
        for group in &refined.groups {
            for &idx in &group.indices {
                assert!(seen.insert(idx), "point {idx} owned twice");
            }
        }
        assert_eq!(refined.report.reassigned_points, 3);
    }

    #[test]
    fn noisy_group_is_dropped_but_others_survive() {
        let floor = grid(6, |u, v| Point3::new(u, v, 0.0));
        let blob: Vec<_> = (0..40)
            .map(|i| {
                let t = i as f64;
                Point3::new((t * 0.37).sin(), (t * 0.71).cos(), (t * 1.3).sin())
            })
            .collect();
        let cloud = cloud_from(vec![floor, blob]);
        let refined = refine_groups(&cloud, &tolerances()).expect("refined");
        assert_eq!(refined.groups.len(), 1);
        assert_eq!(refined.report.dropped_residual, 1);
    }
}
