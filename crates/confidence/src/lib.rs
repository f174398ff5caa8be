use fit::RefinedGroup;
use geom_core::{kd_key, point_in_polygon, CandidateMesh, FaceConfidence, FaceId, PlaneFrame};
use nalgebra::{Point2, Point3};
use params::ScaledTolerances;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound on coverage cells per face; larger faces get coarser cells.
const MAX_COVERAGE_CELLS: f64 = 250_000.0;
/// Points sampled when estimating the spacing of a group.
const SPACING_SAMPLES: usize = 2_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfidenceError {
    #[error("candidate mesh has {planes} planes but {groups} groups were given")]
    PlaneMismatch { planes: usize, groups: usize },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceReport {
    pub faces: usize,
    pub supported_faces: usize,
    pub total_points: usize,
    pub mean_fitting: f64,
    pub mean_coverage: f64,
}

/// Inliers of one group that are close enough to its plane to support faces,
/// flattened into the plane frame.
struct GroupSupport {
    frame: PlaneFrame,
    points: Vec<Point2<f64>>,
    weights: Vec<f64>,
    cell: f64,
}

/// Median nearest-neighbour distance among a group's points, from a strided
/// sample. `None` when fewer than two points are given.
pub fn sampling_spacing(points: &[Point3<f64>], indices: &[usize]) -> Option<f64> {
    if indices.len() < 2 {
        return None;
    }
    let mut kdtree: kiddo::KdTree<f64, 3> = kiddo::KdTree::new();
    for &i in indices {
        kdtree.add(&kd_key(&points[i]), i as u64);
    }
    let stride = (indices.len() / SPACING_SAMPLES).max(1);
    let mut distances: Vec<f64> = indices
        .iter()
        .step_by(stride)
        .filter_map(|&i| {
            kdtree
                .nearest_n::<kiddo::SquaredEuclidean>(&kd_key(&points[i]), 2)
                .get(1)
                .map(|n| n.distance.sqrt())
        })
        .collect();
    if distances.is_empty() {
        return None;
    }
    distances.sort_by(f64::total_cmp);
    Some(distances[distances.len() / 2])
}

fn group_support(points: &[Point3<f64>], group: &RefinedGroup, tol: &ScaledTolerances) -> GroupSupport {
    let threshold = (3.0 * group.rms).max(tol.support_distance);
    let frame = PlaneFrame::new(&group.plane);
    let mut flat = Vec::with_capacity(group.indices.len());
    let mut weights = Vec::with_capacity(group.indices.len());
    for &i in &group.indices {
        let p = points[i];
        let d = group.plane.signed_distance(&p).abs();
        if d < threshold {
            flat.push(frame.to_2d(&group.plane.project(&p)));
            weights.push(1.0 - d / threshold);
        }
    }
    let spacing = sampling_spacing(points, &group.indices)
        .filter(|s| *s > tol.epsilon)
        .unwrap_or(tol.support_distance);
    GroupSupport {
        frame,
        points: flat,
        weights,
        cell: spacing * tol.coverage_cell_factor,
    }
}

fn face_confidence(
    mesh: &CandidateMesh,
    face: FaceId,
    support: &GroupSupport,
    total_points: usize,
) -> FaceConfidence {
    let polygon: Vec<Point2<f64>> = mesh
        .face_positions(face)
        .iter()
        .map(|p| support.frame.to_2d(p))
        .collect();
    let (mut lo, mut hi) = (polygon[0], polygon[0]);
    for p in &polygon {
        lo = lo.inf(p);
        hi = hi.sup(p);
    }
    let extent = hi - lo;
    let mut cell = support.cell;
    if (extent.x / cell) * (extent.y / cell) > MAX_COVERAGE_CELLS {
        cell = (extent.x * extent.y / MAX_COVERAGE_CELLS).sqrt();
    }
    let cols = ((extent.x / cell) - 1e-9).ceil().max(1.0) as usize;
    let rows = ((extent.y / cell) - 1e-9).ceil().max(1.0) as usize;
    let mut occupied = vec![false; cols * rows];

    let mut fitting = 0.0;
    let mut supporting = 0usize;
    for (p, w) in support.points.iter().zip(&support.weights) {
        if p.x < lo.x || p.y < lo.y || p.x > hi.x || p.y > hi.y {
            continue;
        }
        if !point_in_polygon(p, &polygon) {
            continue;
        }
        fitting += w;
        supporting += 1;
        let col = (((p.x - lo.x) / cell) as usize).min(cols - 1);
        let row = (((p.y - lo.y) / cell) as usize).min(rows - 1);
        occupied[row * cols + col] = true;
    }
    if supporting == 0 {
        return FaceConfidence::unsupported();
    }

    let (mut inside, mut covered) = (0usize, 0usize);
    for row in 0..rows {
        for col in 0..cols {
            let centre = Point2::new(
                lo.x + (col as f64 + 0.5) * cell,
                lo.y + (row as f64 + 0.5) * cell,
            );
            if point_in_polygon(&centre, &polygon) {
                inside += 1;
                covered += usize::from(occupied[row * cols + col]);
            }
        }
    }
    // faces narrower than one cell have no cell centre inside them; fall back
    // to the occupied share of the cells spanning the face
    let coverage = if inside == 0 {
        occupied.iter().filter(|&&o| o).count() as f64 / occupied.len() as f64
    } else {
        covered as f64 / inside as f64
    };
    FaceConfidence {
        fitting: fitting / total_points.max(1) as f64,
        coverage: coverage.clamp(0.0, 1.0),
        supporting_points: supporting,
    }
}

/// Scores every candidate face against the inliers of its supporting group
/// and stores the result on the face.
pub fn evaluate_confidences(
    mesh: &mut CandidateMesh,
    points: &[Point3<f64>],
    groups: &[RefinedGroup],
    tol: &ScaledTolerances,
) -> Result<ConfidenceReport, ConfidenceError> {
    if mesh.planes.len() != groups.len() {
        return Err(ConfidenceError::PlaneMismatch {
            planes: mesh.planes.len(),
            groups: groups.len(),
        });
    }
    let total_points: usize = groups.iter().map(|g| g.indices.len()).sum();
    let supports: Vec<GroupSupport> = groups
        .par_iter()
        .map(|group| group_support(points, group, tol))
        .collect();
    for (idx, support) in supports.iter().enumerate() {
        debug!(
            group = idx,
            supporting = support.points.len(),
            cell = support.cell,
            "group support prepared"
        );
    }

    let snapshot: &CandidateMesh = mesh;
    let scores: Vec<FaceConfidence> = (0..snapshot.face_count())
        .into_par_iter()
        .map(|face| {
            let plane = snapshot.faces[face].plane;
            face_confidence(snapshot, face, &supports[plane], total_points)
        })
        .collect();

    let mut report = ConfidenceReport {
        faces: scores.len(),
        total_points,
        ..ConfidenceReport::default()
    };
    for (face, score) in mesh.faces.iter_mut().zip(scores) {
        if score.supporting_points > 0 {
            report.supported_faces += 1;
        }
        report.mean_fitting += score.fitting;
        report.mean_coverage += score.coverage;
        face.confidence = Some(score);
    }
    if report.faces > 0 {
        report.mean_fitting /= report.faces as f64;
        report.mean_coverage /= report.faces as f64;
    }
    info!(
        faces = report.faces,
        supported = report.supported_faces,
        mean_fitting = report.mean_fitting,
        mean_coverage = report.mean_coverage,
        "face confidences evaluated"
    );
    Ok(report)
}
