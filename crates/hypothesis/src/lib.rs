use fit::RefinedGroup;
use geom_core::{
    is_simple_polygon, min_interior_angle, polygon_area_2d, split_convex_polygon, BoundingBox,
    CandidateMesh, MeshStats, Plane, PlaneFrame, PlaneId, TopologyError, VertexWelder,
};
use nalgebra::{Point2, Point3};
use params::ScaledTolerances;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Smallest candidate set that can still bound a volume.
pub const MIN_CANDIDATE_FACES: usize = 4;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no planes to intersect")]
    NoPlanes,
    #[error("supporting points have no spatial extent")]
    EmptyBounds,
    #[error("only {found} candidate faces survived, at least {MIN_CANDIDATE_FACES} are required")]
    TooFewFaces { found: usize },
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationReport {
    pub planes: usize,
    pub parallel_pairs: usize,
    pub raw_cells: usize,
    pub tiny_cells: usize,
    pub sliver_cells: usize,
    pub non_simple_cells: usize,
    pub collapsed_cells: usize,
}

/// Candidate complex plus the box it was built in.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub mesh: CandidateMesh,
    pub bounds: BoundingBox,
    pub report: GenerationReport,
    pub stats: MeshStats,
}

#[derive(Debug, Default)]
struct PlaneCells {
    cells: Vec<Vec<Point3<f64>>>,
    parallel: usize,
    raw: usize,
    tiny: usize,
    sliver: usize,
    non_simple: usize,
}

/// Bounding box of every supporting point, before the margin is applied.
pub fn support_bounds(points: &[Point3<f64>], groups: &[RefinedGroup]) -> Option<BoundingBox> {
    BoundingBox::from_points(
        groups
            .iter()
            .flat_map(|group| group.indices.iter())
            .filter_map(|&idx| points.get(idx)),
    )
}

/// Cuts every supporting plane by the traces of all the others inside the
/// margin-enlarged bounding box of the supporting points. Each resulting
/// convex cell becomes a candidate face; cells sharing a boundary segment
/// share the candidate edge.
pub fn generate_candidates(
    points: &[Point3<f64>],
    groups: &[RefinedGroup],
    tol: &ScaledTolerances,
) -> Result<Hypothesis, GenerationError> {
    if groups.is_empty() {
        return Err(GenerationError::NoPlanes);
    }
    let bounds = support_bounds(points, groups)
        .filter(|b| b.diagonal() > tol.epsilon)
        .ok_or(GenerationError::EmptyBounds)?
        .enlarged(tol.bbox_margin);
    let planes: Vec<Plane> = groups.iter().map(|group| group.plane).collect();

    let per_plane: Vec<PlaneCells> = (0..planes.len())
        .into_par_iter()
        .map(|idx| partition_plane(idx, &planes, &bounds, tol))
        .collect();

    let mut report = GenerationReport {
        planes: planes.len(),
        ..GenerationReport::default()
    };
    let mut mesh = CandidateMesh::new(planes);
    let mut welder = VertexWelder::new(tol.weld_distance);
    for (plane, cells) in per_plane.into_iter().enumerate() {
        report.parallel_pairs += cells.parallel;
        report.raw_cells += cells.raw;
        report.tiny_cells += cells.tiny;
        report.sliver_cells += cells.sliver;
        report.non_simple_cells += cells.non_simple;
        for cell in cells.cells {
            let ids: Vec<_> = cell
                .into_iter()
                .map(|p| welder.insert(&mut mesh.vertices, p))
                .collect();
            match mesh.add_face(plane, ids) {
                Ok(_) => {}
                Err(TopologyError::DegenerateFace(_)) => {
                    trace!(plane, "cell collapsed while welding");
                    report.collapsed_cells += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    // each unordered parallel pair was seen from both sides
    report.parallel_pairs /= 2;

    let stats = mesh.stats();
    info!(
        planes = report.planes,
        faces = stats.faces,
        edges = stats.edges,
        vertices = stats.vertices,
        discarded = report.tiny_cells + report.sliver_cells + report.non_simple_cells,
        "candidate faces generated"
    );
    if stats.faces < MIN_CANDIDATE_FACES {
        return Err(GenerationError::TooFewFaces { found: stats.faces });
    }
    Ok(Hypothesis {
        mesh,
        bounds,
        report,
        stats,
    })
}

fn partition_plane(
    idx: PlaneId,
    planes: &[Plane],
    bounds: &BoundingBox,
    tol: &ScaledTolerances,
) -> PlaneCells {
    let mut out = PlaneCells::default();
    let plane = &planes[idx];
    let section = bounds.plane_section(plane);
    if section.len() < 3 {
        debug!(plane = idx, "plane misses the bounding box");
        return out;
    }
    let frame = PlaneFrame::new(plane);
    let mut cells: Vec<Vec<Point2<f64>>> = vec![section.iter().map(|p| frame.to_2d(p)).collect()];
    for (other_idx, other) in planes.iter().enumerate() {
        if other_idx == idx {
            continue;
        }
        let Some(line) = frame.trace_of(other, tol.min_parallel_sin) else {
            out.parallel += 1;
            continue;
        };
        let mut next = Vec::with_capacity(cells.len() + 1);
        for cell in cells {
            match split_convex_polygon(&cell, &line, tol.epsilon) {
                Some((pos, neg)) => {
                    next.push(pos);
                    next.push(neg);
                }
                None => next.push(cell),
            }
        }
        cells = next;
    }
    out.raw = cells.len();

    for cell in cells {
        if polygon_area_2d(&cell).abs() < tol.min_face_area {
            out.tiny += 1;
        } else if min_interior_angle(&cell) < tol.min_face_angle_rad {
            out.sliver += 1;
        } else if !is_simple_polygon(&cell, tol.epsilon) {
            out.non_simple += 1;
        } else {
            out.cells.push(cell.iter().map(|p| frame.to_3d(p)).collect());
        }
    }
    trace!(plane = idx, cells = out.cells.len(), "plane partitioned");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_io::sample_box;
    use params::Tolerances;

    fn cube_groups() -> (Vec<Point3<f64>>, Vec<RefinedGroup>, ScaledTolerances) {
        let cloud = sample_box(Point3::origin(), Point3::new(1.0, 1.0, 1.0), 6);
        let tol = Tolerances::default().scaled(3f64.sqrt());
        let refined = fit::refine_groups(&cloud, &tol).expect("cube refines");
        (cloud.points, refined.groups, tol)
    }

    #[test]
    fn cube_planes_cut_each_other_into_nine_cells() {
        let (points, groups, tol) = cube_groups();
        let hypothesis = generate_candidates(&points, &groups, &tol).expect("generates");
        assert_eq!(hypothesis.report.planes, 6);
        assert_eq!(hypothesis.report.parallel_pairs, 3);
        assert_eq!(hypothesis.stats.faces, 54);
        for plane in 0..6 {
            assert_eq!(hypothesis.mesh.faces_of_plane(plane).len(), 9);
        }
        // grid points of {-m, 0, 1, 1 + m}^3 lying on at least one cube plane
        assert_eq!(hypothesis.stats.vertices, 64 - 8);
    }

    #[test]
    fn cube_edges_are_shared_across_planes() {
        let (points, groups, tol) = cube_groups();
        let mesh = generate_candidates(&points, &groups, &tol)
            .expect("generates")
            .mesh;
        let four_way = mesh.edges.iter().filter(|e| e.faces.len() == 4).count();
        // 12 cube edge lines, each crossing the box in three segments
        assert_eq!(four_way, 36);
        assert!(mesh.edges.iter().all(|e| !e.faces.is_empty()));
        for face in &mesh.faces {
            let positions: Vec<Point3<f64>> = face.vertices.iter().map(|&v| mesh.vertices[v]).collect();
            let plane = mesh.planes[face.plane];
            assert!(positions.iter().all(|p| plane.signed_distance(p).abs() < 1e-9));
            assert!(face.area >= tol.min_face_area);
            let frame = PlaneFrame::new(&plane);
            let flat: Vec<Point2<f64>> = positions.iter().map(|p| frame.to_2d(p)).collect();
            assert!(is_simple_polygon(&flat, tol.epsilon));
            assert!(min_interior_angle(&flat) >= tol.min_face_angle_rad);
        }
    }

    #[test]
    fn single_plane_yields_too_few_faces() {
        let (points, groups, tol) = cube_groups();
        let err = generate_candidates(&points, &groups[..1], &tol).unwrap_err();
        assert!(matches!(err, GenerationError::TooFewFaces { found: 1 }));
    }

    #[test]
    fn no_groups_is_rejected() {
        let tol = Tolerances::default().scaled(1.0);
        let err = generate_candidates(&[], &[], &tol).unwrap_err();
        assert!(matches!(err, GenerationError::NoPlanes));
    }

    #[test]
    fn candidate_faces_stay_inside_the_enlarged_box() {
        let (points, groups, tol) = cube_groups();
        let hypothesis = generate_candidates(&points, &groups, &tol).expect("generates");
        let grown = hypothesis.bounds.enlarged(1e-9);
        for p in &hypothesis.mesh.vertices {
            assert!(grown.min.x <= p.x && p.x <= grown.max.x);
            assert!(grown.min.y <= p.y && p.y <= grown.max.y);
            assert!(grown.min.z <= p.z && p.z <= grown.max.z);
        }
    }
}
