use geom_core::{kd_key, CandidateMesh, EdgeId, FaceId, Plane};
use nalgebra::{Point3, Vector3};
use params::ScaledTolerances;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Candidate faces bordering one edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeFan {
    pub edge: EdgeId,
    pub faces: Vec<FaceId>,
}

impl EdgeFan {
    pub fn is_boundary(&self) -> bool {
        self.faces.len() == 1
    }
}

/// Everything the selection program needs to know about how candidate faces
/// touch: one fan per edge and the face pairs that may not coexist.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdjacencySet {
    pub fans: Vec<EdgeFan>,
    pub exclusions: Vec<(FaceId, FaceId)>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdjacencyReport {
    pub fans: usize,
    pub boundary_fans: usize,
    pub branching_fans: usize,
    pub tested_pairs: usize,
    pub exclusions: usize,
}

impl AdjacencySet {
    pub fn report(&self, tested_pairs: usize) -> AdjacencyReport {
        AdjacencyReport {
            fans: self.fans.len(),
            boundary_fans: self.fans.iter().filter(|f| f.is_boundary()).count(),
            branching_fans: self.fans.iter().filter(|f| f.faces.len() > 2).count(),
            tested_pairs,
            exclusions: self.exclusions.len(),
        }
    }
}

/// Derives edge fans from the candidate topology and mutual exclusions from
/// pairs of faces whose interiors cross without sharing an edge.
pub fn build_adjacency(mesh: &CandidateMesh, tol: &ScaledTolerances) -> (AdjacencySet, AdjacencyReport) {
    let fans: Vec<EdgeFan> = mesh
        .edges
        .iter()
        .enumerate()
        .filter(|(_, edge)| !edge.faces.is_empty())
        .map(|(idx, edge)| {
            let mut faces = edge.faces.clone();
            faces.sort_unstable();
            faces.dedup();
            EdgeFan { edge: idx, faces }
        })
        .collect();

    let pairs = nearby_pairs(mesh);
    let tested_pairs = pairs.len();
    let mut exclusions: Vec<(FaceId, FaceId)> = pairs
        .into_par_iter()
        .filter(|&(a, b)| faces_cross(mesh, a, b, tol.epsilon))
        .collect();
    exclusions.sort_unstable();
    for &(a, b) in &exclusions {
        debug!(a, b, "faces cross without sharing an edge");
    }

    let set = AdjacencySet { fans, exclusions };
    let report = set.report(tested_pairs);
    info!(
        fans = report.fans,
        boundary = report.boundary_fans,
        branching = report.branching_fans,
        tested = report.tested_pairs,
        exclusions = report.exclusions,
        "adjacency built"
    );
    (set, report)
}

/// Face pairs on different planes, sharing no edge, whose bounding spheres
/// around the centroids overlap.
fn nearby_pairs(mesh: &CandidateMesh) -> Vec<(FaceId, FaceId)> {
    let centroids: Vec<Point3<f64>> = (0..mesh.face_count()).map(|f| mesh.face_centroid(f)).collect();
    let radii: Vec<f64> = (0..mesh.face_count())
        .map(|f| {
            mesh.face_positions(f)
                .iter()
                .map(|p| (p - centroids[f]).norm())
                .fold(0.0, f64::max)
        })
        .collect();
    let max_radius = radii.iter().copied().fold(0.0, f64::max);

    let mut kdtree: kiddo::KdTree<f64, 3> = kiddo::KdTree::new();
    for (idx, c) in centroids.iter().enumerate() {
        kdtree.add(&kd_key(c), idx as u64);
    }

    let (centroids, radii) = (&centroids, &radii);
    let mut pairs: Vec<(FaceId, FaceId)> = (0..mesh.face_count())
        .into_par_iter()
        .flat_map_iter(|a| {
            let reach = radii[a] + max_radius;
            kdtree
                .within::<kiddo::SquaredEuclidean>(&kd_key(&centroids[a]), reach * reach)
                .into_iter()
                .map(|n| n.item as FaceId)
                .filter(move |&b| {
                    b > a
                        && mesh.faces[a].plane != mesh.faces[b].plane
                        && (centroids[a] - centroids[b]).norm() <= radii[a] + radii[b]
                        && !mesh.shares_edge(a, b)
                })
                .map(move |b| (a, b))
                .collect::<Vec<_>>()
        })
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Interval of the line `origin + t * dir` covered by the part of `polygon`
/// lying on `plane`, when the polygon strictly straddles the plane.
fn straddle_interval(
    polygon: &[Point3<f64>],
    plane: &Plane,
    origin: &Point3<f64>,
    dir: &Vector3<f64>,
    eps: f64,
) -> Option<(f64, f64)> {
    let dists: Vec<f64> = polygon.iter().map(|p| plane.signed_distance(p)).collect();
    if !(dists.iter().any(|&d| d > eps) && dists.iter().any(|&d| d < -eps)) {
        return None;
    }
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    let mut push = |p: Point3<f64>| {
        let t = (p - origin).dot(dir);
        lo = lo.min(t);
        hi = hi.max(t);
    };
    for i in 0..polygon.len() {
        let j = (i + 1) % polygon.len();
        let (di, dj) = (dists[i], dists[j]);
        if di.abs() <= eps {
            push(polygon[i]);
        }
        if (di > eps && dj < -eps) || (di < -eps && dj > eps) {
            let t = di / (di - dj);
            push(polygon[i] + (polygon[j] - polygon[i]) * t);
        }
    }
    (lo <= hi).then_some((lo, hi))
}

/// True when both faces straddle each other's plane and the two crossing
/// segments overlap by more than `eps`.
pub fn faces_cross(mesh: &CandidateMesh, a: FaceId, b: FaceId, eps: f64) -> bool {
    let (pa, pb) = (
        &mesh.planes[mesh.faces[a].plane],
        &mesh.planes[mesh.faces[b].plane],
    );
    let dir = pa.normal.cross(&pb.normal);
    if dir.norm() < 1e-12 {
        return false;
    }
    let dir = dir.normalize();
    let (poly_a, poly_b) = (mesh.face_positions(a), mesh.face_positions(b));
    let origin = poly_a[0];
    let Some((a_lo, a_hi)) = straddle_interval(&poly_a, pb, &origin, &dir, eps) else {
        return false;
    };
    let Some((b_lo, b_hi)) = straddle_interval(&poly_b, pa, &origin, &dir, eps) else {
        return false;
    };
    a_hi.min(b_hi) - a_lo.max(b_lo) > eps
}
