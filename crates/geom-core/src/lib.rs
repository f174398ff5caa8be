use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use nalgebra::{Point2, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type VertexId = usize;
pub type EdgeId = usize;
pub type FaceId = usize;
pub type PlaneId = usize;

// --- Planes ---------------------------------------------------------------

/// Oriented plane `normal . p + offset = 0` with a unit normal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Plane {
    pub normal: Vector3<f64>,
    pub offset: f64,
}

impl Plane {
    /// Normalises the equation; `None` when the normal is degenerate.
    pub fn new(normal: Vector3<f64>, offset: f64) -> Option<Self> {
        let len = normal.norm();
        if !len.is_finite() || len < 1e-12 || !offset.is_finite() {
            return None;
        }
        Some(Self {
            normal: normal / len,
            offset: offset / len,
        })
    }

    pub fn from_point_normal(point: &Point3<f64>, normal: &Vector3<f64>) -> Option<Self> {
        let len = normal.norm();
        if len < 1e-12 {
            return None;
        }
        let n = normal / len;
        Some(Self {
            normal: n,
            offset: -n.dot(&point.coords),
        })
    }

    pub fn signed_distance(&self, point: &Point3<f64>) -> f64 {
        self.normal.dot(&point.coords) + self.offset
    }

    pub fn project(&self, point: &Point3<f64>) -> Point3<f64> {
        point - self.normal * self.signed_distance(point)
    }

    /// Unoriented angle between the two planes, in radians.
    pub fn angle_to(&self, other: &Plane) -> f64 {
        self.normal.dot(&other.normal).abs().min(1.0).acos()
    }
}

/// Orthonormal 2D coordinate frame lying in a plane. `u x v` equals the
/// plane normal, so counter-clockwise 2D loops are counter-clockwise about
/// the normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneFrame {
    pub origin: Point3<f64>,
    pub u: Vector3<f64>,
    pub v: Vector3<f64>,
    pub normal: Vector3<f64>,
}

impl PlaneFrame {
    pub fn new(plane: &Plane) -> Self {
        let normal = plane.normal;
        let up = if normal.z.abs() < 0.9 {
            Vector3::z()
        } else {
            Vector3::y()
        };
        let u = up.cross(&normal).normalize();
        let v = normal.cross(&u).normalize();
        Self {
            origin: Point3::from(normal * -plane.offset),
            u,
            v,
            normal,
        }
    }

    pub fn to_2d(&self, point: &Point3<f64>) -> Point2<f64> {
        let delta = point - self.origin;
        Point2::new(delta.dot(&self.u), delta.dot(&self.v))
    }

    pub fn to_3d(&self, point: &Point2<f64>) -> Point3<f64> {
        self.origin + self.u * point.x + self.v * point.y
    }

    /// Trace of `other` inside this frame, `None` for (near) parallel planes.
    pub fn trace_of(&self, other: &Plane, min_sin: f64) -> Option<Line2> {
        let a = other.normal.dot(&self.u);
        let b = other.normal.dot(&self.v);
        let c = other.signed_distance(&self.origin);
        let len = a.hypot(b);
        if len < min_sin {
            return None;
        }
        Some(Line2 {
            a: a / len,
            b: b / len,
            c: c / len,
        })
    }
}

/// Normalised 2D line `a x + b y + c = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line2 {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Line2 {
    pub fn eval(&self, point: &Point2<f64>) -> f64 {
        self.a * point.x + self.b * point.y + self.c
    }
}

// --- Bounding boxes -------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (2, 3),
    (4, 5),
    (6, 7),
    (0, 2),
    (1, 3),
    (4, 6),
    (5, 7),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

impl BoundingBox {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f64>>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut min = *first;
        let mut max = *first;
        for p in iter {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some(Self { min, max })
    }

    pub fn diagonal(&self) -> f64 {
        (self.max - self.min).norm()
    }

    pub fn enlarged(&self, margin: f64) -> Self {
        let pad = Vector3::repeat(margin.max(0.0));
        Self {
            min: self.min - pad,
            max: self.max + pad,
        }
    }

    pub fn surface_area(&self) -> f64 {
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    pub fn corners(&self) -> [Point3<f64>; 8] {
        std::array::from_fn(|i| {
            Point3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            )
        })
    }

    /// Convex polygon where `plane` cuts the box, ordered counter-clockwise
    /// about the plane normal. Empty when the plane misses the box.
    pub fn plane_section(&self, plane: &Plane) -> Vec<Point3<f64>> {
        let corners = self.corners();
        let dedup_tol = self.diagonal().max(1e-12) * 1e-9;
        let mut points: Vec<Point3<f64>> = Vec::new();
        for (a, b) in BOX_EDGES {
            let (pa, pb) = (corners[a], corners[b]);
            let da = plane.signed_distance(&pa);
            let db = plane.signed_distance(&pb);
            if (da <= 0.0 && db > 0.0) || (da > 0.0 && db <= 0.0) {
                let t = da / (da - db);
                let hit = pa + (pb - pa) * t;
                if points.iter().all(|p| (p - hit).norm() > dedup_tol) {
                    points.push(hit);
                }
            }
        }
        if points.len() < 3 {
            return Vec::new();
        }
        let frame = PlaneFrame::new(plane);
        let flat: Vec<Point2<f64>> = points.iter().map(|p| frame.to_2d(p)).collect();
        let cx = flat.iter().map(|p| p.x).sum::<f64>() / flat.len() as f64;
        let cy = flat.iter().map(|p| p.y).sum::<f64>() / flat.len() as f64;
        let mut order: Vec<usize> = (0..points.len()).collect();
        order.sort_by(|&i, &j| {
            let ai = (flat[i].y - cy).atan2(flat[i].x - cx);
            let aj = (flat[j].y - cy).atan2(flat[j].x - cx);
            ai.total_cmp(&aj)
        });
        order.into_iter().map(|i| points[i]).collect()
    }
}

// --- Polygons -------------------------------------------------------------

/// Signed shoelace area; positive for counter-clockwise loops.
pub fn polygon_area_2d(polygon: &[Point2<f64>]) -> f64 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 0..polygon.len() {
        let p = polygon[i];
        let q = polygon[(i + 1) % polygon.len()];
        area += p.x * q.y - q.x * p.y;
    }
    0.5 * area
}

/// Area of a planar 3D loop measured along `normal`.
pub fn polygon_area_3d(polygon: &[Point3<f64>], normal: &Vector3<f64>) -> f64 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let mut acc = Vector3::zeros();
    for i in 0..polygon.len() {
        let p = polygon[i].coords;
        let q = polygon[(i + 1) % polygon.len()].coords;
        acc += p.cross(&q);
    }
    0.5 * acc.dot(normal)
}

/// Splits a convex polygon along `line`. Vertices within `eps` of the line go
/// to both halves. Returns `None` when the line does not cross the interior;
/// otherwise `(positive side, negative side)`.
pub fn split_convex_polygon(
    polygon: &[Point2<f64>],
    line: &Line2,
    eps: f64,
) -> Option<(Vec<Point2<f64>>, Vec<Point2<f64>>)> {
    let dists: Vec<f64> = polygon.iter().map(|p| line.eval(p)).collect();
    let has_pos = dists.iter().any(|&d| d > eps);
    let has_neg = dists.iter().any(|&d| d < -eps);
    if !(has_pos && has_neg) {
        return None;
    }
    let mut positive = Vec::with_capacity(polygon.len() + 1);
    let mut negative = Vec::with_capacity(polygon.len() + 1);
    for i in 0..polygon.len() {
        let j = (i + 1) % polygon.len();
        let (p, dp) = (polygon[i], dists[i]);
        let (q, dq) = (polygon[j], dists[j]);
        if dp.abs() <= eps {
            positive.push(p);
            negative.push(p);
        } else if dp > 0.0 {
            positive.push(p);
        } else {
            negative.push(p);
        }
        let crosses = (dp > eps && dq < -eps) || (dp < -eps && dq > eps);
        if crosses {
            let t = dp / (dp - dq);
            let hit = p + (q - p) * t;
            positive.push(hit);
            negative.push(hit);
        }
    }
    if positive.len() < 3 || negative.len() < 3 {
        return None;
    }
    Some((positive, negative))
}

/// Smallest interior angle of a loop, in radians.
pub fn min_interior_angle(polygon: &[Point2<f64>]) -> f64 {
    let n = polygon.len();
    if n < 3 {
        return 0.0;
    }
    let mut min_angle = std::f64::consts::PI;
    for i in 0..n {
        let prev = polygon[(i + n - 1) % n];
        let cur = polygon[i];
        let next = polygon[(i + 1) % n];
        let a = prev - cur;
        let b = next - cur;
        let cross = a.x * b.y - a.y * b.x;
        let angle = cross.abs().atan2(a.dot(&b));
        min_angle = min_angle.min(angle);
    }
    min_angle
}

/// True when no two non-adjacent edges touch and no edge is degenerate.
pub fn is_simple_polygon(polygon: &[Point2<f64>], eps: f64) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    for i in 0..n {
        if (polygon[(i + 1) % n] - polygon[i]).norm() <= eps {
            return false;
        }
    }
    for i in 0..n {
        let (a1, a2) = (polygon[i], polygon[(i + 1) % n]);
        for j in (i + 1)..n {
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let (b1, b2) = (polygon[j], polygon[(j + 1) % n]);
            if segments_intersect(a1, a2, b1, b2, eps) {
                return false;
            }
        }
    }
    true
}

fn orient(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: Point2<f64>, b: Point2<f64>, p: Point2<f64>, eps: f64) -> bool {
    p.x >= a.x.min(b.x) - eps
        && p.x <= a.x.max(b.x) + eps
        && p.y >= a.y.min(b.y) - eps
        && p.y <= a.y.max(b.y) + eps
}

pub fn segments_intersect(
    a1: Point2<f64>,
    a2: Point2<f64>,
    b1: Point2<f64>,
    b2: Point2<f64>,
    eps: f64,
) -> bool {
    let d1 = orient(b1, b2, a1);
    let d2 = orient(b1, b2, a2);
    let d3 = orient(a1, a2, b1);
    let d4 = orient(a1, a2, b2);
    if ((d1 > eps && d2 < -eps) || (d1 < -eps && d2 > eps))
        && ((d3 > eps && d4 < -eps) || (d3 < -eps && d4 > eps))
    {
        return true;
    }
    (d1.abs() <= eps && on_segment(b1, b2, a1, eps))
        || (d2.abs() <= eps && on_segment(b1, b2, a2, eps))
        || (d3.abs() <= eps && on_segment(a1, a2, b1, eps))
        || (d4.abs() <= eps && on_segment(a1, a2, b2, eps))
}

/// Even-odd containment test.
pub fn point_in_polygon(point: &Point2<f64>, polygon: &[Point2<f64>]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > point.y) != (pj.y > point.y) {
            let x = (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x;
            if point.x < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// --- Spatial index keys ---------------------------------------------------

/// Coordinates for k-d tree insertion: the point under a fixed generic
/// rotation. Distances are unchanged, but axis-aligned planar data no longer
/// puts whole groups of points on one value of a tree axis.
pub fn kd_key(p: &Point3<f64>) -> [f64; 3] {
    static ROTATION: OnceLock<Rotation3<f64>> = OnceLock::new();
    let rotation = ROTATION.get_or_init(|| Rotation3::from_euler_angles(0.4142, 0.7320, 1.2360));
    let r = rotation * p;
    [r.x, r.y, r.z]
}

// --- Vertex welding -------------------------------------------------------

/// Merges positions closer than `tolerance` into one vertex. Buckets are a
/// quantised grid; lookups scan the 27 neighbouring cells so points near a
/// cell border still weld.
#[derive(Debug, Clone)]
pub struct VertexWelder {
    tolerance: f64,
    grid: HashMap<(i64, i64, i64), Vec<VertexId>>,
}

impl VertexWelder {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.max(f64::MIN_POSITIVE),
            grid: HashMap::new(),
        }
    }

    fn key(&self, p: &Point3<f64>) -> (i64, i64, i64) {
        let scale = 1.0 / self.tolerance;
        (
            (p.x * scale).floor() as i64,
            (p.y * scale).floor() as i64,
            (p.z * scale).floor() as i64,
        )
    }

    pub fn insert(&mut self, vertices: &mut Vec<Point3<f64>>, p: Point3<f64>) -> VertexId {
        let (kx, ky, kz) = self.key(&p);
        let tol_sq = self.tolerance * self.tolerance;
        let mut best: Option<(VertexId, f64)> = None;
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(bucket) = self.grid.get(&(kx + dx, ky + dy, kz + dz)) {
                        for &id in bucket {
                            let dist = (vertices[id] - p).norm_squared();
                            if dist <= tol_sq && best.map_or(true, |(_, d)| dist < d) {
                                best = Some((id, dist));
                            }
                        }
                    }
                }
            }
        }
        if let Some((id, _)) = best {
            return id;
        }
        let id = vertices.len();
        vertices.push(p);
        self.grid.entry((kx, ky, kz)).or_default().push(id);
        id
    }
}

// --- Candidate mesh arena -------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FaceConfidence {
    pub fitting: f64,
    pub coverage: f64,
    pub supporting_points: usize,
}

impl FaceConfidence {
    pub fn unsupported() -> Self {
        Self {
            fitting: 0.0,
            coverage: 0.0,
            supporting_points: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateEdge {
    pub vertices: [VertexId; 2],
    pub faces: Vec<FaceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateFace {
    pub plane: PlaneId,
    pub vertices: Vec<VertexId>,
    pub edges: Vec<EdgeId>,
    pub area: f64,
    pub confidence: Option<FaceConfidence>,
}

/// Arena of candidate vertices, edges and faces. Faces reference edges and
/// edges reference faces by index only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateMesh {
    pub planes: Vec<Plane>,
    pub vertices: Vec<Point3<f64>>,
    pub edges: Vec<CandidateEdge>,
    pub faces: Vec<CandidateFace>,
    #[serde(skip)]
    edge_lookup: HashMap<(VertexId, VertexId), EdgeId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("face {0} has fewer than three distinct vertices")]
    DegenerateFace(usize),
    #[error("face {face} references missing vertex {vertex}")]
    MissingVertex { face: usize, vertex: usize },
}

impl CandidateMesh {
    pub fn new(planes: Vec<Plane>) -> Self {
        Self {
            planes,
            ..Self::default()
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Registers a face over already-welded vertices. Consecutive duplicates
    /// are collapsed; edges are shared with any face that already uses them.
    pub fn add_face(
        &mut self,
        plane: PlaneId,
        mut vertices: Vec<VertexId>,
    ) -> Result<FaceId, TopologyError> {
        let face_id = self.faces.len();
        vertices.dedup();
        while vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }
        let distinct: HashSet<_> = vertices.iter().collect();
        if distinct.len() < 3 || distinct.len() != vertices.len() {
            return Err(TopologyError::DegenerateFace(face_id));
        }
        if let Some(&vertex) = vertices.iter().find(|&&v| v >= self.vertices.len()) {
            return Err(TopologyError::MissingVertex {
                face: face_id,
                vertex,
            });
        }
        let positions: Vec<Point3<f64>> = vertices.iter().map(|&v| self.vertices[v]).collect();
        let area = polygon_area_3d(&positions, &self.planes[plane].normal).abs();
        let mut edges = Vec::with_capacity(vertices.len());
        for i in 0..vertices.len() {
            let a = vertices[i];
            let b = vertices[(i + 1) % vertices.len()];
            let key = if a < b { (a, b) } else { (b, a) };
            let edge_id = match self.edge_lookup.get(&key) {
                Some(&id) => id,
                None => {
                    let id = self.edges.len();
                    self.edges.push(CandidateEdge {
                        vertices: [key.0, key.1],
                        faces: Vec::new(),
                    });
                    self.edge_lookup.insert(key, id);
                    id
                }
            };
            self.edges[edge_id].faces.push(face_id);
            edges.push(edge_id);
        }
        self.faces.push(CandidateFace {
            plane,
            vertices,
            edges,
            area,
            confidence: None,
        });
        Ok(face_id)
    }

    pub fn face_positions(&self, face: FaceId) -> Vec<Point3<f64>> {
        self.faces[face]
            .vertices
            .iter()
            .map(|&v| self.vertices[v])
            .collect()
    }

    pub fn face_centroid(&self, face: FaceId) -> Point3<f64> {
        let positions = self.face_positions(face);
        let sum = positions
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords);
        Point3::from(sum / positions.len().max(1) as f64)
    }

    pub fn faces_of_plane(&self, plane: PlaneId) -> Vec<FaceId> {
        self.faces
            .iter()
            .enumerate()
            .filter(|(_, face)| face.plane == plane)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn shares_edge(&self, a: FaceId, b: FaceId) -> bool {
        self.faces[a]
            .edges
            .iter()
            .any(|e| self.faces[b].edges.contains(e))
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            vertices: self.vertex_count(),
            edges: self.edge_count(),
            faces: self.face_count(),
        }
    }
}

/// Element counts of a polygonal complex.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshStats {
    pub vertices: usize,
    pub edges: usize,
    pub faces: usize,
}

// --- Result mesh ----------------------------------------------------------

/// Plain polygon soup handed to exporters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolygonMesh {
    pub vertices: Vec<Point3<f64>>,
    pub faces: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifoldReport {
    pub boundary_edges: usize,
    pub non_manifold_edges: usize,
    pub non_manifold_vertices: usize,
    pub is_closed: bool,
}

impl ManifoldReport {
    pub fn is_manifold(&self) -> bool {
        self.non_manifold_edges == 0 && self.non_manifold_vertices == 0
    }
}

impl PolygonMesh {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        for (idx, face) in self.faces.iter().enumerate() {
            if face.len() < 3 {
                return Err(TopologyError::DegenerateFace(idx));
            }
            if let Some(&v) = face.iter().find(|&&v| v as usize >= self.vertices.len()) {
                return Err(TopologyError::MissingVertex {
                    face: idx,
                    vertex: v as usize,
                });
            }
        }
        Ok(())
    }

    /// Signed volume enclosed by the faces; positive for outward orientation
    /// of a closed surface.
    pub fn signed_volume(&self) -> f64 {
        let mut volume = 0.0;
        for face in &self.faces {
            let p0 = self.vertices[face[0] as usize].coords;
            for i in 1..face.len().saturating_sub(1) {
                let p1 = self.vertices[face[i] as usize].coords;
                let p2 = self.vertices[face[i + 1] as usize].coords;
                volume += p0.dot(&p1.cross(&p2));
            }
        }
        volume / 6.0
    }
}

fn edge_key(a: u32, b: u32) -> (u32, u32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Counts edges by fan size and checks that every vertex's incident faces
/// form a single edge-connected fan.
pub fn analyze_manifold(mesh: &PolygonMesh) -> ManifoldReport {
    let mut edge_faces: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
    let mut vertex_faces: HashMap<u32, Vec<usize>> = HashMap::new();
    for (face_idx, face) in mesh.faces.iter().enumerate() {
        for i in 0..face.len() {
            let a = face[i];
            let b = face[(i + 1) % face.len()];
            edge_faces.entry(edge_key(a, b)).or_default().push(face_idx);
            vertex_faces.entry(a).or_default().push(face_idx);
        }
    }
    let mut boundary_edges = 0usize;
    let mut non_manifold_edges = 0usize;
    for faces in edge_faces.values() {
        match faces.len() {
            1 => boundary_edges += 1,
            2 => (),
            _ => non_manifold_edges += 1,
        }
    }

    let mut non_manifold_vertices = 0usize;
    for (&vertex, faces) in &vertex_faces {
        if faces.len() <= 1 {
            continue;
        }
        // faces around `vertex` are linked when they share an edge through it
        let mut links: HashMap<usize, Vec<usize>> = HashMap::new();
        for (key, incident) in &edge_faces {
            if key.0 != vertex && key.1 != vertex {
                continue;
            }
            for i in 0..incident.len() {
                for j in (i + 1)..incident.len() {
                    links.entry(incident[i]).or_default().push(incident[j]);
                    links.entry(incident[j]).or_default().push(incident[i]);
                }
            }
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([faces[0]]);
        seen.insert(faces[0]);
        while let Some(f) = queue.pop_front() {
            for &g in links.get(&f).map(Vec::as_slice).unwrap_or(&[]) {
                if seen.insert(g) {
                    queue.push_back(g);
                }
            }
        }
        let distinct: HashSet<_> = faces.iter().collect();
        if seen.len() != distinct.len() {
            non_manifold_vertices += 1;
        }
    }

    ManifoldReport {
        boundary_edges,
        non_manifold_edges,
        non_manifold_vertices,
        is_closed: boundary_edges == 0 && non_manifold_edges == 0 && !mesh.faces.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Vec<Point2<f64>> {
        vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ]
    }

    fn cube_mesh() -> PolygonMesh {
        let vertices = (0..8)
            .map(|i| {
                Point3::new(
                    (i & 1) as f64,
                    ((i >> 1) & 1) as f64,
                    ((i >> 2) & 1) as f64,
                )
            })
            .collect();
        PolygonMesh {
            vertices,
            faces: vec![
                vec![0, 2, 3, 1],
                vec![4, 5, 7, 6],
                vec![0, 1, 5, 4],
                vec![2, 6, 7, 3],
                vec![0, 4, 6, 2],
                vec![1, 3, 7, 5],
            ],
        }
    }

    #[test]
    fn kd_key_preserves_distances() {
        let a = Point3::new(1.0, 0.0, 0.0);
        let b = Point3::new(0.0, 2.0, 0.0);
        let (ka, kb) = (kd_key(&a), kd_key(&b));
        let d2: f64 = (0..3).map(|i| (ka[i] - kb[i]).powi(2)).sum();
        assert!((d2 - 5.0).abs() < 1e-12);
        let flat = kd_key(&Point3::new(0.5, 0.25, 0.0));
        assert!(flat.iter().all(|c| c.abs() > 1e-6));
    }

    #[test]
    fn plane_normalises_equation() {
        let plane = Plane::new(Vector3::new(0.0, 0.0, 2.0), -4.0).expect("valid plane");
        assert!((plane.normal.z - 1.0).abs() < 1e-12);
        assert!((plane.offset + 2.0).abs() < 1e-12);
        assert!(plane.signed_distance(&Point3::new(5.0, 1.0, 2.0)).abs() < 1e-12);
        assert!(Plane::new(Vector3::zeros(), 1.0).is_none());
    }

    #[test]
    fn frame_round_trips_points_in_plane() {
        let plane = Plane::new(Vector3::new(1.0, 1.0, 0.0), -1.0).unwrap();
        let frame = PlaneFrame::new(&plane);
        let p = plane.project(&Point3::new(0.3, -2.0, 4.0));
        let back = frame.to_3d(&frame.to_2d(&p));
        assert!((back - p).norm() < 1e-9);
        assert!((frame.u.cross(&frame.v) - plane.normal).norm() < 1e-9);
    }

    #[test]
    fn box_section_of_axis_plane_is_square() {
        let bbox = BoundingBox {
            min: Point3::new(0.0, 0.0, 0.0),
            max: Point3::new(1.0, 2.0, 3.0),
        };
        let plane = Plane::new(Vector3::new(0.0, 0.0, 1.0), -1.5).unwrap();
        let section = bbox.plane_section(&plane);
        assert_eq!(section.len(), 4);
        let area = polygon_area_3d(&section, &plane.normal);
        assert!((area - 2.0).abs() < 1e-9, "area {area}");
        let miss = Plane::new(Vector3::new(0.0, 0.0, 1.0), -10.0).unwrap();
        assert!(bbox.plane_section(&miss).is_empty());
    }

    #[test]
    fn split_square_through_middle() {
        let line = Line2 {
            a: 1.0,
            b: 0.0,
            c: -0.5,
        };
        let (pos, neg) = split_convex_polygon(&unit_square(), &line, 1e-9).expect("split");
        assert!((polygon_area_2d(&pos) - 0.5).abs() < 1e-12);
        assert!((polygon_area_2d(&neg) - 0.5).abs() < 1e-12);
        let outside = Line2 {
            a: 1.0,
            b: 0.0,
            c: -2.0,
        };
        assert!(split_convex_polygon(&unit_square(), &outside, 1e-9).is_none());
    }

    #[test]
    fn bow_tie_is_not_simple() {
        let bow_tie = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ];
        assert!(!is_simple_polygon(&bow_tie, 1e-12));
        assert!(is_simple_polygon(&unit_square(), 1e-12));
    }

    #[test]
    fn containment_of_points() {
        let square = unit_square();
        assert!(point_in_polygon(&Point2::new(0.5, 0.5), &square));
        assert!(!point_in_polygon(&Point2::new(1.5, 0.5), &square));
    }

    #[test]
    fn welder_merges_close_points_across_cells() {
        let mut vertices = Vec::new();
        let mut welder = VertexWelder::new(0.01);
        let a = welder.insert(&mut vertices, Point3::new(0.0999, 0.0, 0.0));
        let b = welder.insert(&mut vertices, Point3::new(0.1001, 0.0, 0.0));
        let c = welder.insert(&mut vertices, Point3::new(0.5, 0.0, 0.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(vertices.len(), 2);
    }

    #[test]
    fn candidate_faces_share_edges() {
        let plane = Plane::new(Vector3::z(), 0.0).unwrap();
        let mut mesh = CandidateMesh::new(vec![plane]);
        mesh.vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let f0 = mesh.add_face(0, vec![0, 1, 2]).unwrap();
        let f1 = mesh.add_face(0, vec![0, 2, 3]).unwrap();
        assert_eq!(mesh.edge_count(), 5);
        assert!(mesh.shares_edge(f0, f1));
        assert!((mesh.faces[f0].area - 0.5).abs() < 1e-12);
        assert_eq!(
            mesh.add_face(0, vec![0, 1, 1]).unwrap_err(),
            TopologyError::DegenerateFace(2)
        );
    }

    #[test]
    fn cube_is_closed_manifold_with_positive_volume() {
        let mesh = cube_mesh();
        let report = analyze_manifold(&mesh);
        assert!(report.is_closed);
        assert!(report.is_manifold());
        assert!((mesh.signed_volume() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn touching_cubes_share_a_non_manifold_vertex() {
        let mut mesh = cube_mesh();
        let offset = mesh.vertices.len() as u32 - 1;
        // second cube sharing only vertex 7 of the first
        for i in 1..8 {
            mesh.vertices.push(Point3::new(
                1.0 + (i & 1) as f64,
                1.0 + ((i >> 1) & 1) as f64,
                1.0 + ((i >> 2) & 1) as f64,
            ));
        }
        let remap = |v: u32| if v == 0 { 7 } else { offset + v };
        let second: Vec<Vec<u32>> = cube_mesh()
            .faces
            .iter()
            .map(|f| f.iter().map(|&v| remap(v)).collect())
            .collect();
        mesh.faces.extend(second);
        let report = analyze_manifold(&mesh);
        assert_eq!(report.non_manifold_edges, 0);
        assert_eq!(report.non_manifold_vertices, 1);
    }
}
