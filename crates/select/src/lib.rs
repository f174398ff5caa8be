use std::collections::{HashMap, VecDeque};

use adjacency::AdjacencySet;
use geom_core::{analyze_manifold, BoundingBox, CandidateMesh, FaceId, ManifoldReport, PolygonMesh};
use params::{ConfigError, Weights};
use serde::{Deserialize, Serialize};
use solver::{BinaryProgram, IlpSolver, Sense, SolverError, SolverKind, VarId};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("candidate face {0} has no confidence scores")]
    MissingConfidence(FaceId),
    #[error("bounding box has no surface area")]
    DegenerateBounds,
    #[error(transparent)]
    Weights(#[from] ConfigError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error("optimal selection contains no faces")]
    EmptySelection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionOptions {
    /// Every edge ends up with zero or two selected faces.
    pub watertight: bool,
    pub min_faces: usize,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            watertight: true,
            min_faces: 0,
        }
    }
}

/// Selection program plus the variable layout needed to read a solution.
#[derive(Debug, Clone)]
pub struct Formulation {
    pub program: BinaryProgram,
    pub face_vars: Vec<VarId>,
    pub plane_vars: Vec<Option<VarId>>,
    pub edge_vars: usize,
}

/// Unweighted objective terms of a selection, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectiveTerms {
    pub data_fitting: f64,
    pub model_coverage: f64,
    pub model_complexity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub faces: Vec<FaceId>,
    pub mesh: PolygonMesh,
    pub objective: f64,
    pub terms: ObjectiveTerms,
    pub planes_used: usize,
    pub mean_coverage: f64,
    pub manifold: ManifoldReport,
    pub flipped_faces: usize,
    pub backend: SolverKind,
    pub optimal: bool,
    pub nodes: usize,
    pub variables: usize,
    pub constraints: usize,
}

/// Builds the linearised selection program:
/// `w1 (1 - sum fit x) + w2 sum area (1 - cov) x / A + w3 sum z / P`
/// with `x_f <= z_p`, edge-fan constraints and pairwise exclusions.
pub fn build_program(
    mesh: &CandidateMesh,
    adjacency: &AdjacencySet,
    bounds: &BoundingBox,
    weights: &Weights,
    options: &SelectionOptions,
) -> Result<Formulation, SelectionError> {
    weights.validate()?;
    let area_norm = bounds.surface_area();
    if !(area_norm.is_finite() && area_norm > 0.0) {
        return Err(SelectionError::DegenerateBounds);
    }
    let plane_norm = mesh.planes.len().max(1) as f64;

    let mut program = BinaryProgram::new();
    program.constant = weights.data_fitting;
    let mut face_vars = Vec::with_capacity(mesh.face_count());
    for (idx, face) in mesh.faces.iter().enumerate() {
        let conf = face.confidence.ok_or(SelectionError::MissingConfidence(idx))?;
        let cost = -weights.data_fitting * conf.fitting
            + weights.model_coverage * face.area * (1.0 - conf.coverage) / area_norm;
        face_vars.push(program.add_var(cost));
    }

    let mut plane_vars = vec![None; mesh.planes.len()];
    for (idx, face) in mesh.faces.iter().enumerate() {
        let z = *plane_vars[face.plane]
            .get_or_insert_with(|| program.add_var(weights.model_complexity / plane_norm));
        program.add_constraint(vec![(face_vars[idx], 1.0), (z, -1.0)], Sense::Le, 0.0);
    }

    let mut edge_vars = 0usize;
    for fan in &adjacency.fans {
        let terms: Vec<(VarId, f64)> = fan.faces.iter().map(|&f| (face_vars[f], 1.0)).collect();
        if options.watertight {
            if fan.is_boundary() {
                program.add_constraint(terms, Sense::Eq, 0.0);
            } else {
                let y = program.add_var(0.0);
                edge_vars += 1;
                let mut terms = terms;
                terms.push((y, -2.0));
                program.add_constraint(terms, Sense::Eq, 0.0);
            }
        } else if fan.faces.len() > 2 {
            program.add_constraint(terms, Sense::Le, 2.0);
        }
    }

    for &(a, b) in &adjacency.exclusions {
        program.add_constraint(vec![(face_vars[a], 1.0), (face_vars[b], 1.0)], Sense::Le, 1.0);
    }
    if options.min_faces > 0 {
        program.add_constraint(
            face_vars.iter().map(|&v| (v, 1.0)).collect(),
            Sense::Ge,
            options.min_faces as f64,
        );
    }

    debug!(
        variables = program.var_count(),
        constraints = program.constraint_count(),
        edge_vars,
        "selection program built"
    );
    Ok(Formulation {
        program,
        face_vars,
        plane_vars,
        edge_vars,
    })
}

/// Solves the selection program and extracts the chosen faces as an
/// oriented polygon mesh.
pub fn select_faces(
    mesh: &CandidateMesh,
    adjacency: &AdjacencySet,
    bounds: &BoundingBox,
    weights: &Weights,
    options: &SelectionOptions,
    solver: &dyn IlpSolver,
) -> Result<Selection, SelectionError> {
    let formulation = build_program(mesh, adjacency, bounds, weights, options)?;
    let solution = solver.solve(&formulation.program)?;
    let faces: Vec<FaceId> = formulation
        .face_vars
        .iter()
        .enumerate()
        .filter(|(_, &var)| solution.values[var])
        .map(|(face, _)| face)
        .collect();
    if faces.is_empty() {
        return Err(SelectionError::EmptySelection);
    }

    let area_norm = bounds.surface_area();
    let mut terms = ObjectiveTerms {
        data_fitting: 1.0,
        ..ObjectiveTerms::default()
    };
    let mut coverage_sum = 0.0;
    for &f in &faces {
        let face = &mesh.faces[f];
        if let Some(conf) = face.confidence {
            terms.data_fitting -= conf.fitting;
            terms.model_coverage += face.area * (1.0 - conf.coverage) / area_norm;
            coverage_sum += conf.coverage;
        }
    }
    let planes_used = formulation
        .plane_vars
        .iter()
        .flatten()
        .filter(|&&z| solution.values[z])
        .count();
    terms.model_complexity = planes_used as f64 / mesh.planes.len().max(1) as f64;

    let mut result = extract_mesh(mesh, &faces);
    let manifold = analyze_manifold(&result);
    let flipped_faces = orient_faces(&mut result, manifold.is_closed);
    if !manifold.is_manifold() {
        warn!(
            non_manifold_edges = manifold.non_manifold_edges,
            non_manifold_vertices = manifold.non_manifold_vertices,
            "selected surface is not a 2-manifold"
        );
    } else if options.watertight && !manifold.is_closed {
        warn!(boundary_edges = manifold.boundary_edges, "selected surface is not closed");
    }

    info!(
        faces = faces.len(),
        planes = planes_used,
        objective = solution.objective,
        closed = manifold.is_closed,
        "faces selected"
    );
    Ok(Selection {
        mean_coverage: coverage_sum / faces.len() as f64,
        faces,
        mesh: result,
        objective: solution.objective,
        terms,
        planes_used,
        manifold,
        flipped_faces,
        backend: solution.backend,
        optimal: solution.optimal,
        nodes: solution.nodes,
        variables: formulation.program.var_count(),
        constraints: formulation.program.constraint_count(),
    })
}

/// Copies the selected faces into a compact polygon mesh; vertices keep the
/// order in which the faces first reference them.
pub fn extract_mesh(mesh: &CandidateMesh, faces: &[FaceId]) -> PolygonMesh {
    let mut remap: HashMap<usize, u32> = HashMap::new();
    let mut out = PolygonMesh::default();
    for &f in faces {
        let polygon = mesh.faces[f]
            .vertices
            .iter()
            .map(|&v| {
                *remap.entry(v).or_insert_with(|| {
                    out.vertices.push(mesh.vertices[v]);
                    (out.vertices.len() - 1) as u32
                })
            })
            .collect();
        out.faces.push(polygon);
    }
    out
}

/// Makes neighbouring faces traverse shared edges in opposite directions,
/// component by component, then turns closed surfaces outward. Returns how
/// many faces were reversed.
pub fn orient_faces(mesh: &mut PolygonMesh, closed: bool) -> usize {
    let mut directed: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
    for (idx, face) in mesh.faces.iter().enumerate() {
        for i in 0..face.len() {
            let (a, b) = (face[i], face[(i + 1) % face.len()]);
            directed.entry((a.min(b), a.max(b))).or_default().push(idx);
        }
    }
    let mut flip = vec![false; mesh.faces.len()];
    let mut seen = vec![false; mesh.faces.len()];
    for start in 0..mesh.faces.len() {
        if seen[start] {
            continue;
        }
        seen[start] = true;
        let mut queue = VecDeque::from([start]);
        while let Some(f) = queue.pop_front() {
            let face = &mesh.faces[f];
            for i in 0..face.len() {
                let (a, b) = (face[i], face[(i + 1) % face.len()]);
                let Some(incident) = directed.get(&(a.min(b), a.max(b))) else {
                    continue;
                };
                if incident.len() != 2 {
                    continue;
                }
                let g = if incident[0] == f { incident[1] } else { incident[0] };
                if seen[g] {
                    continue;
                }
                // a->b as traversed by f after its own flip
                let forward = if flip[f] { (b, a) } else { (a, b) };
                flip[g] = traverses(&mesh.faces[g], forward);
                seen[g] = true;
                queue.push_back(g);
            }
        }
    }
    for (face, &reverse) in mesh.faces.iter_mut().zip(&flip) {
        if reverse {
            face.reverse();
        }
    }
    let mut flipped = flip.iter().filter(|&&f| f).count();
    if closed && mesh.signed_volume() < 0.0 {
        for face in &mut mesh.faces {
            face.reverse();
        }
        flipped = mesh.faces.len() - flipped;
    }
    flipped
}

fn traverses(face: &[u32], (a, b): (u32, u32)) -> bool {
    (0..face.len()).any(|i| face[i] == a && face[(i + 1) % face.len()] == b)
}
