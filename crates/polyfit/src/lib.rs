use std::{
    fs::File,
    path::Path,
    sync::{atomic::AtomicBool, Arc},
};

use adjacency::AdjacencyReport;
use cloud_io::{CloudIoError, PointCloud};
use confidence::{ConfidenceError, ConfidenceReport};
use fit::{RefineError, RefineReport};
use geom_core::{BoundingBox, ManifoldReport, MeshStats, PolygonMesh};
use hypothesis::{GenerationError, GenerationReport};
use mesh_writer::{ExportError, MeshFormat};
use params::{ConfigError, Tolerances, Weights};
use select::{ObjectiveTerms, Selection, SelectionError, SelectionOptions};
use serde::{Deserialize, Serialize};
use solver::{solver_for, SolverError, SolverKind, SolverOptions};
use thiserror::Error;
use tracing::{info, warn};

/// Everything that steers one reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconstructionConfig {
    pub weights: Weights,
    pub tolerances: Tolerances,
    pub solver: SolverKind,
    pub watertight: bool,
    pub min_faces: usize,
    pub node_limit: Option<usize>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            tolerances: Tolerances::default(),
            solver: SolverKind::default(),
            watertight: true,
            min_faces: 0,
            node_limit: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error(transparent)]
    Cloud(#[from] CloudIoError),
    #[error(transparent)]
    Refine(#[from] RefineError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Confidence(#[from] ConfidenceError),
}

#[derive(Debug, Error)]
pub enum OptimizationError {
    #[error("constraint set is infeasible")]
    Infeasible,
    #[error("no solution found: {0}")]
    NoSolution(String),
    #[error("optimal selection contains no faces")]
    EmptySelection,
    #[error(transparent)]
    Backend(SolverError),
    #[error(transparent)]
    Formulation(SelectionError),
}

impl From<SolverError> for OptimizationError {
    fn from(err: SolverError) -> Self {
        match err {
            SolverError::Infeasible => OptimizationError::Infeasible,
            SolverError::NoSolution(reason) => OptimizationError::NoSolution(reason),
            other => OptimizationError::Backend(other),
        }
    }
}

impl From<SelectionError> for OptimizationError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::Solver(inner) => inner.into(),
            SelectionError::EmptySelection => OptimizationError::EmptySelection,
            other => OptimizationError::Formulation(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("input error: {0}")]
    Input(#[from] InputError),
    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("optimization error: {0}")]
    Optimization(#[from] OptimizationError),
    #[error("export error: {0}")]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSummary {
    pub faces: Vec<usize>,
    pub planes_used: usize,
    pub objective: f64,
    pub terms: ObjectiveTerms,
    pub mean_coverage: f64,
    pub flipped_faces: usize,
    pub backend: SolverKind,
    pub optimal: bool,
    pub nodes: usize,
    pub variables: usize,
    pub constraints: usize,
}

impl From<&Selection> for SelectionSummary {
    fn from(selection: &Selection) -> Self {
        Self {
            faces: selection.faces.clone(),
            planes_used: selection.planes_used,
            objective: selection.objective,
            terms: selection.terms,
            mean_coverage: selection.mean_coverage,
            flipped_faces: selection.flipped_faces,
            backend: selection.backend,
            optimal: selection.optimal,
            nodes: selection.nodes,
            variables: selection.variables,
            constraints: selection.constraints,
        }
    }
}

/// Per-stage QA numbers, written as JSON by `--report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReport {
    pub points: usize,
    pub input_groups: usize,
    pub diagonal: f64,
    pub weights: Weights,
    pub watertight: bool,
    pub refinement: RefineReport,
    pub generation: GenerationReport,
    pub candidates: MeshStats,
    pub confidence: ConfidenceReport,
    pub adjacency: AdjacencyReport,
    pub selection: SelectionSummary,
    pub manifold: ManifoldReport,
    pub vertices: usize,
    pub faces: usize,
}

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub mesh: PolygonMesh,
    pub report: QaReport,
}

pub fn reconstruct(
    cloud: &PointCloud,
    config: &ReconstructionConfig,
) -> Result<Reconstruction, ReconstructError> {
    reconstruct_with_cancel(cloud, config, None)
}

/// Runs refinement, candidate generation, scoring, adjacency and selection in
/// order. `cancel` aborts the solve with no solution.
pub fn reconstruct_with_cancel(
    cloud: &PointCloud,
    config: &ReconstructionConfig,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<Reconstruction, ReconstructError> {
    config.weights.validate().map_err(InputError::from)?;
    config.tolerances.validate().map_err(InputError::from)?;
    if cloud.is_empty() {
        return Err(InputError::Cloud(CloudIoError::Empty).into());
    }
    let diagonal = BoundingBox::from_points(&cloud.points).map_or(0.0, |b| b.diagonal());
    let tol = config.tolerances.scaled(diagonal);
    info!(
        points = cloud.point_count(),
        groups = cloud.group_count(),
        diagonal = tol.diagonal,
        "reconstruction started"
    );

    let refinement = fit::refine_groups(cloud, &tol).map_err(InputError::from)?;
    let groups = &refinement.groups;

    let hypothesis = hypothesis::generate_candidates(&cloud.points, groups, &tol)
        .map_err(GeometryError::from)?;
    let mut candidates = hypothesis.mesh;
    let confidence = confidence::evaluate_confidences(&mut candidates, &cloud.points, groups, &tol)
        .map_err(GeometryError::from)?;
    let (adjacency, adjacency_report) = adjacency::build_adjacency(&candidates, &tol);

    let solver = solver_for(
        config.solver,
        SolverOptions {
            node_limit: config.node_limit,
            cancel,
        },
    )
    .map_err(OptimizationError::from)?;
    let options = SelectionOptions {
        watertight: config.watertight,
        min_faces: config.min_faces,
    };
    let selection = select::select_faces(
        &candidates,
        &adjacency,
        &hypothesis.bounds,
        &config.weights,
        &options,
        solver.as_ref(),
    )
    .map_err(OptimizationError::from)?;

    let report = QaReport {
        points: cloud.point_count(),
        input_groups: cloud.group_count(),
        diagonal: tol.diagonal,
        weights: config.weights,
        watertight: config.watertight,
        refinement: refinement.report.clone(),
        generation: hypothesis.report,
        candidates: hypothesis.stats,
        confidence,
        adjacency: adjacency_report,
        selection: SelectionSummary::from(&selection),
        manifold: selection.manifold,
        vertices: selection.mesh.vertex_count(),
        faces: selection.mesh.face_count(),
    };
    Ok(Reconstruction {
        mesh: selection.mesh,
        report,
    })
}

/// Loads `input`, reconstructs, and writes the surface to `output`. Nothing
/// is written when any stage fails.
pub fn reconstruct_file(
    input: &Path,
    output: &Path,
    config: &ReconstructionConfig,
) -> Result<(Reconstruction, MeshFormat), ReconstructError> {
    let format = MeshFormat::from_path(output)?;
    let loaded = cloud_io::load_point_cloud(input).map_err(InputError::from)?;
    if loaded.report.dropped_indices > 0 || loaded.report.dropped_groups > 0 {
        warn!(
            dropped_indices = loaded.report.dropped_indices,
            dropped_groups = loaded.report.dropped_groups,
            "input cloud had invalid group entries"
        );
    }
    let reconstruction = reconstruct(&loaded.cloud, config)?;
    mesh_writer::write_mesh_as(output, &reconstruction.mesh, format)?;
    Ok((reconstruction, format))
}

pub fn write_report(path: &Path, report: &QaReport) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
