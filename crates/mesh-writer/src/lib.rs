use std::{
    fmt,
    io::{self, BufWriter, Write},
    path::Path,
    str::FromStr,
};

use earcutr::earcut;
use geom_core::{PolygonMesh, TopologyError};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeshFormat {
    Obj,
    Off,
    Ply,
    Stl,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("mesh is empty; nothing to export")]
    EmptyMesh,
    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid mesh: {0}")]
    InvalidMesh(#[from] TopologyError),
    #[error("face {0} could not be triangulated")]
    Triangulation(usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("could not move output into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl MeshFormat {
    pub fn from_path(path: &Path) -> Result<Self, ExportError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        ext.parse()
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MeshFormat::Obj => "obj",
            MeshFormat::Off => "off",
            MeshFormat::Ply => "ply",
            MeshFormat::Stl => "stl",
        }
    }
}

impl fmt::Display for MeshFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for MeshFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "obj" => Ok(MeshFormat::Obj),
            "off" => Ok(MeshFormat::Off),
            "ply" => Ok(MeshFormat::Ply),
            "stl" => Ok(MeshFormat::Stl),
            other => Err(ExportError::UnsupportedFormat(if other.is_empty() {
                "no extension".into()
            } else {
                other.to_string()
            })),
        }
    }
}

/// Writes `mesh` in the format implied by the extension of `path`.
pub fn write_mesh(path: &Path, mesh: &PolygonMesh) -> Result<MeshFormat, ExportError> {
    let format = MeshFormat::from_path(path)?;
    write_mesh_as(path, mesh, format)?;
    Ok(format)
}

/// Renders into a temporary file next to `path` and moves it into place
/// only once everything has been written.
pub fn write_mesh_as(path: &Path, mesh: &PolygonMesh, format: MeshFormat) -> Result<(), ExportError> {
    if mesh.is_empty() || mesh.vertex_count() == 0 {
        return Err(ExportError::EmptyMesh);
    }
    mesh.validate()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        render(mesh, format, &mut writer)?;
        writer.flush()?;
    }
    tmp.persist(path)?;
    debug!(path = %path.display(), %format, faces = mesh.face_count(), "mesh written");
    Ok(())
}

pub fn render<W: Write>(mesh: &PolygonMesh, format: MeshFormat, writer: &mut W) -> Result<(), ExportError> {
    match format {
        MeshFormat::Obj => write_obj(mesh, writer)?,
        MeshFormat::Off => write_off(mesh, writer)?,
        MeshFormat::Ply => write_ply(mesh, writer)?,
        MeshFormat::Stl => {
            let triangles = triangulate(mesh)?;
            write_stl(mesh, &triangles, writer)?;
        }
    }
    Ok(())
}

fn write_obj<W: Write>(mesh: &PolygonMesh, w: &mut W) -> io::Result<()> {
    writeln!(w, "# polyfit reconstruction")?;
    for v in &mesh.vertices {
        writeln!(w, "v {} {} {}", v.x, v.y, v.z)?;
    }
    for face in &mesh.faces {
        write!(w, "f")?;
        for idx in face {
            write!(w, " {}", idx + 1)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn write_off<W: Write>(mesh: &PolygonMesh, w: &mut W) -> io::Result<()> {
    writeln!(w, "OFF")?;
    writeln!(w, "{} {} 0", mesh.vertex_count(), mesh.face_count())?;
    for v in &mesh.vertices {
        writeln!(w, "{} {} {}", v.x, v.y, v.z)?;
    }
    for face in &mesh.faces {
        write!(w, "{}", face.len())?;
        for idx in face {
            write!(w, " {idx}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn write_ply<W: Write>(mesh: &PolygonMesh, w: &mut W) -> io::Result<()> {
    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "comment polyfit reconstruction")?;
    writeln!(w, "element vertex {}", mesh.vertex_count())?;
    writeln!(w, "property double x")?;
    writeln!(w, "property double y")?;
    writeln!(w, "property double z")?;
    writeln!(w, "element face {}", mesh.face_count())?;
    writeln!(w, "property list uchar int vertex_indices")?;
    writeln!(w, "end_header")?;
    for v in &mesh.vertices {
        writeln!(w, "{} {} {}", v.x, v.y, v.z)?;
    }
    for face in &mesh.faces {
        write!(w, "{}", face.len())?;
        for idx in face {
            write!(w, " {idx}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn write_stl<W: Write>(mesh: &PolygonMesh, triangles: &[[u32; 3]], w: &mut W) -> io::Result<()> {
    writeln!(w, "solid polyfit")?;
    for tri in triangles {
        let [a, b, c] = tri.map(|i| mesh.vertices[i as usize]);
        let n = (b - a).cross(&(c - a));
        let n = if n.norm() > f64::EPSILON {
            n.normalize()
        } else {
            Vector3::zeros()
        };
        writeln!(w, "  facet normal {:.6e} {:.6e} {:.6e}", n.x, n.y, n.z)?;
        writeln!(w, "    outer loop")?;
        for p in [a, b, c] {
            writeln!(w, "      vertex {:.6e} {:.6e} {:.6e}", p.x, p.y, p.z)?;
        }
        writeln!(w, "    endloop")?;
        writeln!(w, "  endfacet")?;
    }
    writeln!(w, "endsolid polyfit")?;
    Ok(())
}

/// Newell normal of a polygon loop; its length is twice the loop area.
fn newell_normal(points: &[Point3<f64>]) -> Vector3<f64> {
    let mut n = Vector3::zeros();
    for i in 0..points.len() {
        let p = points[i].coords;
        let q = points[(i + 1) % points.len()].coords;
        n += p.cross(&q);
    }
    n
}

/// Splits every polygon into triangles with the polygon's winding.
pub fn triangulate(mesh: &PolygonMesh) -> Result<Vec<[u32; 3]>, ExportError> {
    let mut out = Vec::new();
    for (face_idx, face) in mesh.faces.iter().enumerate() {
        if face.len() == 3 {
            out.push([face[0], face[1], face[2]]);
            continue;
        }
        let points: Vec<Point3<f64>> = face.iter().map(|&i| mesh.vertices[i as usize]).collect();
        let normal = newell_normal(&points);
        if normal.norm() < f64::EPSILON {
            return Err(ExportError::Triangulation(face_idx));
        }
        let normal = normal.normalize();
        let helper = if normal.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let u = normal.cross(&helper).normalize();
        let v = normal.cross(&u);
        let mut flattened = Vec::with_capacity(points.len() * 2);
        for p in &points {
            flattened.push(p.coords.dot(&u));
            flattened.push(p.coords.dot(&v));
        }
        let indices = earcut(&flattened, &[], 2).map_err(|_| ExportError::Triangulation(face_idx))?;
        if indices.len() < 3 {
            return Err(ExportError::Triangulation(face_idx));
        }
        for tri in indices.chunks_exact(3) {
            let (a, b, c) = (tri[0], tri[1], tri[2]);
            let n = (points[b] - points[a]).cross(&(points[c] - points[a]));
            if n.dot(&normal) >= 0.0 {
                out.push([face[a], face[b], face[c]]);
            } else {
                out.push([face[a], face[c], face[b]]);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cube() -> PolygonMesh {
        let vertices = (0..8)
            .map(|i| Point3::new((i & 1) as f64, ((i >> 1) & 1) as f64, ((i >> 2) & 1) as f64))
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

    fn rendered(mesh: &PolygonMesh, format: MeshFormat) -> String {
        let mut buf = Vec::new();
        render(mesh, format, &mut buf).expect("renders");
        String::from_utf8(buf).expect("ascii output")
    }

    #[test]
    fn obj_uses_one_based_polygon_faces() {
        let text = rendered(&cube(), MeshFormat::Obj);
        assert_eq!(text.lines().filter(|l| l.starts_with("v ")).count(), 8);
        assert!(text.contains("\nf 1 3 4 2\n"));
    }

    #[test]
    fn off_and_ply_headers_carry_counts() {
        let off = rendered(&cube(), MeshFormat::Off);
        assert!(off.starts_with("OFF\n8 6 0\n"));
        let ply = rendered(&cube(), MeshFormat::Ply);
        assert!(ply.contains("element vertex 8"));
        assert!(ply.contains("element face 6"));
        assert!(ply.trim_end().ends_with("4 1 3 7 5"));
    }

    #[test]
    fn stl_triangulates_with_outward_normals() {
        let mesh = cube();
        let triangles = triangulate(&mesh).expect("triangulates");
        assert_eq!(triangles.len(), 12);
        let soup = PolygonMesh {
            vertices: mesh.vertices.clone(),
            faces: triangles.iter().map(|t| t.to_vec()).collect(),
        };
        assert!((soup.signed_volume() - 1.0).abs() < 1e-12);
        let text = rendered(&mesh, MeshFormat::Stl);
        assert_eq!(text.matches("facet normal").count(), 12);
    }

    #[test]
    fn concave_polygon_triangulates_fully() {
        let mesh = PolygonMesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(2.0, 0.0, 0.0),
                Point3::new(2.0, 1.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(1.0, 2.0, 0.0),
                Point3::new(0.0, 2.0, 0.0),
            ],
            faces: vec![vec![0, 1, 2, 3, 4, 5]],
        };
        let triangles = triangulate(&mesh).expect("triangulates");
        assert_eq!(triangles.len(), 4);
        let area: f64 = triangles
            .iter()
            .map(|t| {
                let [a, b, c] = t.map(|i| mesh.vertices[i as usize]);
                (b - a).cross(&(c - a)).z * 0.5
            })
            .sum();
        assert!((area - 3.0).abs() < 1e-12);
    }

    #[test]
    fn write_mesh_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.off");
        assert_eq!(write_mesh(&path, &cube()).unwrap(), MeshFormat::Off);
        assert!(fs::read_to_string(&path).unwrap().starts_with("OFF"));
    }

    #[test]
    fn failed_export_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.obj");
        let err = write_mesh(&path, &PolygonMesh::default()).unwrap_err();
        assert!(matches!(err, ExportError::EmptyMesh));
        assert!(!path.exists());

        let broken = PolygonMesh {
            vertices: vec![Point3::origin(); 3],
            faces: vec![vec![0, 1, 7]],
        };
        assert!(matches!(
            write_mesh(&path, &broken),
            Err(ExportError::InvalidMesh(_))
        ));
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = MeshFormat::from_path(Path::new("out.step")).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedFormat(ext) if ext == "step"));
        assert!(MeshFormat::from_path(Path::new("out")).is_err());
    }
}
