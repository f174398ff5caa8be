use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// One planar segment of the cloud: inlier indices plus an optional
/// precomputed plane `[a, b, c, d]` with `a x + b y + c z + d = 0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanarGroup {
    #[serde(default)]
    pub label: String,
    pub indices: Vec<usize>,
    #[serde(default)]
    pub plane: Option<[f64; 4]>,
}

/// Point cloud with its planar segmentation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Point3<f64>>,
    #[serde(default)]
    pub normals: Option<Vec<Vector3<f64>>>,
    #[serde(default)]
    pub groups: Vec<PlanarGroup>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Uniformly scales positions and precomputed plane offsets.
    pub fn scaled(&self, factor: f64) -> Self {
        let mut scaled = self.clone();
        for p in &mut scaled.points {
            *p = Point3::from(p.coords * factor);
        }
        for group in &mut scaled.groups {
            if let Some(plane) = group.plane.as_mut() {
                plane[3] *= factor;
            }
        }
        scaled
    }
}

/// Samples every face of an axis-aligned box on an `n x n` grid, one planar
/// group per face with an outward plane equation. Samples sit at cell
/// centres, so no point lies exactly on a box edge.
pub fn sample_box(min: Point3<f64>, max: Point3<f64>, n: usize) -> PointCloud {
    let mut cloud = PointCloud {
        points: Vec::new(),
        normals: Some(Vec::new()),
        groups: Vec::new(),
    };
    let n = n.max(1);
    for axis in 0..3 {
        let (b, c) = ((axis + 1) % 3, (axis + 2) % 3);
        for (side, value) in [(-1.0, min[axis]), (1.0, max[axis])] {
            let start = cloud.points.len();
            let mut normal = Vector3::zeros();
            normal[axis] = side;
            for i in 0..n {
                for j in 0..n {
                    let mut p = Point3::origin();
                    p[axis] = value;
                    p[b] = min[b] + (max[b] - min[b]) * (i as f64 + 0.5) / n as f64;
                    p[c] = min[c] + (max[c] - min[c]) * (j as f64 + 0.5) / n as f64;
                    cloud.points.push(p);
                    if let Some(normals) = cloud.normals.as_mut() {
                        normals.push(normal);
                    }
                }
            }
            let mut plane = [0.0; 4];
            plane[axis] = side;
            plane[3] = -side * value;
            cloud.groups.push(PlanarGroup {
                label: format!("{}{}", if side < 0.0 { "min_" } else { "max_" }, ["x", "y", "z"][axis]),
                indices: (start..cloud.points.len()).collect(),
                plane: Some(plane),
            });
        }
    }
    cloud
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloudFormat {
    Vg,
    Json,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudLoadReport {
    pub dropped_indices: usize,
    pub dropped_groups: usize,
}

#[derive(Debug, Error)]
pub enum CloudIoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid point cloud: {0}")]
    Invalid(String),
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("point cloud contains no points")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct LoadedCloud {
    pub cloud: PointCloud,
    pub report: CloudLoadReport,
    pub format: CloudFormat,
    pub path: PathBuf,
}

/// Drops group indices that point past the end of the cloud, and groups left
/// with no indices at all.
pub fn sanitize(cloud: &mut PointCloud) -> Result<CloudLoadReport, CloudIoError> {
    if cloud.points.is_empty() {
        return Err(CloudIoError::Empty);
    }
    if let Some(normals) = &cloud.normals {
        if normals.len() != cloud.points.len() {
            warn!(
                normals = normals.len(),
                points = cloud.points.len(),
                "normal count does not match point count, ignoring normals"
            );
            cloud.normals = None;
        }
    }
    let point_count = cloud.points.len();
    let mut report = CloudLoadReport::default();
    for group in &mut cloud.groups {
        let before = group.indices.len();
        group.indices.retain(|&idx| idx < point_count);
        report.dropped_indices += before - group.indices.len();
    }
    let before = cloud.groups.len();
    cloud.groups.retain(|group| !group.indices.is_empty());
    report.dropped_groups = before - cloud.groups.len();
    Ok(report)
}

pub fn load_point_cloud(path: impl AsRef<Path>) -> Result<LoadedCloud, CloudIoError> {
    let path = path.as_ref().to_path_buf();
    let lower_ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    match lower_ext.as_str() {
        "vg" => load_vg(&path),
        "json" => load_json(&path),
        _ => Err(CloudIoError::Unsupported(
            path.extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("unknown")
                .to_string(),
        )),
    }
}

pub fn load_vg(path: impl AsRef<Path>) -> Result<LoadedCloud, CloudIoError> {
    let text = fs::read_to_string(&path)?;
    let mut cloud = parse_vg(&text)?;
    let report = sanitize(&mut cloud)?;
    debug!(
        points = cloud.point_count(),
        groups = cloud.group_count(),
        "loaded vertex-group cloud"
    );
    Ok(LoadedCloud {
        cloud,
        report,
        format: CloudFormat::Vg,
        path: path.as_ref().to_path_buf(),
    })
}

pub fn load_json(path: impl AsRef<Path>) -> Result<LoadedCloud, CloudIoError> {
    let text = fs::read_to_string(&path)?;
    let mut cloud: PointCloud = serde_json::from_str(&text)?;
    let report = sanitize(&mut cloud)?;
    Ok(LoadedCloud {
        cloud,
        report,
        format: CloudFormat::Json,
        path: path.as_ref().to_path_buf(),
    })
}

struct Tokens<'a> {
    inner: std::iter::Peekable<std::str::SplitWhitespace<'a>>,
}

impl<'a> Tokens<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            inner: source.split_whitespace().peekable(),
        }
    }

    fn peek_is(&mut self, key: &str) -> bool {
        self.inner
            .peek()
            .is_some_and(|tok| tok.trim_end_matches(':') == key)
    }

    fn key(&mut self, key: &str) -> Result<(), CloudIoError> {
        match self.inner.next() {
            Some(tok) if tok.trim_end_matches(':') == key => Ok(()),
            Some(tok) => Err(CloudIoError::Invalid(format!(
                "expected `{key}`, found `{tok}`"
            ))),
            None => Err(CloudIoError::Invalid(format!(
                "unexpected end of file, expected `{key}`"
            ))),
        }
    }

    fn word(&mut self) -> Result<&'a str, CloudIoError> {
        self.inner
            .next()
            .ok_or_else(|| CloudIoError::Invalid("unexpected end of file".into()))
    }

    fn value<T: FromStr>(&mut self) -> Result<T, CloudIoError> {
        let tok = self.word()?;
        T::from_str(tok).map_err(|_| CloudIoError::Invalid(format!("invalid number `{tok}`")))
    }

    fn triple(&mut self) -> Result<[f64; 3], CloudIoError> {
        Ok([self.value()?, self.value()?, self.value()?])
    }
}

/// Parses the ASCII vertex-group format: a `num_points` block, optional
/// `num_colors`/`num_normals` blocks and a `num_groups` block whose groups
/// may nest children. Children are flattened into the top-level list.
pub fn parse_vg(source: &str) -> Result<PointCloud, CloudIoError> {
    let mut tokens = Tokens::new(source);
    tokens.key("num_points")?;
    let count: usize = tokens.value()?;
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let [x, y, z] = tokens.triple()?;
        points.push(Point3::new(x, y, z));
    }

    if tokens.peek_is("num_colors") {
        tokens.key("num_colors")?;
        let colors: usize = tokens.value()?;
        for _ in 0..colors {
            tokens.triple()?;
        }
    }

    let mut normals = None;
    if tokens.peek_is("num_normals") {
        tokens.key("num_normals")?;
        let n: usize = tokens.value()?;
        let mut list = Vec::with_capacity(n);
        for _ in 0..n {
            let [x, y, z] = tokens.triple()?;
            list.push(Vector3::new(x, y, z));
        }
        if n > 0 {
            normals = Some(list);
        }
    }

    let mut groups = Vec::new();
    if tokens.peek_is("num_groups") {
        tokens.key("num_groups")?;
        let n: usize = tokens.value()?;
        for _ in 0..n {
            parse_vg_group(&mut tokens, &mut groups)?;
        }
    }

    Ok(PointCloud {
        points,
        normals,
        groups,
    })
}

fn parse_vg_group(tokens: &mut Tokens<'_>, out: &mut Vec<PlanarGroup>) -> Result<(), CloudIoError> {
    tokens.key("group_type")?;
    let group_type: i32 = tokens.value()?;
    tokens.key("num_group_parameters")?;
    let param_count: usize = tokens.value()?;
    tokens.key("group_parameters")?;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        params.push(tokens.value::<f64>()?);
    }
    tokens.key("group_label")?;
    let label = tokens.word()?.to_string();
    tokens.key("group_color")?;
    tokens.triple()?;
    tokens.key("group_num_point")?;
    let n: usize = tokens.value()?;
    let mut indices = Vec::with_capacity(n);
    for _ in 0..n {
        indices.push(tokens.value::<usize>()?);
    }

    let plane = if group_type == 0 && params.len() == 4 {
        Some([params[0], params[1], params[2], params[3]])
    } else {
        None
    };
    if group_type != 0 {
        warn!(label = %label, group_type, "non-planar group treated as planar");
    }
    out.push(PlanarGroup {
        label,
        indices,
        plane,
    });

    if tokens.peek_is("num_children") {
        tokens.key("num_children")?;
        let children: usize = tokens.value()?;
        for _ in 0..children {
            parse_vg_group(tokens, out)?;
        }
    }
    Ok(())
}

/// Serialises a cloud in the ASCII vertex-group format.
pub fn to_vg_string(cloud: &PointCloud) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "num_points: {}", cloud.points.len());
    for p in &cloud.points {
        let _ = writeln!(out, "{} {} {}", p.x, p.y, p.z);
    }
    let _ = writeln!(out, "num_colors: 0");
    match &cloud.normals {
        Some(normals) => {
            let _ = writeln!(out, "num_normals: {}", normals.len());
            for n in normals {
                let _ = writeln!(out, "{} {} {}", n.x, n.y, n.z);
            }
        }
        None => {
            let _ = writeln!(out, "num_normals: 0");
        }
    }
    let _ = writeln!(out, "num_groups: {}", cloud.groups.len());
    for group in &cloud.groups {
        let _ = writeln!(out, "group_type: 0");
        match group.plane {
            Some([a, b, c, d]) => {
                let _ = writeln!(out, "num_group_parameters: 4");
                let _ = writeln!(out, "group_parameters: {a} {b} {c} {d}");
            }
            None => {
                let _ = writeln!(out, "num_group_parameters: 0");
                let _ = writeln!(out, "group_parameters:");
            }
        }
        let label = if group.label.is_empty() {
            "unknown"
        } else {
            group.label.as_str()
        };
        let _ = writeln!(out, "group_label: {}", label.replace(char::is_whitespace, "_"));
        let _ = writeln!(out, "group_color: 0.5 0.5 0.5");
        let _ = writeln!(out, "group_num_point: {}", group.indices.len());
        let indices: Vec<String> = group.indices.iter().map(|i| i.to_string()).collect();
        let _ = writeln!(out, "{}", indices.join(" "));
        let _ = writeln!(out, "num_children: 0");
    }
    out
}

pub fn write_vg(path: impl AsRef<Path>, cloud: &PointCloud) -> Result<(), CloudIoError> {
    fs::write(path, to_vg_string(cloud))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_GROUPS: &str = r#"num_points: 4
0 0 0
1 0 0
0 1 0
0 0 1
num_colors: 4
1 0 0
1 0 0
1 0 0
1 0 0
num_normals: 4
0 0 1
0 0 1
0 0 1
1 0 0
num_groups: 1
group_type: 0
num_group_parameters: 4
group_parameters: 0 0 1 0
group_label: floor
group_color: 0.1 0.2 0.3
group_num_point: 3
0 1 2
num_children: 1
group_type: 0
num_group_parameters: 4
group_parameters: 1 0 0 0
group_label: wall
group_color: 0.1 0.2 0.3
group_num_point: 2
0 3
num_children: 0
"#;

    #[test]
    fn parses_vertex_group_file_with_children() {
        let cloud = parse_vg(TWO_GROUPS).expect("vg parsed");
        assert_eq!(cloud.point_count(), 4);
        assert_eq!(cloud.group_count(), 2);
        assert_eq!(cloud.groups[0].label, "floor");
        assert_eq!(cloud.groups[0].plane, Some([0.0, 0.0, 1.0, 0.0]));
        assert_eq!(cloud.groups[1].indices, vec![0, 3]);
        assert_eq!(cloud.normals.as_ref().map(Vec::len), Some(4));
    }

    #[test]
    fn truncated_vertex_group_file_is_rejected() {
        let err = parse_vg("num_points: 3\n0 0 0\n1 0").unwrap_err();
        assert!(matches!(err, CloudIoError::Invalid(_)));
    }

    #[test]
    fn sanitize_drops_out_of_range_indices_and_empty_groups() {
        let mut cloud = PointCloud {
            points: vec![Point3::origin(); 3],
            normals: None,
            groups: vec![
                PlanarGroup {
                    label: "a".into(),
                    indices: vec![0, 1, 7],
                    plane: None,
                },
                PlanarGroup {
                    label: "b".into(),
                    indices: vec![9],
                    plane: None,
                },
            ],
        };
        let report = sanitize(&mut cloud).expect("sanitize");
        assert_eq!(report.dropped_indices, 2);
        assert_eq!(report.dropped_groups, 1);
        assert_eq!(cloud.groups.len(), 1);
    }

    #[test]
    fn sanitize_rejects_empty_cloud() {
        let mut cloud = PointCloud::new();
        assert!(matches!(sanitize(&mut cloud), Err(CloudIoError::Empty)));
    }

    #[test]
    fn load_dispatches_on_extension() {
        let mut file = tempfile::Builder::new().suffix(".vg").tempfile().unwrap();
        file.write_all(TWO_GROUPS.as_bytes()).unwrap();
        let loaded = load_point_cloud(file.path()).expect("load vg");
        assert_eq!(loaded.format, CloudFormat::Vg);
        assert_eq!(loaded.cloud.group_count(), 2);

        let unsupported = tempfile::Builder::new().suffix(".xyz").tempfile().unwrap();
        assert!(matches!(
            load_point_cloud(unsupported.path()),
            Err(CloudIoError::Unsupported(_))
        ));
    }

    #[test]
    fn json_cloud_loads() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let json = r#"{"points": [[0,0,0],[1,0,0],[0,1,0]],
                       "groups": [{"label": "g", "indices": [0,1,2]}]}"#;
        file.write_all(json.as_bytes()).unwrap();
        let loaded = load_point_cloud(file.path()).expect("load json");
        assert_eq!(loaded.format, CloudFormat::Json);
        assert_eq!(loaded.cloud.point_count(), 3);
        assert!(loaded.cloud.groups[0].plane.is_none());
    }

    #[test]
    fn written_file_parses_back() {
        let cloud = parse_vg(TWO_GROUPS).unwrap();
        let reparsed = parse_vg(&to_vg_string(&cloud)).expect("reparse");
        assert_eq!(reparsed.groups, cloud.groups);
        assert_eq!(reparsed.points, cloud.points);
    }

    #[test]
    fn sampled_box_has_one_group_per_face() {
        let cloud = sample_box(Point3::origin(), Point3::new(1.0, 2.0, 3.0), 4);
        assert_eq!(cloud.group_count(), 6);
        assert_eq!(cloud.point_count(), 96);
        for group in &cloud.groups {
            let [a, b, c, d] = group.plane.expect("plane given");
            for &i in &group.indices {
                let p = cloud.points[i];
                assert!((a * p.x + b * p.y + c * p.z + d).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn scaling_moves_points_and_plane_offsets() {
        let mut cloud = parse_vg(TWO_GROUPS).unwrap();
        cloud.groups[0].plane = Some([0.0, 0.0, 1.0, -1.0]);
        let scaled = cloud.scaled(3.0);
        assert_eq!(scaled.points[1], Point3::new(3.0, 0.0, 0.0));
        assert_eq!(scaled.groups[0].plane, Some([0.0, 0.0, 1.0, -3.0]));
    }
}
