use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use cloud_io::{sample_box, write_vg};
use nalgebra::Point3;
use tempfile::tempdir;

fn write_box(path: &Path, max: Point3<f64>) -> Result<(), Box<dyn std::error::Error>> {
    write_vg(path, &sample_box(Point3::origin(), max, 6))?;
    Ok(())
}

#[test]
fn reconstructs_box_in_every_format() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("box.vg");
    write_box(&input, Point3::new(2.0, 1.0, 1.0))?;
    for ext in ["obj", "off", "ply", "stl"] {
        let output = dir.path().join(format!("box.{ext}"));
        let report = dir.path().join(format!("box-{ext}.json"));
        let mut cmd = cargo_bin_cmd!("polyfit");
        cmd.arg("-i")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .arg("--report")
            .arg(&report);
        cmd.assert().success();

        let mesh = std::fs::read_to_string(&output)?;
        match ext {
            "obj" => assert_eq!(mesh.lines().filter(|l| l.starts_with("f ")).count(), 6),
            "off" => assert!(mesh.starts_with("OFF\n8 6 0")),
            "ply" => assert!(mesh.contains("element face 6")),
            _ => assert_eq!(mesh.matches("facet normal").count(), 12),
        }
        let json = std::fs::read_to_string(&report)?;
        assert!(json.contains("\"faces\""), "report missing faces for {ext}");
        assert!(json.contains("\"is_closed\": true"), "surface not closed for {ext}");
    }
    Ok(())
}

#[test]
fn weights_given_together_are_all_applied() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("cube.vg");
    write_box(&input, Point3::new(1.0, 1.0, 1.0))?;
    let report = dir.path().join("qa.json");
    let mut cmd = cargo_bin_cmd!("polyfit");
    cmd.args(["-f", "0.5", "-c", "0.2", "-x", "0.3"])
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("cube.obj"))
        .arg("--report")
        .arg(&report);
    cmd.assert().success();
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report)?)?;
    assert_eq!(json["weights"]["data_fitting"], 0.5);
    assert_eq!(json["weights"]["model_coverage"], 0.2);
    assert_eq!(json["weights"]["model_complexity"], 0.3);
    Ok(())
}

#[test]
fn missing_input_fails_without_output() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let output = dir.path().join("out.obj");
    let mut cmd = cargo_bin_cmd!("polyfit");
    cmd.arg("-i")
        .arg(dir.path().join("absent.vg"))
        .arg("-o")
        .arg(&output);
    cmd.assert().failure();
    assert!(!output.exists());
    Ok(())
}

#[test]
fn infeasible_quota_fails_without_output() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("cube.vg");
    write_box(&input, Point3::new(1.0, 1.0, 1.0))?;
    let output = dir.path().join("out.obj");
    let mut cmd = cargo_bin_cmd!("polyfit");
    cmd.arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["--min-faces", "1000"]);
    let assert = cmd.assert().failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("infeasible"), "unexpected stderr: {stderr}");
    assert!(!output.exists());
    Ok(())
}

#[test]
fn lists_solver_backends() {
    let mut cmd = cargo_bin_cmd!("polyfit");
    cmd.arg("--list-solvers");
    let assert = cmd.assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("branch-and-bound"));
    assert!(stdout.contains("microlp"));
}
