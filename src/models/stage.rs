use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ExtractFrames,
    DetectPockets,
    ClusterPockets,
    Docking,
}

/// A file a stage must leave behind, non-empty, for the run to count as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutput {
    File(&'static str),
    AnyWithExtension(&'static str),
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::ExtractFrames,
        Stage::DetectPockets,
        Stage::ClusterPockets,
        Stage::Docking,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ExtractFrames => "extract_frames",
            Stage::DetectPockets => "detect_pockets",
            Stage::ClusterPockets => "cluster_pockets",
            Stage::Docking => "docking",
        }
    }

    /// Subdirectory of the job root owned by this stage.
    pub fn dir_name(self) -> &'static str {
        self.as_str()
    }

    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::ExtractFrames => None,
            Stage::DetectPockets => Some(Stage::ExtractFrames),
            Stage::ClusterPockets => Some(Stage::DetectPockets),
            Stage::Docking => Some(Stage::ClusterPockets),
        }
    }

    pub fn expected_outputs(self) -> &'static [ExpectedOutput] {
        match self {
            Stage::ExtractFrames => &[ExpectedOutput::AnyWithExtension("pdb")],
            Stage::DetectPockets => &[ExpectedOutput::File("pockets.csv")],
            Stage::ClusterPockets => &[
                ExpectedOutput::File("pockets_clustered.csv"),
                ExpectedOutput::File("cluster_representatives.csv"),
            ],
            Stage::Docking => &[ExpectedOutput::File("docking_results.csv")],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::InvalidRequest(format!("Unknown stage '{}'", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractParams {
    /// Trajectory file name inside the job's uploads.
    pub trajectory: String,
    /// Topology file name inside the job's uploads.
    pub topology: String,
    #[serde(default = "default_stride")]
    pub stride: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectParams {
    #[serde(default = "default_num_threads")]
    pub num_threads: u32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMethod {
    #[default]
    Dbscan,
    Hierarchical,
}

impl ClusterMethod {
    fn as_str(self) -> &'static str {
        match self {
            ClusterMethod::Dbscan => "dbscan",
            ClusterMethod::Hierarchical => "hierarchical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterParams {
    #[serde(default = "default_min_prob")]
    pub min_prob: f64,
    #[serde(default)]
    pub method: ClusterMethod,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            min_prob: default_min_prob(),
            method: ClusterMethod::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DockingParams {
    /// Ligand file, or directory unpacked from an uploaded archive, inside the uploads.
    pub ligands: String,
    #[serde(default = "default_num_poses")]
    pub num_poses: u32,
    #[serde(default = "default_exhaustiveness")]
    pub exhaustiveness: u32,
    #[serde(default = "default_ph")]
    pub ph: f64,
    #[serde(default = "default_box_size")]
    pub box_size: [f64; 3],
}

fn default_stride() -> u32 {
    10
}

fn default_num_threads() -> u32 {
    4
}

fn default_min_prob() -> f64 {
    0.5
}

fn default_num_poses() -> u32 {
    10
}

fn default_exhaustiveness() -> u32 {
    8
}

fn default_ph() -> f64 {
    7.4
}

fn default_box_size() -> [f64; 3] {
    [20.0; 3]
}

/// Stage parameters as submitted, tagged with the stage they belong to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", content = "params", rename_all = "snake_case")]
pub enum StageParams {
    ExtractFrames(ExtractParams),
    DetectPockets(DetectParams),
    ClusterPockets(ClusterParams),
    Docking(DockingParams),
}

impl StageParams {
    /// Decode an untagged submission body for `stage`. A null body means
    /// "all defaults", which only stages without required fields accept.
    pub fn from_json(stage: Stage, body: serde_json::Value) -> Result<Self, PipelineError> {
        let body = if body.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            body
        };
        let bad = |e: serde_json::Error| {
            PipelineError::InvalidRequest(format!("Invalid parameters for {}: {}", stage, e))
        };
        let params = match stage {
            Stage::ExtractFrames => {
                StageParams::ExtractFrames(serde_json::from_value(body).map_err(bad)?)
            }
            Stage::DetectPockets => {
                StageParams::DetectPockets(serde_json::from_value(body).map_err(bad)?)
            }
            Stage::ClusterPockets => {
                StageParams::ClusterPockets(serde_json::from_value(body).map_err(bad)?)
            }
            Stage::Docking => StageParams::Docking(serde_json::from_value(body).map_err(bad)?),
        };
        Ok(params)
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageParams::ExtractFrames(_) => Stage::ExtractFrames,
            StageParams::DetectPockets(_) => Stage::DetectPockets,
            StageParams::ClusterPockets(_) => Stage::ClusterPockets,
            StageParams::Docking(_) => Stage::Docking,
        }
    }

    /// Upload names these parameters point at, relative to the uploads directory.
    pub fn referenced_uploads(&self) -> Vec<&str> {
        match self {
            StageParams::ExtractFrames(p) => vec![p.trajectory.as_str(), p.topology.as_str()],
            StageParams::Docking(p) => vec![p.ligands.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut errors = Vec::new();

        for name in self.referenced_uploads() {
            if let Err(reason) = check_upload_ref(name) {
                errors.push(format!("'{}' {}", name, reason));
            }
        }

        match self {
            StageParams::ExtractFrames(p) => {
                if p.stride == 0 {
                    errors.push("stride must be at least 1".to_string());
                }
            }
            StageParams::DetectPockets(p) => {
                if !(1..=256).contains(&p.num_threads) {
                    errors.push("num_threads must be between 1 and 256".to_string());
                }
            }
            StageParams::ClusterPockets(p) => {
                if !(0.0..=1.0).contains(&p.min_prob) {
                    errors.push("min_prob must be between 0 and 1".to_string());
                }
            }
            StageParams::Docking(p) => {
                if !(1..=100).contains(&p.num_poses) {
                    errors.push("num_poses must be between 1 and 100".to_string());
                }
                if !(1..=64).contains(&p.exhaustiveness) {
                    errors.push("exhaustiveness must be between 1 and 64".to_string());
                }
                if !(0.0..=14.0).contains(&p.ph) {
                    errors.push("ph must be between 0 and 14".to_string());
                }
                if p.box_size.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                    errors.push("box_size dimensions must be positive".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::InvalidRequest(errors.join("; ")))
        }
    }

    /// Tool flags for these parameters. File references resolve against `uploads`.
    pub fn to_flags(&self, uploads: &Path) -> Vec<String> {
        let path = |name: &str| uploads.join(name).to_string_lossy().into_owned();
        match self {
            StageParams::ExtractFrames(p) => vec![
                "--xtc".to_string(),
                path(&p.trajectory),
                "--topology".to_string(),
                path(&p.topology),
                "--stride".to_string(),
                p.stride.to_string(),
            ],
            StageParams::DetectPockets(p) => {
                vec!["--numthreads".to_string(), p.num_threads.to_string()]
            }
            StageParams::ClusterPockets(p) => vec![
                "--min_prob".to_string(),
                p.min_prob.to_string(),
                "--method".to_string(),
                p.method.as_str().to_string(),
            ],
            StageParams::Docking(p) => {
                let mut flags = vec![
                    "--ligands".to_string(),
                    path(&p.ligands),
                    "--num_poses".to_string(),
                    p.num_poses.to_string(),
                    "--exhaustiveness".to_string(),
                    p.exhaustiveness.to_string(),
                    "--ph".to_string(),
                    p.ph.to_string(),
                    "--box_size".to_string(),
                ];
                flags.extend(p.box_size.iter().map(|s| s.to_string()));
                flags
            }
        }
    }
}

fn check_upload_ref(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("is empty");
    }
    if name == "." || name == ".." {
        return Err("is not a file name");
    }
    if name.contains(['/', '\\', '\0']) {
        return Err("must be a plain upload name");
    }
    Ok(())
}
