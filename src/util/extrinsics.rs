//! Delimited tables written next to a calibration run.
//!
//! * extrinsics: `filename,rvec_x,rvec_y,rvec_z,tvec_x,tvec_y,tvec_z,reproj_rms_px`
//! * per-view errors: `filename,mean_px,rms_px,max_px`

use crate::geometry::Pose;
use crate::util::{ProjectionError, UtilError};
use csv::{Reader, Writer};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One row of the extrinsics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicsRecord {
    pub filename: String,
    pub rvec_x: f64,
    pub rvec_y: f64,
    pub rvec_z: f64,
    pub tvec_x: f64,
    pub tvec_y: f64,
    pub tvec_z: f64,
    pub reproj_rms_px: f64,
}

impl ExtrinsicsRecord {
    pub fn new(filename: &str, pose: &Pose, reproj_rms_px: f64) -> Self {
        let r = pose.rvec();
        let t = pose.translation();
        ExtrinsicsRecord {
            filename: filename.to_string(),
            rvec_x: r.x,
            rvec_y: r.y,
            rvec_z: r.z,
            tvec_x: t.x,
            tvec_y: t.y,
            tvec_z: t.z,
            reproj_rms_px,
        }
    }

    pub fn pose(&self) -> Result<Pose, UtilError> {
        Ok(Pose::from_rvec_tvec(
            &Vector3::new(self.rvec_x, self.rvec_y, self.rvec_z),
            &Vector3::new(self.tvec_x, self.tvec_y, self.tvec_z),
        )?)
    }
}

/// Extrinsics rows keyed by image filename.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtrinsicsTable {
    pub records: Vec<ExtrinsicsRecord>,
}

fn basename(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
}

impl ExtrinsicsTable {
    pub fn push(&mut self, record: ExtrinsicsRecord) {
        self.records.push(record);
    }

    /// Exact filename match first, then a match on the basename.
    pub fn find(&self, filename: &str) -> Option<&ExtrinsicsRecord> {
        self.records
            .iter()
            .find(|r| r.filename == filename)
            .or_else(|| {
                let wanted = basename(filename);
                self.records.iter().find(|r| basename(&r.filename) == wanted)
            })
    }

    pub fn pose_for(&self, filename: &str) -> Result<Pose, UtilError> {
        self.find(filename)
            .ok_or_else(|| UtilError::MissingRecord(filename.to_string()))?
            .pose()
    }

    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), UtilError> {
        let mut writer = Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Self, UtilError> {
        let mut reader = Reader::from_path(path)?;
        let records = reader
            .deserialize()
            .collect::<Result<Vec<ExtrinsicsRecord>, csv::Error>>()?;
        Ok(ExtrinsicsTable { records })
    }
}

/// One row of the per-view error table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewErrorRecord {
    pub filename: String,
    pub mean_px: f64,
    pub rms_px: f64,
    pub max_px: f64,
}

impl ViewErrorRecord {
    pub fn new(filename: &str, error: &ProjectionError) -> Self {
        ViewErrorRecord {
            filename: filename.to_string(),
            mean_px: error.mean,
            rms_px: error.rmse,
            max_px: error.max,
        }
    }
}

/// Writes the per-view table, worst view first when `worst_first` is set.
pub fn save_view_errors<P: AsRef<Path>>(
    path: P,
    records: &[ViewErrorRecord],
    worst_first: bool,
) -> Result<(), UtilError> {
    let mut rows = records.to_vec();
    if worst_first {
        rows.sort_by(|a, b| b.rms_px.total_cmp(&a.rms_px));
    }
    let mut writer = Writer::from_path(path)?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn load_view_errors<P: AsRef<Path>>(path: P) -> Result<Vec<ViewErrorRecord>, UtilError> {
    let mut reader = Reader::from_path(path)?;
    Ok(reader
        .deserialize()
        .collect::<Result<Vec<ViewErrorRecord>, csv::Error>>()?)
}
