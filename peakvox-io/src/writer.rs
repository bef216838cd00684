//! Raw volume writer and peak table export.

use crate::reader::RawHeader;
use crate::{Error, Result};
use peakvox_algorithms::Peak;
use peakvox_core::{ensure_shape, FrameSource};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes every frame of `source` as a raw volume.
///
/// Values are narrowed to `f32`.
///
/// # Errors
/// Returns [`Error::InvalidFormat`] if a dimension does not fit the
/// header, and propagates frame read and write errors.
#[allow(clippy::cast_possible_truncation)]
pub fn write_raw_volume<P, S>(path: P, source: &S) -> Result<()>
where
    P: AsRef<Path>,
    S: FrameSource + ?Sized,
{
    let dim = |n: usize| {
        u32::try_from(n).map_err(|_| Error::InvalidFormat(format!("dimension {n} exceeds u32")))
    };
    let header = RawHeader {
        n_frames: dim(source.n_frames())?,
        n_rows: dim(source.n_rows())?,
        n_cols: dim(source.n_cols())?,
    };
    let shape = source.frame_shape();

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&header.to_bytes())?;
    for index in 0..source.n_frames() {
        let frame = source.frame(index)?;
        ensure_shape(&frame, shape)?;
        for &value in &frame {
            writer.write_all(&(value as f32).to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// One exported peak.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakRow {
    pub label: u32,
    /// Feature passed the size and detector checks.
    pub selected: bool,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Semi-axes of the fitted ellipsoid, ascending.
    pub radii: [f64; 3],
    pub mass: f64,
    pub components: usize,
    pub intensity: Option<f64>,
    pub sigma: Option<f64>,
    pub background: Option<f64>,
    pub strength: Option<f64>,
    pub p_value: Option<f64>,
    /// Integration kept its shape update.
    pub integration_selected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_frame: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rocking_curve: Vec<f64>,
    /// Why integration failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Peak> for PeakRow {
    fn from(peak: &Peak) -> Self {
        let feature = &peak.feature;
        let center = feature.shape.center();
        let radii = feature.shape.radii();
        let integrated = peak.integrated();
        let error = match &peak.integration {
            Some(Err(err)) => Some(err.to_string()),
            _ => None,
        };
        Self {
            label: feature.label,
            selected: feature.selected,
            x: center.x,
            y: center.y,
            z: center.z,
            radii: [radii[0], radii[1], radii[2]],
            mass: feature.blob.mass(),
            components: feature.blob.component_count(),
            intensity: integrated.map(|i| i.intensity),
            sigma: integrated.map(|i| i.sigma),
            background: integrated.map(|i| i.background_mean),
            strength: integrated.map(peakvox_algorithms::Integration::strength),
            p_value: integrated.map(|i| i.p_value),
            integration_selected: integrated.map(|i| i.selected),
            first_frame: integrated.map(|i| i.first_frame),
            rocking_curve: integrated.map(|i| i.rocking_curve.clone()).unwrap_or_default(),
            error,
        }
    }
}

/// Writer for peak tables.
pub struct PeakWriter<W: Write> {
    writer: BufWriter<W>,
}

impl PeakWriter<File> {
    /// Creates a writer for a new file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> PeakWriter<W> {
    /// Wraps any writer.
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
        }
    }

    /// Writes peaks as CSV, one row per peak.
    ///
    /// Missing integration values are left empty. Rocking curves are only
    /// part of the JSON export.
    ///
    /// # Errors
    /// Propagates write errors.
    pub fn write_csv(&mut self, rows: &[PeakRow]) -> Result<()> {
        writeln!(
            self.writer,
            "label,selected,x,y,z,r1,r2,r3,mass,components,intensity,sigma,background,strength,p_value,integration_selected"
        )?;
        for row in rows {
            writeln!(
                self.writer,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                row.label,
                row.selected,
                row.x,
                row.y,
                row.z,
                row.radii[0],
                row.radii[1],
                row.radii[2],
                row.mass,
                row.components,
                optional(row.intensity),
                optional(row.sigma),
                optional(row.background),
                optional(row.strength),
                optional(row.p_value),
                optional(row.integration_selected),
            )?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Writes peaks as a pretty-printed JSON array.
    ///
    /// # Errors
    /// Propagates serialization and write errors.
    pub fn write_json(&mut self, rows: &[PeakRow]) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, rows)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the wrapped writer.
    ///
    /// # Errors
    /// Returns an error if buffered data cannot be flushed.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| Error::Io(err.into_error()))
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
