use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::Position;

const HEADER: [&str; 6] = [
    "timestamp_ms",
    "latitude",
    "longitude",
    "accuracy",
    "speed",
    "bearing",
];

// One csv row; field names double as the header.
#[derive(Serialize, Deserialize)]
struct TraceRow {
    timestamp_ms: i64,
    latitude: f64,
    longitude: f64,
    accuracy: Option<f32>,
    speed: Option<f32>,
    bearing: Option<f32>,
}

impl From<&Position> for TraceRow {
    fn from(position: &Position) -> Self {
        TraceRow {
            timestamp_ms: position
                .timestamp_ms
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy: position.accuracy,
            speed: position.speed,
            bearing: position.bearing,
        }
    }
}

impl From<TraceRow> for Position {
    fn from(row: TraceRow) -> Self {
        Position {
            latitude: row.latitude,
            longitude: row.longitude,
            accuracy: row.accuracy,
            speed: row.speed,
            bearing: row.bearing,
            timestamp_ms: Some(row.timestamp_ms),
        }
    }
}

/* Debug feature, off by default: every position fix the session receives is
   appended to a csv file so a drive can be replayed later. A new file is
   started for every recorder, i.e. every session.
*/
pub struct TraceRecorder {
    dir: PathBuf,
    file: Option<(PathBuf, csv::Writer<File>)>,
}

impl TraceRecorder {
    pub fn new(dir: &Path) -> Result<TraceRecorder> {
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create trace directory {}", dir.display()))?;
        Ok(TraceRecorder {
            dir: dir.to_path_buf(),
            file: None,
        })
    }

    /// The file being written, once the first fix has been recorded.
    pub fn current_file(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }

    fn open_next(&self) -> Result<(PathBuf, csv::Writer<File>)> {
        let timestamp_sec = Utc::now().timestamp();
        let mut i = 0;
        let path = loop {
            let path = self.dir.join(format!("gps-{}-{}.csv", timestamp_sec, i));
            if !path.exists() {
                break path;
            }
            i += 1;
        };
        // the header goes out with the first serialized row
        let writer = csv::Writer::from_path(&path)?;
        Ok((path, writer))
    }

    pub fn record(&mut self, position: &Position) -> Result<()> {
        if self.file.is_none() {
            self.file = Some(self.open_next()?);
        }
        let Some((_, writer)) = self.file.as_mut() else {
            return Ok(());
        };
        writer.serialize(TraceRow::from(position))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some((_, writer)) = self.file.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for TraceRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("failed to flush gps trace: {:?}", e);
        }
    }
}

/// Reads back a file written by [`TraceRecorder`].
pub fn load_trace(path: &Path) -> Result<Vec<Position>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers = reader.headers()?;
    if headers.iter().ne(HEADER.iter().copied()) {
        bail!("not a gps trace: unexpected header {:?}", headers);
    }

    let mut positions = Vec::new();
    for (i, row) in reader.deserialize::<TraceRow>().enumerate() {
        // header is line 1
        let row = row.with_context(|| format!("line {}", i + 2))?;
        positions.push(row.into());
    }
    Ok(positions)
}
