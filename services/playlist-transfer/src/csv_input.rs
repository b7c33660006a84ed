//!
//! src/csv_input.rs  Andrew Belles  Oct 7th, 2025
//!
//! Reads the uploaded track list. The first row is a header, every
//! following row is `track,artist` with any further columns ignored.
//!

use csv::{ReaderBuilder, Trim};
use tracing::debug;

use crate::types::TrackQuery;
use crate::TransferError;

pub fn parse_tracks(csv_text: &str) -> Result<Vec<TrackQuery>, TransferError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(csv_text.as_bytes());

    let mut tracks = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }

        match (record.get(0), record.get(1)) {
            (Some(title), Some(artist)) if !title.is_empty() && !artist.is_empty() =>
                tracks.push(TrackQuery::new(artist, title)),
            _ => return Err(TransferError::Csv(
                format!("row {} needs a track and an artist", row + 2)
            ))
        }
    }

    if tracks.is_empty() {
        return Err(TransferError::Csv("no tracks in file".into()));
    }
    debug!(tracks = tracks.len(), "csv.parsed");
    Ok(tracks)
}
