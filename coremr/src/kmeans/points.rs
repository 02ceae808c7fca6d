use std::{
    fs::File,
    io::{BufRead, BufReader},
};

use crate::helpe::*;

/// Points packed as records: `dim` coordinates plus a cluster label.
#[derive(Debug, Clone, PartialEq)]
pub struct PointBuffer {
    layout: RecordLayout,
    bytes:  Vec<u8>,
}

impl PointBuffer {
    pub fn new(dim: usize) -> Self {
        Self { layout: RecordLayout::new(dim), bytes: vec![] }
    }

    /// Builds a buffer from row-major coordinates. Labels start at 0.
    pub fn from_coords(dim: usize, coords: &[f64]) -> Result<Self, MrError> {
        if dim == 0 || coords.len() % dim != 0 {
            return Err(MrError::Config(format!(
                "{} coordinates do not form points of dimension {}", coords.len(), dim
            )));
        }
        let mut res = Self::new(dim);
        for p in coords.chunks_exact(dim) {
            res.push(p);
        }

        Ok(res)
    }

    /// Adopts already packed records, labels included.
    pub fn from_records(dim: usize, bytes: Vec<u8>) -> Result<Self, MrError> {
        let layout = RecordLayout::new(dim);
        if dim == 0 || bytes.len() % layout.stride() != 0 {
            return Err(MrError::Config(format!(
                "{} bytes are not a whole number of {}-dimensional records", bytes.len(), dim
            )));
        }

        Ok(Self { layout, bytes })
    }

    pub fn push(&mut self, features: &[f64]) {
        self.layout.encode(features, 0.0, &mut self.bytes);
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn dim(&self) -> usize {
        self.layout.dim()
    }

    pub fn len(&self) -> usize {
        self.layout.count(self.bytes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn records(&self) -> Records<'_> {
        self.layout.view(&self.bytes)
    }

    pub fn labels(&self) -> Vec<usize> {
        self.records().iter().map(|r| r.label() as usize).collect()
    }

    pub fn point(&self, idx: usize) -> Vec<f64> {
        self.records().get(idx).features().collect()
    }
}

impl Splittable for PointBuffer {
    type Part<'a> = &'a mut [u8];

    fn units(&self) -> usize {
        self.bytes.len()
    }

    fn split<'a>(&'a mut self, plan: &[Partition]) -> Vec<&'a mut [u8]> {
        split_slice_mut(&mut self.bytes, plan)
    }
}

/// What loading a text dataset had to put up with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub lines:      usize,
    pub points:     usize,
    /// 1-based numbers of lines skipped for having the wrong value count.
    pub skipped:    Vec<usize>,
}

enum ParsedLine {
    Point(Vec<f64>),
    Blank,
    Mismatch(usize),
}

/// Reads leading numeric tokens; the first token that is not a number ends
/// the line.
fn parse_line(line: &str, dim: usize) -> ParsedLine {
    let values: Vec<f64> = line
        .split_whitespace()
        .map_while(|tok| tok.parse::<f64>().ok())
        .collect();
    match values.len() {
        0 => ParsedLine::Blank,
        n if n == dim => ParsedLine::Point(values),
        n => ParsedLine::Mismatch(n),
    }
}

/// Loads whitespace-separated points, one per line.
///
/// Lines with no leading number are skipped silently. Lines with the wrong
/// number of values are skipped with a warning. Ending up with no points at
/// all is an error.
pub fn load_points(path: &Path, dim: usize) -> Result<(PointBuffer, LoadReport), MrError> {
    if dim == 0 {
        return Err(MrError::Config("dimensions must be > 0".into()));
    }
    let io_err = |source| MrError::Io { path: path.to_path_buf(), source };
    let file = File::open(path).map_err(io_err)?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()
        .map_err(io_err)?;

    let parsed: Vec<ParsedLine> = lines
        .par_iter()
        .map(|l| parse_line(l, dim))
        .collect();

    let mut points = PointBuffer::new(dim);
    let mut report = LoadReport { lines: lines.len(), ..Default::default() };
    for (idx, p) in parsed.into_iter().enumerate() {
        match p {
            ParsedLine::Point(v) => points.push(&v),
            ParsedLine::Blank => {}
            ParsedLine::Mismatch(got) => {
                let e = MrError::DataFormat { line: idx + 1, expected: dim, got };
                warn!("skipping {}: {e}", path.display());
                report.skipped.push(idx + 1);
            }
        }
    }
    if points.is_empty() {
        return Err(MrError::EmptyDataset(path.to_path_buf()));
    }
    report.points = points.len();
    info!(path = %path.display(), points = report.points, skipped = report.skipped.len(), "dataset loaded");

    Ok((points, report))
}
