//! Binary row tables.
//!
//! Layout (little endian):
//!   file header  : magic "QVTB" | version u32 | table name [32] | column count u32 | row count u64
//!   per column   : column name [32] | type code u8
//!   per row/cell : f32 | u8 bool | i32 | u32 length + f32 items | u32 length + i64 items
//! The row count is written as zero and patched on finalize.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::calib::Stage;
use crate::qvec::{SubPopulation, SubPopulationSet};
use crate::task::{EventOutput, HarmonicQVectors};

const MAGIC: [u8; 4] = *b"QVTB";
const FORMAT_VERSION: u32 = 1;
const NAME_LEN: usize = 32;
const FILE_HEADER_SIZE: usize = 4 + 4 + NAME_LEN + 4 + 8;
const ROW_COUNT_OFFSET: u64 = (4 + 4 + NAME_LEN + 4) as u64;
pub const TABLE_EXTENSION: &str = "qvtb";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("name '{0}' does not fit in 32 bytes")]
    NameTooLong(String),
    #[error("table {table}: expected {expected} cells, got {got}")]
    CellCount {
        table: String,
        expected: usize,
        got: usize,
    },
    #[error("table {table}: column {column} expects {expected:?}")]
    CellType {
        table: String,
        column: String,
        expected: ColumnType,
    },
    #[error("{}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    F32 = 1,
    Bool = 2,
    I32 = 3,
    VecF32 = 4,
    VecI64 = 5,
}

impl ColumnType {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ColumnType::F32),
            2 => Some(ColumnType::Bool),
            3 => Some(ColumnType::I32),
            4 => Some(ColumnType::VecF32),
            5 => Some(ColumnType::VecI64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    F32(f32),
    Bool(bool),
    I32(i32),
    VecF32(Vec<f32>),
    VecI64(Vec<i64>),
}

impl Cell {
    pub fn kind(&self) -> ColumnType {
        match self {
            Cell::F32(_) => ColumnType::F32,
            Cell::Bool(_) => ColumnType::Bool,
            Cell::I32(_) => ColumnType::I32,
            Cell::VecF32(_) => ColumnType::VecF32,
            Cell::VecI64(_) => ColumnType::VecI64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    if offset + 4 <= buf.len() {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

fn write_fixed_ascii(buf: &mut [u8], offset: usize, value: &str) -> Result<(), OutputError> {
    let src = value.as_bytes();
    if src.len() > NAME_LEN || offset + NAME_LEN > buf.len() {
        return Err(OutputError::NameTooLong(value.to_string()));
    }
    let dst = &mut buf[offset..offset + NAME_LEN];
    dst.fill(0);
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

fn read_fixed_ascii(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn build_file_header(name: &str, columns: &[Column]) -> Result<Vec<u8>, OutputError> {
    let mut out = vec![0u8; FILE_HEADER_SIZE];
    out[0..4].copy_from_slice(&MAGIC);
    write_u32_le(&mut out, 4, FORMAT_VERSION);
    write_fixed_ascii(&mut out, 8, name)?;
    write_u32_le(&mut out, 8 + NAME_LEN, columns.len() as u32);
    // row count stays zero until finalize
    for col in columns {
        let mut desc = [0u8; NAME_LEN + 1];
        write_fixed_ascii(&mut desc, 0, &col.name)?;
        desc[NAME_LEN] = col.kind as u8;
        out.extend_from_slice(&desc);
    }
    Ok(out)
}

pub struct TableWriter {
    path: PathBuf,
    name: String,
    columns: Vec<Column>,
    writer: BufWriter<File>,
    rows_written: u64,
}

impl TableWriter {
    pub fn create(path: &Path, name: &str, columns: Vec<Column>) -> Result<Self, OutputError> {
        let header = build_file_header(name, &columns)?;
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&header)?;
        Ok(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            columns,
            writer,
            rows_written: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn write_row(&mut self, cells: &[Cell]) -> Result<(), OutputError> {
        if cells.len() != self.columns.len() {
            return Err(OutputError::CellCount {
                table: self.name.clone(),
                expected: self.columns.len(),
                got: cells.len(),
            });
        }
        for (cell, col) in cells.iter().zip(&self.columns) {
            if cell.kind() != col.kind {
                return Err(OutputError::CellType {
                    table: self.name.clone(),
                    column: col.name.clone(),
                    expected: col.kind,
                });
            }
        }
        for cell in cells {
            match cell {
                Cell::F32(v) => self.writer.write_all(&v.to_le_bytes())?,
                Cell::Bool(v) => self.writer.write_all(&[u8::from(*v)])?,
                Cell::I32(v) => self.writer.write_all(&v.to_le_bytes())?,
                Cell::VecF32(items) => {
                    self.writer.write_all(&(items.len() as u32).to_le_bytes())?;
                    for v in items {
                        self.writer.write_all(&v.to_le_bytes())?;
                    }
                }
                Cell::VecI64(items) => {
                    self.writer.write_all(&(items.len() as u32).to_le_bytes())?;
                    for v in items {
                        self.writer.write_all(&v.to_le_bytes())?;
                    }
                }
            }
        }
        self.rows_written += 1;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<PathBuf, OutputError> {
        self.writer.flush()?;
        {
            let file = self.writer.get_mut();
            file.seek(SeekFrom::Start(ROW_COUNT_OFFSET))?;
            file.write_all(&self.rows_written.to_le_bytes())?;
            file.flush()?;
        }
        info!("[output] {}: {} row(s) -> {}", self.name, self.rows_written, self.path.display());
        Ok(self.path)
    }
}

/// A table read back into memory.
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

pub fn read_table(path: &Path) -> Result<Table, OutputError> {
    let corrupt = |reason: &str| OutputError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let mut reader = BufReader::new(File::open(path)?);
    let mut header = [0u8; FILE_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    if header[0..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let name = read_fixed_ascii(&header[8..8 + NAME_LEN]);
    let mut word = [0u8; 4];
    word.copy_from_slice(&header[8 + NAME_LEN..12 + NAME_LEN]);
    let ncols = u32::from_le_bytes(word) as usize;
    let mut count = [0u8; 8];
    count.copy_from_slice(&header[ROW_COUNT_OFFSET as usize..FILE_HEADER_SIZE]);
    let nrows = u64::from_le_bytes(count);

    let mut columns = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        let mut desc = [0u8; NAME_LEN + 1];
        reader.read_exact(&mut desc)?;
        let kind = ColumnType::from_code(desc[NAME_LEN]).ok_or_else(|| corrupt("bad column type"))?;
        columns.push(Column::new(read_fixed_ascii(&desc[..NAME_LEN]), kind));
    }

    let mut rows = Vec::new();
    for _ in 0..nrows {
        let mut row = Vec::with_capacity(ncols);
        for col in &columns {
            row.push(read_cell(&mut reader, col.kind)?);
        }
        rows.push(row);
    }
    Ok(Table {
        name,
        columns,
        rows,
    })
}

fn read_cell(reader: &mut impl Read, kind: ColumnType) -> Result<Cell, OutputError> {
    let mut w4 = [0u8; 4];
    let mut w8 = [0u8; 8];
    Ok(match kind {
        ColumnType::F32 => {
            reader.read_exact(&mut w4)?;
            Cell::F32(f32::from_le_bytes(w4))
        }
        ColumnType::Bool => {
            let mut b = [0u8; 1];
            reader.read_exact(&mut b)?;
            Cell::Bool(b[0] != 0)
        }
        ColumnType::I32 => {
            reader.read_exact(&mut w4)?;
            Cell::I32(i32::from_le_bytes(w4))
        }
        ColumnType::VecF32 => {
            reader.read_exact(&mut w4)?;
            let n = u32::from_le_bytes(w4) as usize;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                reader.read_exact(&mut w4)?;
                items.push(f32::from_le_bytes(w4));
            }
            Cell::VecF32(items)
        }
        ColumnType::VecI64 => {
            reader.read_exact(&mut w4)?;
            let n = u32::from_le_bytes(w4) as usize;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                reader.read_exact(&mut w8)?;
                items.push(i64::from_le_bytes(w8));
            }
            Cell::VecI64(items)
        }
    })
}

pub fn table_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{TABLE_EXTENSION}"))
}

/// Table name of a per-sub-population output, e.g. `QvectorFT0Cs`.
pub fn sub_population_table(sub: SubPopulation) -> String {
    format!("Qvector{}s", sub.name())
}

fn sub_population_columns(sub: SubPopulation, vector: bool) -> Vec<Column> {
    let n = sub.name();
    let suffix = if vector { "_vec" } else { "" };
    let q_kind = if vector { ColumnType::VecF32 } else { ColumnType::F32 };
    let mut cols = vec![
        Column::new("isCalibrated", ColumnType::Bool),
        Column::new(format!("qvec{n}Re{suffix}"), q_kind),
        Column::new(format!("qvec{n}Im{suffix}"), q_kind),
    ];
    if sub.is_track() {
        cols.push(Column::new(format!("nTrk{n}"), ColumnType::I32));
        cols.push(Column::new(format!("labels{n}"), ColumnType::VecI64));
    } else {
        cols.push(Column::new(format!("sumAmpl{n}"), ColumnType::F32));
    }
    cols
}

/// Re and Im of every sub-population at every stage, sub-population major.
fn flatten_stages(block: &HarmonicQVectors) -> (Vec<f32>, Vec<f32>) {
    let mut re = Vec::with_capacity(SubPopulation::COUNT * Stage::COUNT);
    let mut im = Vec::with_capacity(SubPopulation::COUNT * Stage::COUNT);
    for (_, staged) in block.vectors.iter() {
        for stage in Stage::ALL {
            let q = staged.stage(stage);
            re.push(q.re as f32);
            im.push(q.im as f32);
        }
    }
    (re, im)
}

fn weights(block: &HarmonicQVectors) -> Vec<f32> {
    block.vectors.iter().map(|(_, s)| s.weight as f32).collect()
}

fn track_count(event: &EventOutput, sub: SubPopulation) -> i32 {
    event.weight(sub).round() as i32
}

fn track_ids(event: &EventOutput, sub: SubPopulation) -> Vec<i64> {
    match sub {
        SubPopulation::BPos => event.positive_ids.clone(),
        SubPopulation::BNeg => event.negative_ids.clone(),
        _ => Vec::new(),
    }
}

struct SubPopulationTables {
    sub: SubPopulation,
    single: TableWriter,
    vector: TableWriter,
}

/// The full output set: `Qvectors`, `Qvectors_vec` and the per-sub-population
/// tables for every enabled sub-population.
pub struct OutputTables {
    qvectors: TableWriter,
    qvectors_vec: TableWriter,
    per_sub: Vec<SubPopulationTables>,
}

impl OutputTables {
    pub fn create(dir: &Path, enabled: &SubPopulationSet) -> Result<Self, OutputError> {
        std::fs::create_dir_all(dir)?;
        let qvectors = TableWriter::create(
            &table_path(dir, "Qvectors"),
            "Qvectors",
            vec![
                Column::new("cent", ColumnType::F32),
                Column::new("isCalibrated", ColumnType::Bool),
                Column::new("qvecRe", ColumnType::VecF32),
                Column::new("qvecIm", ColumnType::VecF32),
                Column::new("qvecAmp", ColumnType::VecF32),
            ],
        )?;
        let qvectors_vec = TableWriter::create(
            &table_path(dir, "Qvectors_vec"),
            "Qvectors_vec",
            vec![
                Column::new("cent", ColumnType::F32),
                Column::new("isCalibrated", ColumnType::Bool),
                Column::new("qvecRe_vec", ColumnType::VecF32),
                Column::new("qvecIm_vec", ColumnType::VecF32),
                Column::new("qvecAmp", ColumnType::VecF32),
            ],
        )?;
        let mut per_sub = Vec::new();
        for sub in enabled.iter() {
            let name = sub_population_table(sub);
            let vec_name = format!("{name}_vec");
            per_sub.push(SubPopulationTables {
                sub,
                single: TableWriter::create(
                    &table_path(dir, &name),
                    &name,
                    sub_population_columns(sub, false),
                )?,
                vector: TableWriter::create(
                    &table_path(dir, &vec_name),
                    &vec_name,
                    sub_population_columns(sub, true),
                )?,
            });
        }
        Ok(Self {
            qvectors,
            qvectors_vec,
            per_sub,
        })
    }

    pub fn write_event(&mut self, event: &EventOutput) -> Result<(), OutputError> {
        let calibrated = event.is_calibrated();
        let all_calibrated = event.all_harmonics_calibrated();

        let (re, im) = flatten_stages(&event.reference);
        self.qvectors.write_row(&[
            Cell::F32(event.centrality),
            Cell::Bool(calibrated),
            Cell::VecF32(re),
            Cell::VecF32(im),
            Cell::VecF32(weights(&event.reference)),
        ])?;

        let mut re_vec = Vec::new();
        let mut im_vec = Vec::new();
        let mut amp_vec = Vec::new();
        for block in &event.harmonics {
            let (re, im) = flatten_stages(block);
            re_vec.extend(re);
            im_vec.extend(im);
            amp_vec.extend(weights(block));
        }
        self.qvectors_vec.write_row(&[
            Cell::F32(event.centrality),
            Cell::Bool(all_calibrated),
            Cell::VecF32(re_vec),
            Cell::VecF32(im_vec),
            Cell::VecF32(amp_vec),
        ])?;

        for tables in &mut self.per_sub {
            let sub = tables.sub;
            let q = event.reference.vectors[sub].final_value();
            let per_harmonic: Vec<_> = event
                .harmonics
                .iter()
                .map(|h| h.vectors[sub].final_value())
                .collect();
            let mut single = vec![
                Cell::Bool(calibrated),
                Cell::F32(q.re as f32),
                Cell::F32(q.im as f32),
            ];
            let mut vector = vec![
                Cell::Bool(all_calibrated),
                Cell::VecF32(per_harmonic.iter().map(|q| q.re as f32).collect()),
                Cell::VecF32(per_harmonic.iter().map(|q| q.im as f32).collect()),
            ];
            let tail = if sub.is_track() {
                vec![
                    Cell::I32(track_count(event, sub)),
                    Cell::VecI64(track_ids(event, sub)),
                ]
            } else {
                vec![Cell::F32(event.weight(sub) as f32)]
            };
            single.extend(tail.iter().cloned());
            vector.extend(tail);
            tables.single.write_row(&single)?;
            tables.vector.write_row(&vector)?;
        }
        Ok(())
    }

    pub fn finalize(self) -> Result<Vec<PathBuf>, OutputError> {
        let mut paths = vec![self.qvectors.finalize()?, self.qvectors_vec.finalize()?];
        for tables in self.per_sub {
            paths.push(tables.single.finalize()?);
            paths.push(tables.vector.finalize()?);
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::StagedQVector;
    use crate::qvec::{PerSubPopulation, QStatus, QVector, RawQVector};

    fn block(harmonic: u32, re: f64) -> HarmonicQVectors {
        HarmonicQVectors {
            harmonic,
            calibrated: true,
            vectors: PerSubPopulation::from_fn(|sub| {
                StagedQVector::uncalibrated(&RawQVector {
                    q: QVector::new(re + sub.index() as f64, -re),
                    weight: if sub.is_track() { 3.0 } else { 120.5 },
                    status: QStatus::Computed,
                })
            }),
        }
    }

    fn sample_event() -> EventOutput {
        EventOutput {
            run: 1,
            centrality: 12.5,
            centrality_in_range: true,
            harmonics: vec![block(2, 0.25), block(3, 0.5)],
            reference: block(2, 0.25),
            positive_ids: vec![4, 8, 15],
            negative_ids: vec![16, 23, 42],
        }
    }

    #[test]
    fn writer_patches_row_count_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.qvtb");
        let mut w = TableWriter::create(
            &path,
            "Demo",
            vec![Column::new("a", ColumnType::F32), Column::new("ids", ColumnType::VecI64)],
        )
        .unwrap();
        w.write_row(&[Cell::F32(1.5), Cell::VecI64(vec![1, -2])]).unwrap();
        w.write_row(&[Cell::F32(2.5), Cell::VecI64(vec![])]).unwrap();
        assert!(w.write_row(&[Cell::Bool(true), Cell::VecI64(vec![])]).is_err());
        assert!(w.write_row(&[Cell::F32(0.0)]).is_err());
        w.finalize().unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.name, "Demo");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][1], Cell::VecI64(vec![1, -2]));
    }

    #[test]
    fn long_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let name = "x".repeat(40);
        assert!(TableWriter::create(&dir.path().join("t"), &name, vec![]).is_err());
    }

    #[test]
    fn only_enabled_sub_population_tables_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let enabled = SubPopulationSet::none()
            .with(SubPopulation::Fv0A)
            .with(SubPopulation::BPos);
        let mut out = OutputTables::create(dir.path(), &enabled).unwrap();
        out.write_event(&sample_event()).unwrap();
        let paths = out.finalize().unwrap();
        assert_eq!(paths.len(), 6);
        assert!(table_path(dir.path(), "QvectorFV0As").exists());
        assert!(table_path(dir.path(), "QvectorBPoss_vec").exists());
        assert!(!table_path(dir.path(), "QvectorFT0Cs").exists());
    }

    #[test]
    fn event_rows_follow_sub_population_and_stage_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = OutputTables::create(dir.path(), &SubPopulationSet::all()).unwrap();
        out.write_event(&sample_event()).unwrap();
        out.finalize().unwrap();

        let qv = read_table(&table_path(dir.path(), "Qvectors")).unwrap();
        let Cell::VecF32(re) = &qv.rows[0][2] else { panic!("qvecRe") };
        assert_eq!(re.len(), 24);
        // FV0A is the fourth sub-population, four stages each
        assert_eq!(re[12], 3.25);
        let Cell::VecF32(amp) = &qv.rows[0][4] else { panic!("qvecAmp") };
        assert_eq!(amp, &vec![120.5, 120.5, 120.5, 120.5, 3.0, 3.0]);

        let qv_vec = read_table(&table_path(dir.path(), "Qvectors_vec")).unwrap();
        let Cell::VecF32(re_vec) = &qv_vec.rows[0][2] else { panic!("qvecRe_vec") };
        assert_eq!(re_vec.len(), 48);
        assert_eq!(re_vec[24], 0.5);

        let bneg = read_table(&table_path(dir.path(), "QvectorBNegs_vec")).unwrap();
        assert_eq!(bneg.column_index("labelsBNeg"), Some(4));
        assert_eq!(bneg.rows[0][1], Cell::VecF32(vec![5.25, 5.5]));
        assert_eq!(bneg.rows[0][3], Cell::I32(3));
        assert_eq!(bneg.rows[0][4], Cell::VecI64(vec![16, 23, 42]));

        let ft0c = read_table(&table_path(dir.path(), "QvectorFT0Cs")).unwrap();
        assert_eq!(ft0c.rows[0], vec![
            Cell::Bool(true),
            Cell::F32(0.25),
            Cell::F32(-0.25),
            Cell::F32(120.5),
        ]);
    }
}
