use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::summary::ResultRow;

const RAW_COLUMNS: [&str; 12] = [
    "sim",
    "N",
    "seed",
    "strata",
    "drug",
    "effect",
    "treatment_mean",
    "treatment",
    "treatment_var",
    "control_mean",
    "control",
    "control_var",
];

/// Concatenated rows of every replicate in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    estimators: Vec<String>,
    rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Creates a table whose estimate columns follow `estimators`.
    #[must_use]
    pub const fn new(estimators: Vec<String>, rows: Vec<ResultRow>) -> Self {
        Self { estimators, rows }
    }

    /// Estimator labels in column order.
    #[must_use]
    pub fn estimators(&self) -> &[String] {
        &self.estimators
    }

    /// All rows, ordered by replicate.
    #[must_use]
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Column names.
    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut columns: Vec<String> = RAW_COLUMNS.iter().map(ToString::to_string).collect();
        for label in &self.estimators {
            for suffix in ["mean", "super", "sd"] {
                columns.push(format!("{label}_{suffix}"));
            }
        }
        columns
    }

    /// Conventional file name for a batch.
    #[must_use]
    pub fn file_name(n: usize, sims: usize) -> String {
        format!("fixed_N_{n}_sims_{sims}.csv")
    }

    /// Writes the table as CSV; missing values become empty fields.
    pub fn write_csv(&self, writer: &mut impl Write) -> io::Result<()> {
        writeln!(writer, "{}", self.header().join(","))?;
        for row in &self.rows {
            let mut fields = vec![
                row.sim.to_string(),
                row.n.to_string(),
                row.seed.to_string(),
                row.stratum.to_string(),
                row.drug.to_string(),
                number(row.effect),
                optional(row.treatment.mean),
                row.treatment.n.to_string(),
                optional(row.treatment.var),
                optional(row.control.mean),
                row.control.n.to_string(),
                optional(row.control.var),
            ];
            for estimate in &row.estimates {
                fields.push(number(estimate.mean));
                fields.push(number(estimate.superiority));
                fields.push(number(estimate.sd));
            }
            writeln!(writer, "{}", fields.join(","))?;
        }
        Ok(())
    }

    /// Writes `<dir>/fixed_N_<n>_sims_<sims>.csv`, creating `dir` first.
    pub fn write_to_dir(&self, dir: &Path, n: usize, sims: usize) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(n, sims));
        let mut writer = BufWriter::new(File::create(&path)?);
        self.write_csv(&mut writer)?;
        writer.flush()?;
        Ok(path)
    }
}

fn number(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

fn optional(value: Option<f64>) -> String {
    value.map_or_else(String::new, number)
}
