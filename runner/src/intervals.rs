use crate::io::{open_reader, OutputWriter};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fmt,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum IntervalError {
    #[error("Failed to access interval file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path:?}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// A genomic region with 0-based, half-open coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub name: Option<String>,
    pub alleles: Option<String>,
}

impl Interval {
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.chrom == other.chrom && self.start < other.end && other.start < self.end
    }

    /// parse a BED record, only the first five columns are kept
    pub fn from_bed_line(line: &str) -> Result<Self, String> {
        let mut fields = line.split_whitespace();
        let chrom = fields.next().ok_or("missing chromosome")?;
        let start = parse_coordinate(fields.next(), "start")?;
        let end = parse_coordinate(fields.next(), "end")?;

        if end < start {
            return Err(format!("end {end} lies before start {start}"));
        }

        Ok(Self {
            chrom: normalize_chrom(chrom).to_owned(),
            start,
            end,
            name: fields.next().map(str::to_owned),
            alleles: fields.next().map(str::to_owned),
        })
    }

    /// convert a haplotype line (`chrom id pos ref alt haplotypes...`) into a single base interval
    ///
    /// The position is 1-based, the identifier is cut at the first `:` and the allele pair is
    /// joined with `|`.
    pub fn from_haps_line(line: &str) -> Result<Self, String> {
        let fields = line.split_whitespace().take(5).collect_vec();

        if fields.len() < 5 {
            return Err(format!("expected at least 5 columns, found {}", fields.len()));
        }

        let position = parse_coordinate(Some(fields[2]), "position")?;
        if position == 0 {
            return Err("positions are 1-based, found 0".to_owned());
        }

        Ok(Self {
            chrom: normalize_chrom(fields[0]).to_owned(),
            start: position - 1,
            end: position,
            name: fields[1].split(':').next().map(str::to_owned),
            alleles: Some(format!("{}|{}", fields[3], fields[4])),
        })
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.chrom, self.start, self.end)?;

        if let Some(name) = &self.name {
            write!(f, "\t{name}")?;

            if let Some(alleles) = &self.alleles {
                write!(f, "\t{alleles}")?;
            }
        }

        Ok(())
    }
}

fn parse_coordinate(field: Option<&str>, what: &str) -> Result<u64, String> {
    let field = field.ok_or_else(|| format!("missing {what}"))?;

    field
        .parse()
        .map_err(|_| format!("{what} '{field}' is not a non-negative integer"))
}

/// strip a leading `chr` so `chr1` and `1` refer to the same sequence
pub fn normalize_chrom(chrom: &str) -> &str {
    ["chr", "Chr", "CHR"]
        .iter()
        .find_map(|prefix| chrom.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(chrom)
}

fn is_header(line: &str) -> bool {
    line.is_empty()
        || line.starts_with('#')
        || line.starts_with("track")
        || line.starts_with("browser")
}

/// Ordered collection of intervals, shared read-only between workers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    pub fn new(intervals: Vec<Interval>) -> Self {
        Self { intervals }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.intervals
    }

    /// read a (optionally gzipped) BED file
    #[instrument(level = "debug")]
    pub fn read(path: &Path) -> Result<Self, IntervalError> {
        Self::parse_with(path, Interval::from_bed_line)
    }

    /// read a haplotype file, one single base interval per variant
    #[instrument(level = "debug")]
    pub fn from_haps(path: &Path) -> Result<Self, IntervalError> {
        Self::parse_with(path, Interval::from_haps_line)
    }

    fn parse_with(
        path: &Path,
        parse: fn(&str) -> Result<Interval, String>,
    ) -> Result<Self, IntervalError> {
        let io_error = |source| IntervalError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut intervals = Vec::new();

        for (number, line) in open_reader(path).map_err(io_error)?.lines().enumerate() {
            let line = line.map_err(io_error)?;
            let line = line.trim_end();

            if is_header(line) {
                continue;
            }

            intervals.push(parse(line).map_err(|reason| IntervalError::Malformed {
                path: path.to_path_buf(),
                line: number + 1,
                reason,
            })?);
        }

        debug!(path = ?path, count = intervals.len(), "Parsed intervals");

        Ok(Self { intervals })
    }

    /// keep the intervals of `self` overlapping any interval of `other`, in the order of `self`
    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        // merged, sorted (start, end) runs per chromosome
        let mut index: BTreeMap<&str, Vec<(u64, u64)>> = BTreeMap::new();
        for interval in other.iter() {
            index
                .entry(interval.chrom.as_str())
                .or_default()
                .push((interval.start, interval.end));
        }
        for runs in index.values_mut() {
            runs.sort_unstable();
            *runs = std::mem::take(runs)
                .into_iter()
                .coalesce(|previous, current| {
                    if current.0 <= previous.1 {
                        Ok((previous.0, previous.1.max(current.1)))
                    } else {
                        Err((previous, current))
                    }
                })
                .collect();
        }

        let intervals = self
            .iter()
            .filter(|interval| {
                index.get(interval.chrom.as_str()).map_or(false, |runs| {
                    let candidate = runs.partition_point(|&(_, end)| end <= interval.start);
                    runs.get(candidate)
                        .map_or(false, |&(start, _)| start < interval.end)
                })
            })
            .cloned()
            .collect();

        IntervalSet { intervals }
    }

    /// write as BED, creating or truncating `path`
    pub fn write(&self, path: &Path, gzip: bool) -> io::Result<()> {
        write_intervals(self.iter(), path, gzip)
    }
}

/// write any sequence of intervals as BED, creating or truncating `path`
pub fn write_intervals<'a, I: Iterator<Item = &'a Interval>>(
    intervals: I,
    path: &Path,
    gzip: bool,
) -> io::Result<()> {
    let mut writer = OutputWriter::create(path, gzip)?;

    for interval in intervals {
        writeln!(writer, "{interval}")?;
    }

    writer.finish()
}

/// intersect a haplotype SNP file with an exon BED and persist the result to `output`
#[instrument(level = "info")]
pub fn derive_exonic_snps(
    snps: &Path,
    exons: &Path,
    output: &Path,
) -> Result<IntervalSet, IntervalError> {
    let snps = IntervalSet::from_haps(snps)?;
    let exons = IntervalSet::read(exons)?;
    let exonic = snps.intersect(&exons);

    info!(
        snps = snps.len(),
        exons = exons.len(),
        exonic = exonic.len(),
        "Derived exonic SNP intervals"
    );

    exonic
        .write(output, false)
        .map_err(|source| IntervalError::Io {
            path: output.to_path_buf(),
            source,
        })?;

    Ok(exonic)
}
