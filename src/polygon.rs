//! Point-in-polygon partitioning of survey files.
//!
//! Polygons are read from a CSV with a `WKT` column. Survey rows are placed
//! into the polygon that contains their `(Longitude, Latitude)` and written
//! to one file per polygon per input file. When a whole folder is processed,
//! a merge pass then concatenates each polygon's files into a single file.
//!
//! A point on a polygon boundary is not contained. A point inside several
//! overlapping polygons goes to the first of them in polygon file order.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use geo::{BoundingRect, Contains, Coord, MultiPolygon, Point, Rect};
use heck::ToSnakeCase;
use log::{debug, info, warn};
use rstar::{AABB, RTree, RTreeObject};

use crate::{
    chunked::RunOptions,
    columns::{ColumnResolver, canonical, find_case_insensitive},
    config::Config,
    error::{SurveyError, ValidationKind, display_name},
    frame::{BooleanColumns, Chunk, ChunkReader, Table},
    io_utils::{self, decode_record},
    output::PendingOutput,
    progress::{CancellationToken, ProgressSink, percent},
    wkt,
};

const MERGED_DIR: &str = "merged";
const NAME_SEPARATOR: &str = "__";

#[derive(Debug, Clone)]
pub struct PolygonRegion {
    pub id: String,
    pub name: String,
    pub geometry: MultiPolygon<f64>,
    pub bounds: Option<Rect<f64>>,
}

impl PolygonRegion {
    pub fn new(id: String, name: String, geometry: MultiPolygon<f64>) -> Self {
        let bounds = geometry.bounding_rect();
        PolygonRegion {
            id,
            name,
            geometry,
            bounds,
        }
    }

    fn bounds_contain(&self, point: Coord<f64>) -> bool {
        self.bounds.is_some_and(|rect| {
            let (min, max) = (rect.min(), rect.max());
            min.x <= point.x && point.x <= max.x && min.y <= point.y && point.y <= max.y
        })
    }

    pub fn contains(&self, point: Coord<f64>) -> bool {
        self.bounds_contain(point) && self.geometry.contains(&Point::from(point))
    }

    /// `<id>__<name>`, safe for use in a file name.
    pub fn file_key(&self) -> String {
        format!("{}{NAME_SEPARATOR}{}", sanitize_id(&self.id), slug(&self.name))
    }
}

fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "polygon".to_string()
    } else {
        cleaned
    }
}

fn slug(name: &str) -> String {
    let snake = name.to_snake_case();
    let mut collapsed = String::with_capacity(snake.len());
    for c in snake.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            collapsed.push(c);
        }
    }
    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Reads polygons from `path`.
///
/// The leading `validate_rows` rows (every row with `full_validate`) must
/// hold valid WKT; later invalid rows are skipped with a warning. Missing
/// ids and names are generated from the row position.
pub fn load_polygons(
    path: &Path,
    config: &Config,
    encoding: &'static Encoding,
) -> Result<Vec<PolygonRegion>> {
    let table = Table::read(path, encoding)?;
    let headers = table.headers();
    let resolver = ColumnResolver::new(&config.columns);
    let map = resolver.resolve(headers);
    let wkt_column = find_case_insensitive(headers, canonical::WKT)
        .or_else(|| map.index_in(headers, canonical::WKT))
        .ok_or_else(|| SurveyError::missing_columns(path, &[canonical::WKT.to_string()]))?;
    let id_column = map.index_in(headers, canonical::POLYGON_ID);
    let name_column = map.index_in(headers, canonical::POLYGON_NAME);
    if table.is_empty() {
        return Err(SurveyError::validation(
            ValidationKind::EmptyInput,
            format!("'{}' contains no polygons", display_name(path)),
        )
        .into());
    }

    let settings = &config.polygons;
    let mut polygons = Vec::with_capacity(table.len());
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut skipped = 0usize;
    for (row_idx, row) in table.rows().iter().enumerate() {
        let geometry = match wkt::parse_polygonal(&row[wkt_column]) {
            Ok(geometry) => geometry,
            Err(err) if settings.full_validate || row_idx < settings.validate_rows => {
                return Err(SurveyError::validation(
                    ValidationKind::InvalidWkt,
                    format!("'{}' row {}: {err}", display_name(path), row_idx + 1),
                )
                .into());
            }
            Err(err) => {
                warn!("Skipping polygon row {}: {err}", row_idx + 1);
                skipped += 1;
                continue;
            }
        };
        let mut id = id_column
            .map(|idx| row[idx].trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| (row_idx + 1).to_string());
        if !seen_ids.insert(id.clone()) {
            let unique = (2..)
                .map(|n| format!("{id}-{n}"))
                .find(|candidate| !seen_ids.contains(candidate))
                .unwrap_or_else(|| format!("{id}-{row_idx}"));
            warn!("Duplicate polygon id '{id}' renamed to '{unique}'");
            seen_ids.insert(unique.clone());
            id = unique;
        }
        let name = name_column
            .map(|idx| row[idx].trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("Polygon {}", row_idx + 1));
        polygons.push(PolygonRegion::new(id, name, geometry));
    }
    if skipped > 0 {
        warn!("Skipped {skipped} polygon row(s) with invalid WKT");
    }
    info!(
        "Loaded {} polygon(s) from '{}'",
        polygons.len(),
        display_name(path)
    );
    Ok(polygons)
}

/// Finds the polygon containing a point.
pub trait PointLocator {
    fn locate(&self, point: Coord<f64>) -> Option<usize>;
    fn describe(&self) -> &'static str;
}

struct PolygonEnvelope {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for PolygonEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

pub struct RTreeLocator<'a> {
    polygons: &'a [PolygonRegion],
    tree: RTree<PolygonEnvelope>,
}

impl<'a> RTreeLocator<'a> {
    /// Fails when a polygon has non-finite bounds.
    pub fn new(polygons: &'a [PolygonRegion]) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(polygons.len());
        for (index, polygon) in polygons.iter().enumerate() {
            let Some(rect) = polygon.bounds else {
                continue;
            };
            let (min, max) = (rect.min(), rect.max());
            if ![min.x, min.y, max.x, max.y].iter().all(|v| v.is_finite()) {
                return Err(format!("polygon '{}' has non-finite bounds", polygon.id));
            }
            entries.push(PolygonEnvelope {
                index,
                envelope: AABB::from_corners([min.x, min.y], [max.x, max.y]),
            });
        }
        Ok(RTreeLocator {
            polygons,
            tree: RTree::bulk_load(entries),
        })
    }
}

impl PointLocator for RTreeLocator<'_> {
    fn locate(&self, point: Coord<f64>) -> Option<usize> {
        let query = AABB::from_point([point.x, point.y]);
        let mut candidates: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|entry| entry.index)
            .collect();
        candidates.sort_unstable();
        candidates
            .into_iter()
            .find(|&idx| self.polygons[idx].contains(point))
    }

    fn describe(&self) -> &'static str {
        "r-tree"
    }
}

/// Bounding-box prefilter then exact containment, polygon by polygon.
pub struct BruteForceLocator<'a> {
    polygons: &'a [PolygonRegion],
}

impl<'a> BruteForceLocator<'a> {
    pub fn new(polygons: &'a [PolygonRegion]) -> Self {
        BruteForceLocator { polygons }
    }
}

impl PointLocator for BruteForceLocator<'_> {
    fn locate(&self, point: Coord<f64>) -> Option<usize> {
        self.polygons.iter().position(|polygon| polygon.contains(point))
    }

    fn describe(&self) -> &'static str {
        "brute force"
    }
}

/// R-tree locator, or the brute-force one when the tree cannot be built.
pub fn build_locator(polygons: &[PolygonRegion]) -> Box<dyn PointLocator + '_> {
    match RTreeLocator::new(polygons) {
        Ok(locator) => Box::new(locator),
        Err(reason) => {
            warn!("Spatial index unavailable ({reason}); using brute-force containment");
            Box::new(BruteForceLocator::new(polygons))
        }
    }
}

/// Parses a longitude/latitude pair.
pub fn parse_point(lon: &str, lat: &str) -> Option<Coord<f64>> {
    let x = lon.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    let y = lat.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(Coord { x, y })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// Point positions per polygon, in input order.
    pub by_polygon: Vec<Vec<usize>>,
    pub unmatched: usize,
    pub invalid: usize,
}

/// Groups points by containing polygon. `None` points are counted as
/// invalid; points outside every polygon are counted and dropped.
pub fn assign(points: &[Option<Coord<f64>>], polygons: usize, locator: &dyn PointLocator) -> Assignment {
    let mut assignment = Assignment {
        by_polygon: vec![Vec::new(); polygons],
        ..Assignment::default()
    };
    for (idx, point) in points.iter().enumerate() {
        match point {
            None => assignment.invalid += 1,
            Some(point) => match locator.locate(*point) {
                Some(polygon) => assignment.by_polygon[polygon].push(idx),
                None => assignment.unmatched += 1,
            },
        }
    }
    assignment
}

/// `<stem>__<id>__<name>.csv`
pub fn partition_file_name(stem: &str, polygon: &PolygonRegion) -> String {
    format!("{stem}{NAME_SEPARATOR}{}.csv", polygon.file_key())
}

/// Recovers `(id, name)` from a per-polygon file name.
pub fn parse_partition_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_name.strip_suffix(".csv")?;
    let mut parts = stem.rsplitn(3, NAME_SEPARATOR);
    let name = parts.next()?;
    let id = parts.next()?;
    let source = parts.next()?;
    if name.is_empty() || id.is_empty() || source.is_empty() {
        return None;
    }
    Some((id.to_string(), name.to_string()))
}

struct PartitionWriter {
    pending: PendingOutput,
    writer: csv::Writer<BufWriter<File>>,
    rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub input: PathBuf,
    pub rows: usize,
    pub invalid: usize,
    pub unmatched: usize,
    pub per_polygon: Vec<usize>,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PolygonSummary {
    pub locator: &'static str,
    pub polygons: Vec<(String, String)>,
    pub files: Vec<FileReport>,
    pub merged: Vec<PathBuf>,
    pub elapsed: std::time::Duration,
}

impl PolygonSummary {
    pub fn rows(&self) -> Vec<(String, String)> {
        let total = |f: fn(&FileReport) -> usize| self.files.iter().map(f).sum::<usize>();
        let mut rows = vec![
            ("operation".to_string(), "polygon".to_string()),
            ("locator".to_string(), self.locator.to_string()),
            ("input files".to_string(), self.files.len().to_string()),
            ("input rows".to_string(), total(|f| f.rows).to_string()),
            ("invalid coordinates".to_string(), total(|f| f.invalid).to_string()),
            ("outside all polygons".to_string(), total(|f| f.unmatched).to_string()),
        ];
        for (idx, (id, name)) in self.polygons.iter().enumerate() {
            let count: usize = self
                .files
                .iter()
                .map(|f| f.per_polygon.get(idx).copied().unwrap_or(0))
                .sum();
            rows.push((format!("{id} {name}"), count.to_string()));
        }
        rows.push(("output files".to_string(), total(|f| f.outputs.len()).to_string()));
        if !self.merged.is_empty() {
            rows.push(("merged files".to_string(), self.merged.len().to_string()));
        }
        rows.push((
            "elapsed".to_string(),
            format!("{:.2}s", self.elapsed.as_secs_f64()),
        ));
        rows
    }
}

pub struct PolygonPartitioner<'a> {
    config: &'a Config,
    polygons: &'a [PolygonRegion],
    locator: Box<dyn PointLocator + 'a>,
    progress: &'a dyn ProgressSink,
    cancel: CancellationToken,
}

impl<'a> PolygonPartitioner<'a> {
    pub fn new(
        config: &'a Config,
        polygons: &'a [PolygonRegion],
        progress: &'a dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        PolygonPartitioner {
            config,
            polygons,
            locator: build_locator(polygons),
            progress,
            cancel,
        }
    }

    pub fn locator(&self) -> &dyn PointLocator {
        self.locator.as_ref()
    }

    /// Splits one survey file into per-polygon files inside `output_dir`.
    pub fn partition_file(
        &self,
        input: &Path,
        output_dir: &Path,
        options: &RunOptions,
    ) -> Result<FileReport> {
        let encoding = io_utils::sniff_encoding(input, options.encoding)?;
        let total = io_utils::count_records(
            input,
            encoding,
            &self.cancel,
            self.config.processing.cancel_check_rows,
        )?;
        let chunk_size = options
            .chunk_size
            .unwrap_or(self.config.processing.chunk_size);
        let mut reader = ChunkReader::open(input, encoding, chunk_size)?;
        let headers = reader.headers().to_vec();
        let resolver = ColumnResolver::new(&self.config.columns);
        resolver
            .validate_required(&headers, &[canonical::LONGITUDE, canonical::LATITUDE])
            .into_result(input)?;
        let map = resolver.resolve(&headers);
        let (Some(lon), Some(lat)) = (
            map.index_in(&headers, canonical::LONGITUDE),
            map.index_in(&headers, canonical::LATITUDE),
        ) else {
            return Err(SurveyError::missing_columns(
                input,
                &[canonical::LONGITUDE.to_string(), canonical::LATITUDE.to_string()],
            )
            .into());
        };
        let written_headers = if options.standardize_headers {
            resolver.standardize(&headers)
        } else {
            headers.clone()
        };
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());

        let mut report = FileReport {
            input: input.to_path_buf(),
            per_polygon: vec![0; self.polygons.len()],
            ..FileReport::default()
        };
        let mut writers: HashMap<usize, PartitionWriter> = HashMap::new();
        let mut booleans = BooleanColumns::new();
        let outcome = (|| -> Result<()> {
            while let Some(chunk) = reader.next() {
                self.cancel.check()?;
                let mut table = match chunk? {
                    Chunk::Rows { table, .. } => table,
                    Chunk::Malformed {
                        first_row,
                        rows,
                        error,
                    } => {
                        warn!(
                            "Skipping chunk of {rows} row(s) starting at row {} of '{}': {error}",
                            first_row + 1,
                            display_name(input)
                        );
                        continue;
                    }
                };
                report.rows += table.len();
                booleans.render(&mut table);
                let points: Vec<Option<Coord<f64>>> = table
                    .rows()
                    .iter()
                    .map(|row| parse_point(&row[lon], &row[lat]))
                    .collect();
                let assignment = assign(&points, self.polygons.len(), self.locator.as_ref());
                report.invalid += assignment.invalid;
                report.unmatched += assignment.unmatched;
                for (polygon, rows) in assignment.by_polygon.iter().enumerate() {
                    if rows.is_empty() {
                        continue;
                    }
                    let slot = match writers.entry(polygon) {
                        std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
                        std::collections::hash_map::Entry::Vacant(slot) => {
                            let target = output_dir
                                .join(partition_file_name(&stem, &self.polygons[polygon]));
                            let pending =
                                PendingOutput::begin(&target, &self.config.output, options.backups)?;
                            let mut writer = pending.csv_writer()?;
                            writer
                                .write_record(&written_headers)
                                .context("Writing partition header")?;
                            slot.insert(PartitionWriter {
                                pending,
                                writer,
                                rows: 0,
                            })
                        }
                    };
                    for &row in rows {
                        slot.writer
                            .write_record(&table.rows()[row])
                            .context("Writing partition row")?;
                    }
                    slot.rows += rows.len();
                    report.per_polygon[polygon] += rows.len();
                }
                self.progress.report(
                    &format!("Partitioning '{}'", display_name(input)),
                    percent(reader.rows_read(), total),
                );
            }
            Ok(())
        })();

        let mut ordered: Vec<(usize, PartitionWriter)> = writers.into_iter().collect();
        ordered.sort_by_key(|(polygon, _)| *polygon);
        match outcome {
            Ok(()) => {
                for (_, mut slot) in ordered {
                    slot.writer.flush().context("Flushing partition")?;
                    drop(slot.writer);
                    debug!("{} row(s) for '{}'", slot.rows, display_name(slot.pending.target()));
                    report.outputs.push(slot.pending.commit()?.path);
                }
                if report.invalid > 0 {
                    warn!(
                        "{} row(s) of '{}' had unusable coordinates",
                        report.invalid,
                        display_name(input)
                    );
                }
                Ok(report)
            }
            Err(err) => {
                if err
                    .downcast_ref::<SurveyError>()
                    .is_some_and(SurveyError::is_cancelled)
                {
                    for (_, mut slot) in ordered {
                        let _ = slot.writer.flush();
                        drop(slot.writer);
                        slot.pending.keep_partial()?;
                    }
                }
                Err(err)
            }
        }
    }
}

/// Concatenates per-polygon files with the same `(id, name)` into
/// `merged_dir/<id>__<name>.csv`. Columns follow the first file's header;
/// columns missing from a later file are left empty and extra ones dropped.
pub fn merge_partitions(
    files: &[PathBuf],
    merged_dir: &Path,
    config: &Config,
    options: &RunOptions,
) -> Result<Vec<PathBuf>> {
    let mut groups: BTreeMap<(String, String), Vec<&PathBuf>> = BTreeMap::new();
    for file in files {
        let Some(key) = file
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_partition_name)
        else {
            warn!("Ignoring unrecognised partition file '{}'", display_name(file));
            continue;
        };
        groups.entry(key).or_default().push(file);
    }

    let mut merged = Vec::with_capacity(groups.len());
    for ((id, name), sources) in groups {
        let target = merged_dir.join(format!("{id}{NAME_SEPARATOR}{name}.csv"));
        let pending = PendingOutput::begin(&target, &config.output, options.backups)?;
        let mut writer = pending.csv_writer()?;
        let mut target_headers: Option<Vec<String>> = None;
        let mut rows = 0usize;
        for source in sources {
            let mut reader = io_utils::open_csv_reader_from_path(source, encoding_rs::UTF_8)?;
            let headers = io_utils::reader_headers(&mut reader, source)?;
            let layout: Vec<Option<usize>> = match &target_headers {
                None => {
                    writer
                        .write_record(&headers)
                        .context("Writing merged header")?;
                    let layout = (0..headers.len()).map(Some).collect();
                    target_headers = Some(headers);
                    layout
                }
                Some(target) => {
                    let extra = headers.iter().filter(|h| !target.contains(h)).count();
                    if extra > 0 {
                        warn!(
                            "Dropping {extra} column(s) of '{}' not present in the first file",
                            display_name(source)
                        );
                    }
                    target
                        .iter()
                        .map(|name| headers.iter().position(|h| h == name))
                        .collect()
                }
            };
            for record in reader.byte_records() {
                let record = record
                    .with_context(|| format!("Reading partition '{}'", display_name(source)))?;
                let values = decode_record(&record);
                let aligned: Vec<&str> = layout
                    .iter()
                    .map(|idx| idx.and_then(|i| values.get(i)).map_or("", String::as_str))
                    .collect();
                writer.write_record(&aligned).context("Writing merged row")?;
                rows += 1;
            }
        }
        writer.flush().context("Flushing merged output")?;
        drop(writer);
        let committed = pending.commit()?;
        info!(
            "Merged {rows} row(s) into '{}'",
            display_name(&committed.path)
        );
        merged.push(committed.path);
    }
    Ok(merged)
}

/// CSV files directly inside `dir`, sorted by name.
pub fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Listing {dir:?}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Partitions a file, or every CSV in a folder followed by the merge pass.
pub fn run_polygon(
    config: &Config,
    polygons_path: &Path,
    input: &Path,
    output_dir: &Path,
    options: &RunOptions,
    progress: &dyn ProgressSink,
    cancel: CancellationToken,
) -> Result<PolygonSummary> {
    let started = Instant::now();
    let encoding = io_utils::sniff_encoding(polygons_path, options.encoding)?;
    let polygons = load_polygons(polygons_path, config, encoding)?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Creating output directory {output_dir:?}"))?;

    let (inputs, batch) = if input.is_dir() {
        let files = list_csv_files(input)?;
        if files.is_empty() {
            return Err(SurveyError::validation(
                ValidationKind::EmptyInput,
                format!("'{}' contains no CSV files", display_name(input)),
            )
            .into());
        }
        (files, true)
    } else {
        (vec![input.to_path_buf()], false)
    };

    let partitioner = PolygonPartitioner::new(config, &polygons, progress, cancel.clone());
    let locator = partitioner.locator().describe();
    info!("Assigning points with the {locator} locator");
    let mut files = Vec::with_capacity(inputs.len());
    for (idx, path) in inputs.iter().enumerate() {
        cancel.check()?;
        progress.report(
            &format!("File {}/{}: '{}'", idx + 1, inputs.len(), display_name(path)),
            percent(idx, inputs.len()),
        );
        files.push(partitioner.partition_file(path, output_dir, options)?);
    }

    let merged = if batch {
        progress.report("Merging per-polygon files", None);
        let produced: Vec<PathBuf> = files.iter().flat_map(|f| f.outputs.iter().cloned()).collect();
        merge_partitions(&produced, &output_dir.join(MERGED_DIR), config, options)?
    } else {
        Vec::new()
    };

    Ok(PolygonSummary {
        locator,
        polygons: polygons
            .iter()
            .map(|p| (p.id.clone(), p.name.clone()))
            .collect(),
        files,
        merged,
        elapsed: started.elapsed(),
    })
}
