use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use tempfile::{TempDir, tempdir};

use survey_merge::{
    chunked::{ChunkedFileProcessor, RunOptions},
    config::Config,
    interval::{AsofIndex, ContainmentIndex, ContainmentProbe, Interval, Segment, SegmentFilters},
    lane_fix::LaneFixJoin,
    progress::{CancellationToken, SilentProgress},
    strategy::ProcessingStrategy,
};

const SURVEY_ROWS: usize = 200_000;

fn asof_fixture(windows: usize) -> (AsofIndex<i64, usize>, Vec<Option<i64>>) {
    let intervals = (0..windows)
        .map(|idx| {
            let start = idx as i64 * 600;
            Interval::new(start, start + 300, idx)
        })
        .collect();
    let keys = (0..SURVEY_ROWS)
        .map(|row| {
            if row % 97 == 0 {
                None
            } else {
                Some((row as i64 * 37) % (windows as i64 * 600))
            }
        })
        .collect();
    (AsofIndex::new(intervals), keys)
}

fn containment_fixture(roads: usize) -> (ContainmentIndex<usize>, Vec<(String, Option<f64>)>) {
    let mut segments = Vec::new();
    for road in 0..roads {
        for step in 0..20 {
            let start = step as f64 * 500.0;
            segments.push(Segment {
                road: format!("{road:04}"),
                start,
                end: start + 250.0,
                filters: SegmentFilters::default(),
                payload: segments.len(),
            });
        }
    }
    let probes = (0..SURVEY_ROWS)
        .map(|row| {
            let road = (row % roads).to_string();
            let chainage = (row % 9_973) as f64;
            (road, Some(chainage))
        })
        .collect();
    (ContainmentIndex::new(segments), probes)
}

fn generate_lane_fix_inputs(rows: usize) -> (TempDir, PathBuf, PathBuf) {
    let dir = tempdir().expect("temp dir");
    let survey = dir.path().join("survey.csv");
    let fixes = dir.path().join("fixes.csv");

    let mut writer = BufWriter::new(File::create(&survey).expect("create survey"));
    writeln!(writer, "TestDateUTC,RoadID,Chainage,Lane,Ignore").expect("header");
    for row in 0..rows {
        let seconds = row % 86_400;
        writeln!(
            writer,
            "2024-05-02 {:02}:{:02}:{:02},{:04},{},L{},false",
            seconds / 3_600,
            (seconds / 60) % 60,
            seconds % 60,
            row % 500,
            row * 10,
            row % 3 + 1
        )
        .expect("row");
    }
    writer.flush().expect("flush survey");

    let mut writer = BufWriter::new(File::create(&fixes).expect("create fixes"));
    writeln!(writer, "From,To,Lane,Ignore,Plate").expect("header");
    for minute in (0..24 * 60).step_by(15) {
        writeln!(
            writer,
            "2024-05-02 {:02}:{:02}:00,2024-05-02 {:02}:{:02}:59,R{},False,BENCH",
            minute / 60,
            minute % 60,
            minute / 60,
            minute % 60 + 5,
            minute % 4 + 1
        )
        .expect("fix");
    }
    writer.flush().expect("flush fixes");

    (dir, survey, fixes)
}

fn bench_index_joins(c: &mut Criterion) {
    let (asof, keys) = asof_fixture(5_000);
    let (containment, raw_probes) = containment_fixture(400);
    let probes: Vec<ContainmentProbe<'_>> = raw_probes
        .iter()
        .map(|(road, chainage)| ContainmentProbe {
            road: road.as_str(),
            chainage: *chainage,
            ..ContainmentProbe::default()
        })
        .collect();

    let mut group = c.benchmark_group("interval_join");

    group.bench_function("asof_200k_keys", |b| {
        b.iter(|| asof.join(&keys));
    });

    group.bench_function("containment_200k_probes", |b| {
        b.iter(|| containment.join(&probes));
    });

    group.finish();
}

fn bench_lane_fix_strategies(c: &mut Criterion) {
    let (temp_dir, survey, fixes) = generate_lane_fix_inputs(50_000);
    let config = Config::default();
    let processor = ChunkedFileProcessor::new(&config, &SilentProgress, CancellationToken::new());

    let mut group = c.benchmark_group("lane_fix_run");
    group.sample_size(10);

    for (name, strategy) in [
        ("in_memory", ProcessingStrategy::InMemory),
        ("hybrid", ProcessingStrategy::Hybrid),
        ("streaming", ProcessingStrategy::StreamingIndexed),
    ] {
        let output = temp_dir.path().join(format!("{name}.csv"));
        let options = RunOptions {
            strategy: Some(strategy),
            chunk_size: Some(10_000),
            backups: false,
            ..RunOptions::new()
        };
        group.bench_function(name, |b| {
            b.iter_batched(
                || LaneFixJoin::new(&config).expect("lane-fix join"),
                |mut join| {
                    processor
                        .run_join("lane-fix", &mut join, &survey, &fixes, &output, &options)
                        .expect("lane-fix run");
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
    drop(temp_dir);
}

criterion_group!(benches, bench_index_joins, bench_lane_fix_strategies);
criterion_main!(benches);
