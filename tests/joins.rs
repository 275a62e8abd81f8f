mod common;

use std::fs;

use survey_merge::{
    chunked::{ChunkedFileProcessor, RunOptions},
    config::Config,
    containment::{ContainmentJoin, ContainmentKind},
    error::SurveyError,
    lane_fix::LaneFixJoin,
    progress::{CancellationToken, SilentProgress},
    strategy::ProcessingStrategy,
};

use common::{FIXES_HEADER, TestWorkspace, column, read_csv};

fn options(strategy: ProcessingStrategy, chunk_size: usize) -> RunOptions {
    RunOptions {
        strategy: Some(strategy),
        chunk_size: Some(chunk_size),
        ..RunOptions::new()
    }
}

/// One survey row per minute over a day; fixes cover every fifth hour.
fn day_of_survey(workspace: &TestWorkspace) -> (std::path::PathBuf, std::path::PathBuf) {
    let mut survey = String::from("TestDateUTC,RoadID,Chainage,Lane,Ignore\n");
    for minute in 0..(24 * 60) {
        survey.push_str(&format!(
            "2024-05-02 {:02}:{:02}:00,{:04},{},L{},false\n",
            minute / 60,
            minute % 60,
            minute % 7,
            minute * 10,
            minute % 3 + 1
        ));
    }
    let mut fixes = format!("{FIXES_HEADER}\n");
    for hour in (0..24).step_by(5) {
        fixes.push_str(&format!(
            "2024-05-02 {hour:02}:00:00,2024-05-02 {hour:02}:59:59,R{hour},True,XYZ\n"
        ));
    }
    fixes.push_str("2024-05-02 10:30:00,2024-05-02 10:40:00,-1,False,XYZ\n");
    (
        workspace.write("day.csv", &survey),
        workspace.write("fixes.csv", &fixes),
    )
}

#[test]
fn lane_fix_output_is_identical_across_strategies() {
    let workspace = TestWorkspace::new();
    let (survey, fixes) = day_of_survey(&workspace);
    let config = Config::default();
    let processor = ChunkedFileProcessor::new(&config, &SilentProgress, CancellationToken::new());

    let mut outputs = Vec::new();
    for (name, strategy) in [
        ("memory.csv", ProcessingStrategy::InMemory),
        ("hybrid.csv", ProcessingStrategy::Hybrid),
        ("stream.csv", ProcessingStrategy::StreamingIndexed),
    ] {
        let output = workspace.file(name);
        let mut join = LaneFixJoin::new(&config).expect("join");
        let summary = processor
            .run_join("lane-fix", &mut join, &survey, &fixes, &output, &options(strategy, 97))
            .expect("lane-fix run");
        assert_eq!(summary.input_rows, 24 * 60);
        assert_eq!(summary.output_rows, 24 * 60);
        assert_eq!(summary.reference_entries, Some(6));
        outputs.push(fs::read(&output).expect("read output"));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], outputs[2]);

    let (headers, rows) = read_csv(&workspace.file("stream.csv"));
    let lanes = column(&headers, &rows, "Lane");
    let ignore = column(&headers, &rows, "Ignore");
    // 00:00 is inside the first window, 01:00 is not.
    assert_eq!(lanes[0], "LR0");
    assert_eq!(ignore[0], "True");
    assert_eq!(lanes[60], "L1");
    assert_eq!(ignore[60], "False");
    // 10:35 falls in the sentinel window, which starts after 10:00.
    assert_eq!(lanes[635], "L3");
    assert_eq!(ignore[635], "False");
    // 10:45: the latest window start is the sentinel, already closed.
    assert_eq!(lanes[645], "L1");
    assert_eq!(ignore[645], "False");
    // 20:59 is inside the last window; a three-character fix replaces.
    assert_eq!(lanes[20 * 60 + 59], "R20");
    assert_eq!(ignore[20 * 60 + 59], "True");
    assert!(
        workspace.list(".").iter().all(|name| !name.ends_with(".lock")),
        "no lock files left behind"
    );
}

#[test]
fn feedback_join_copies_payload_in_row_order() {
    let workspace = TestWorkspace::new();
    let survey = workspace.write_csv(
        "survey.csv",
        "TestDateUTC,RoadID,Chainage,Lane,Wheelpath",
        &[
            "2024-01-01 00:00:00,007,1500,L1,Left",
            "2024-01-01 00:00:01,7,2500,L1,Right",
            "2024-01-01 00:00:02,7,1200,R1,Left",
            "2024-01-01 00:00:03,8,1200,L1,Left",
        ],
    );
    let feedback = workspace.write_csv(
        "feedback.csv",
        "RoadID,StartChainage,EndChainage,Wheelpath,Lanes,Comment",
        &[
            "7,1.0,2.0,Both,L1,rutting",
            "7,1.0,3.0,Left,All,cracking",
            "7,2.0,3.0,Right,L1,shoving",
        ],
    );
    let mut config = Config::default();
    config.containment.feedback.chainage_scale = 1000.0;
    config.containment.feedback.payload_columns = vec!["Comment".to_string()];
    let processor = ChunkedFileProcessor::new(&config, &SilentProgress, CancellationToken::new());
    let output = workspace.file("out.csv");
    let mut join = ContainmentJoin::new(&config, ContainmentKind::Feedback);
    let summary = processor
        .run_join(
            "feedback",
            &mut join,
            &survey,
            &feedback,
            &output,
            &options(ProcessingStrategy::Hybrid, 2),
        )
        .expect("feedback run");
    assert_eq!(summary.output_rows, 4);

    let (headers, rows) = read_csv(&output);
    assert_eq!(headers.last().map(String::as_str), Some("Comment"));
    assert_eq!(
        column(&headers, &rows, "Comment"),
        vec!["rutting", "shoving", "cracking", ""]
    );
    assert_eq!(column(&headers, &rows, "RoadID"), vec!["007", "7", "7", "8"]);
}

fn stat<'a>(stats: &'a [(String, String)], name: &str) -> Option<&'a str> {
    stats
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

#[test]
fn unparsable_trailing_chunk_leaves_rows_unmatched_in_every_strategy() {
    let workspace = TestWorkspace::new();
    let survey = workspace.write_csv(
        "survey.csv",
        "TestDateUTC,RoadID,Chainage,Lane,Ignore",
        &[
            "2024-05-02 10:05:00,0011,10,A5B,false",
            "2024-05-02 10:06:00,0011,20,L1,false",
            "2024-05-02 12:00:00,0011,30,L2,false",
            "garbage,0011,40,L3,false",
        ],
    );
    let fixes = workspace.write_csv(
        "fixes.csv",
        FIXES_HEADER,
        &[
            "2024-05-02 10:00:00,2024-05-02 10:30:00,12,True,XYZ",
            "2024-05-03 10:00:00,2024-05-03 10:30:00,R7,False,XYZ",
            "2024-05-03 11:00:00,2024-05-03 11:30:00,R8,False,XYZ",
            "soon,later,R9,False,XYZ",
        ],
    );
    let config = Config::default();
    let processor = ChunkedFileProcessor::new(&config, &SilentProgress, CancellationToken::new());

    let mut outputs = Vec::new();
    for (name, strategy) in [
        ("memory.csv", ProcessingStrategy::InMemory),
        ("hybrid.csv", ProcessingStrategy::Hybrid),
        ("stream.csv", ProcessingStrategy::StreamingIndexed),
    ] {
        let output = workspace.file(name);
        let mut join = LaneFixJoin::new(&config).expect("join");
        let summary = processor
            .run_join("lane-fix", &mut join, &survey, &fixes, &output, &options(strategy, 3))
            .expect("bad trailing chunk is not critical");
        assert_eq!(summary.output_rows, 4);
        assert_eq!(summary.reference_entries, Some(3));
        assert_eq!(stat(&summary.stats, "unparsed timestamps"), Some("1"));
        assert_eq!(stat(&summary.stats, "skipped fixes"), Some("1"));
        outputs.push(fs::read(&output).expect("read output"));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], outputs[2]);

    let (headers, rows) = read_csv(&workspace.file("hybrid.csv"));
    assert_eq!(column(&headers, &rows, "Lane"), vec!["A12B", "L12", "L2", "L3"]);
    assert_eq!(column(&headers, &rows, "Ignore"), vec!["True", "True", "False", "False"]);
}

#[test]
fn workbrief_output_renders_survey_boolean_columns() {
    let workspace = TestWorkspace::new();
    let survey = workspace.write_csv(
        "survey.csv",
        "RoadID,Chainage,Checked",
        &["1,5,true", "1,50,false", "1,60,"],
    );
    let workbrief = workspace.write_csv(
        "workbrief.csv",
        "RoadID,StartChainage,EndChainage,Treatment",
        &["1,0,10,Reseal"],
    );
    let config = Config::default();
    let processor = ChunkedFileProcessor::new(&config, &SilentProgress, CancellationToken::new());
    let output = workspace.file("out.csv");
    let mut join = ContainmentJoin::new(&config, ContainmentKind::Workbrief);
    processor
        .run_join(
            "workbrief",
            &mut join,
            &survey,
            &workbrief,
            &output,
            &options(ProcessingStrategy::Hybrid, 1),
        )
        .expect("workbrief run");

    let (headers, rows) = read_csv(&output);
    assert_eq!(column(&headers, &rows, "Checked"), vec!["True", "False", ""]);
    assert_eq!(column(&headers, &rows, "InWorkbrief"), vec!["True", "False", "False"]);
    assert_eq!(column(&headers, &rows, "Treatment"), vec!["Reseal", "", ""]);
}

#[test]
fn unparsable_survey_timestamps_are_critical() {
    let workspace = TestWorkspace::new();
    let survey = workspace.write_csv(
        "survey.csv",
        "TestDateUTC,Lane,Ignore",
        &["not a date,L1,false", "still not,L2,false"],
    );
    let fixes = workspace.write_csv(
        "fixes.csv",
        FIXES_HEADER,
        &["2024-01-01 00:00:00,2024-01-01 01:00:00,1,False,P"],
    );
    let config = Config::default();
    let processor = ChunkedFileProcessor::new(&config, &SilentProgress, CancellationToken::new());
    let output = workspace.file("out.csv");
    for strategy in [ProcessingStrategy::InMemory, ProcessingStrategy::Hybrid] {
        let mut join = LaneFixJoin::new(&config).expect("join");
        let err = processor
            .run_join(
                "lane-fix",
                &mut join,
                &survey,
                &fixes,
                &output,
                &options(strategy, 1),
            )
            .expect_err("critical parse failure");
        let typed = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<SurveyError>())
            .expect("typed error in chain");
        assert!(matches!(typed, SurveyError::CriticalParse { failed: 2, .. }));
        assert!(!output.exists());
        assert!(!workspace.file("out.csv.partial").exists());
        assert!(!workspace.file("out.csv.lock").exists());
    }
}
