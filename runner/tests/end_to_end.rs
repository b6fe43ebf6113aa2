use hetsites_runner::{
    config::{BackendKind, RunConfig},
    coordinator::{Coordinator, LOG_DIR, SPLIT_DIR},
    intervals::IntervalSet,
    ledger::LEDGER_FILE,
};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

const MATRIX: &str = "FID IID PAT MAT SEX PHENOTYPE rs78601809:15211:T:G_G rs2:20000:A:C_C rs3_T\n\
                      fam1 ind1 0 0 1 -9 1 0 0\n\
                      fam2 ind2 0 0 2 -9 1 1 1\n\
                      fam3 ind3 0 0 1 -9 2 NA 1\n\
                      fam4 ind4 0 0 2 -9 0 0 0\n";

const HAPS: &str = "1 rs78601809:15211:T:G 15211 T G 0 1\n\
                    1 rs2:20000:A:C 20000 A C 1 0\n\
                    chr2 rs3:500:T:A 500 T A 0 1\n";

const EXONS: &str = "chr1\t15000\t16000\tGENE1\nchr2\t400\t600\tGENE2\n";

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hetsites"))
}

struct Cohort {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Cohort {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("cohort.raw"), MATRIX).unwrap();
        fs::write(root.join("snps.haps"), HAPS).unwrap();
        fs::write(root.join("exons.bed"), EXONS).unwrap();

        Self { _dir: dir, root }
    }

    fn config(&self, jobs: usize, output: &str) -> RunConfig {
        let mut config = RunConfig::new(self.root.join("cohort.raw"));
        config.intervals.snps = Some(self.root.join("snps.haps"));
        config.intervals.exons = Some(self.root.join("exons.bed"));
        config.output_dir = self.root.join(output);
        config.work_dir = Some(self.root.join(format!("{output}_work")));
        config.executable = Some(binary());
        config.cluster.backend = BackendKind::Local;
        config.cluster.jobs = jobs;
        config.cluster.poll_interval_secs = 0;
        config.cluster.submit_delay_ms = 0;
        config.cluster.timeout_secs = Some(60);

        config
    }

    fn outputs(&self, output: &str) -> Vec<(String, String)> {
        let mut files: Vec<(String, String)> = fs::read_dir(self.root.join(output))
            .unwrap()
            .map(|entry| {
                let path = entry.unwrap().path();
                (
                    path.file_name().unwrap().to_string_lossy().into_owned(),
                    fs::read_to_string(&path).unwrap(),
                )
            })
            .collect();
        files.sort();

        files
    }
}

fn remaining(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    names
}

#[test]
pub fn two_partitions_on_the_local_backend() {
    let cohort = Cohort::new();

    let report = Coordinator::load(cohort.config(2, "out")).run().unwrap();

    assert_eq!(report.individuals_processed, 4);
    assert!(report.not_found.is_empty());

    let outputs = cohort.outputs("out");
    assert_eq!(
        outputs,
        vec![
            (
                "ind1_snps.bed".to_owned(),
                "1\t15210\t15211\trs78601809\tT|G\n".to_owned()
            ),
            (
                "ind2_snps.bed".to_owned(),
                "1\t15210\t15211\trs78601809\tT|G\n2\t499\t500\trs3\tT|A\n".to_owned()
            ),
            ("ind3_snps.bed".to_owned(), "2\t499\t500\trs3\tT|A\n".to_owned()),
            ("ind4_snps.bed".to_owned(), String::new()),
        ]
    );

    // only the derived intervals and the worker logs outlive the run
    let work = cohort.root.join("out_work");
    assert_eq!(remaining(&work), vec!["exonic_snps.bed", LOG_DIR]);
    assert!(!work.join(SPLIT_DIR).exists());
    assert!(!work.join(LEDGER_FILE).exists());
    assert_eq!(IntervalSet::read(&work.join("exonic_snps.bed")).unwrap().len(), 2);
}

#[test]
pub fn distributed_and_local_runs_agree() {
    let cohort = Cohort::new();

    let local = Coordinator::load(cohort.config(1, "local")).run().unwrap();
    let distributed = Coordinator::load(cohort.config(3, "distributed"))
        .run()
        .unwrap();

    assert_eq!(local, distributed);
    assert_eq!(cohort.outputs("local"), cohort.outputs("distributed"));
}

#[test]
pub fn rerunning_gives_identical_outputs() {
    let cohort = Cohort::new();

    Coordinator::load(cohort.config(2, "out")).run().unwrap();
    let first = cohort.outputs("out");
    let report = Coordinator::load(cohort.config(2, "out")).run().unwrap();

    assert_eq!(report.individuals_processed, 4);
    assert_eq!(cohort.outputs("out"), first);
}

#[test]
pub fn cli_runs_and_reports() {
    let cohort = Cohort::new();
    let root = &cohort.root;

    let output = Command::new(binary())
        .arg("run")
        .arg("--genotype")
        .arg(root.join("cohort.raw"))
        .arg("--snps")
        .arg(root.join("snps.haps"))
        .arg("--exons")
        .arg(root.join("exons.bed"))
        .arg("--output-dir")
        .arg(root.join("out"))
        .args(["--jobs", "2", "--poll-interval", "0", "--keep", "ind1,ind4,ind9"])
        .output()
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Processed 2 individuals (1 requested but not found)"),
        "{stdout}"
    );
    assert_eq!(
        remaining(&root.join("out")),
        vec!["exonic_snps.bed", "ind1_snps.bed", "ind4_snps.bed", LOG_DIR]
    );
}

#[test]
pub fn cli_accepts_relative_paths_when_distributed() {
    let cohort = Cohort::new();
    let root = &cohort.root;

    let output = Command::new(binary())
        .current_dir(root)
        .args(["run", "-g", "cohort.raw", "--snps", "snps.haps", "--exons", "exons.bed"])
        .args(["-o", "out", "--work-dir", "scratch"])
        .args(["--jobs", "2", "--poll-interval", "0", "--timeout", "60"])
        .output()
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Processed 4 individuals"), "{stdout}");

    let reference = Cohort::new();
    Coordinator::load(reference.config(1, "out")).run().unwrap();
    assert_eq!(cohort.outputs("out"), reference.outputs("out"));
    assert!(root.join("scratch").join(LOG_DIR).is_dir());
}

#[test]
pub fn cli_configuration_errors_exit_with_two() {
    let cohort = Cohort::new();
    let root = &cohort.root;

    let missing_input = Command::new(binary())
        .arg("run")
        .arg("--genotype")
        .arg(root.join("absent.raw"))
        .arg("--exonic-snps")
        .arg(root.join("absent.bed"))
        .output()
        .unwrap();
    assert_eq!(missing_input.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&missing_input.stderr).contains("Usage"));

    let bad_walltime = Command::new(binary())
        .arg("run")
        .arg("--genotype")
        .arg(root.join("cohort.raw"))
        .args(["--walltime", "1h"])
        .output()
        .unwrap();
    assert_eq!(bad_walltime.status.code(), Some(2));

    let split_without_separator = Command::new(binary())
        .arg("run")
        .arg("--genotype")
        .arg(root.join("cohort.raw"))
        .arg("--exonic-snps")
        .arg(root.join("exons.bed"))
        .args(["--keep", "ind1", "--split-index", "1"])
        .output()
        .unwrap();
    assert_eq!(split_without_separator.status.code(), Some(2));
}

#[test]
pub fn cli_worker_processes_one_partition() {
    let cohort = Cohort::new();
    let root = &cohort.root;
    let exonic = root.join("exonic.bed");
    fs::write(&exonic, "1\t15210\t15211\trs78601809\tT|G\n").unwrap();
    fs::write(
        root.join("worker.yaml"),
        format!(
            "partition: {}
intervals: {}
output_dir: {}
marker: {}
gzip: false
overwrite: true
filter:
  keep: null
  exclude: []
  split: null
threads: 1
log_filter: debug
",
            root.join("cohort.raw").display(),
            exonic.display(),
            root.join("out").display(),
            root.join("cohort_done").display(),
        ),
    )
    .unwrap();

    let status = Command::new(binary())
        .arg("worker")
        .arg(root.join("worker.yaml"))
        .status()
        .unwrap();

    assert!(status.success());
    assert!(fs::read_to_string(root.join("cohort_done"))
        .unwrap()
        .contains("individuals: 4"));
    assert_eq!(remaining(&root.join("out")).len(), 4);
}
