//! CLI integration tests using assert_cmd.
//!
//! These tests invoke the actual `pico` binary and verify its output.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[allow(deprecated)]
fn pico_cmd(basedir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pico").expect("binary should exist");
    cmd.arg("--basedir")
        .arg(basedir)
        .env_remove("PICO_CONFIG_DIR")
        .env_remove("RUST_LOG")
        .env("HOME", basedir)
        .env("XDG_CONFIG_HOME", basedir.join(".config"));
    cmd
}

/// Job configuration of a first analysis submission of DYJets in three chunks.
fn write_jobconfig(basedir: &Path) {
    let sampledir = basedir.join("output/2018/mutau/DYJets");
    std::fs::create_dir_all(sampledir.join("config")).expect("mkdir");
    let jobcfg = serde_json::json!({
        "time": "2020-05-01 12:00:00.000000",
        "group": "DY",
        "name": "DYJets",
        "paths": ["/DYJetsToLL_M-50_TuneCP5_13TeV-madgraphMLM-pythia8/RunIIAutumn18NanoAODv6-Nano25Oct2019_102X/NANOAODSIM"],
        "nevents": 0,
        "dtype": "mc",
        "channel": "mutau",
        "module": "ModuleMuTauSimple",
        "extraopts": [],
        "jobname": "DYJets_mutau",
        "jobtag": "_mutau_try1",
        "tag": "",
        "postfix": "_mutau",
        "try": 1,
        "jobids": [123],
        "outdir": "output/2018/mutau/DYJets",
        "jobdir": "output/2018/mutau/DYJets",
        "cfgdir": "output/2018/mutau/DYJets/config",
        "logdir": "output/2018/mutau/DYJets/log",
        "cfgname": "output/2018/mutau/DYJets/config/jobconfig_mutau_try1.json",
        "joblist": "output/2018/mutau/DYJets/config/jobarglist_mutau_try1.txt",
        "nfiles": 3,
        "files": ["a.root", "b.root", "c.root"],
        "nfilesperjob": 1,
        "nchunks": 3,
        "chunks": [0, 1, 2],
        "chunkdict": {"0": ["a.root"], "1": ["b.root"], "2": ["c.root"]},
    });
    std::fs::write(
        sampledir.join("config/jobconfig_mutau_try1.json"),
        serde_json::to_string_pretty(&jobcfg).expect("json"),
    )
    .expect("write");
}

#[test]
fn test_version_flag() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_help_flag() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("PicoProducer"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("get"))
        .stdout(predicate::str::contains("set"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("resubmit"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("hadd"));
}

#[test]
fn test_submit_help_shows_options() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .args(["submit", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--era"))
        .stdout(predicate::str::contains("--channel"))
        .stdout(predicate::str::contains("--filesperjob"))
        .stdout(predicate::str::contains("--getjobs"))
        .stdout(predicate::str::contains("--batch-opts"))
        .stdout(predicate::str::contains("--split"));
}

#[test]
fn test_no_subcommand_shows_help() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_set_and_get_variable() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .args(["set", "nfilesperjob", "3"])
        .assert()
        .success();
    assert!(tmp.path().join("config/config.json").exists());

    pico_cmd(tmp.path())
        .args(["get", "nfilesperjob"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configured nfilesperjob = 3"));
}

#[test]
fn test_channel_link_is_listed() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .args(["channel", "etau", "ModuleETau"])
        .assert()
        .success();

    pico_cmd(tmp.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("etau"))
        .stdout(predicate::str::contains("ModuleETau"));

    pico_cmd(tmp.path())
        .args(["rm", "channel", "etau"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed channel 'etau'"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .arg("--config")
        .arg(tmp.path().join("missing.json"))
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_unknown_channel_fails() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .args(["submit", "-y", "2018", "-c", "tautau"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Channel 'tautau' is not configured"));
}

#[test]
fn test_submit_requires_era() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .args(["submit", "-c", "mutau"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Please specify at least one era"));
}

#[test]
fn test_status_without_jobs() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .args(["status", "-y", "2018", "-c", "mutau"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Did not find any samples"));
}

#[test]
fn test_status_reports_missing_chunks() {
    let tmp = TempDir::new().expect("tmp");
    write_jobconfig(tmp.path());
    pico_cmd(tmp.path())
        .args(["status", "-y", "2018", "-c", "mutau", "--getjobs", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DYJets"))
        .stdout(predicate::str::contains("MISS"))
        .stdout(predicate::str::contains("0, 1, 2"));
}

#[test]
fn test_hadd_refuses_incomplete_sample() {
    let tmp = TempDir::new().expect("tmp");
    write_jobconfig(tmp.path());
    pico_cmd(tmp.path())
        .args(["hadd", "-y", "2018", "-c", "mutau", "--getjobs", "0"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Cannot hadd job output because 3 chunks need to be resubmitted"));
}

#[test]
fn test_hadd_skim_not_available() {
    let tmp = TempDir::new().expect("tmp");
    pico_cmd(tmp.path())
        .args(["hadd", "-y", "2018", "-c", "skim"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Hadding into one file not available for skimming"));
}
