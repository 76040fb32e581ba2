//! End-to-end runs on the local guest.
//!
//! Each test builds a throwaway metadata tree, drives `run::run` and checks
//! results, exit codes and what is left in the workdir.

use std::fs;

use tmt::core::result::Outcome;
use tmt::core::step_name::{StepName, StepStatus};
use tmt::exit_codes;
use tmt::io::output::Printer;
use tmt::run::{RUN_FILE, RunManifest, run};
use tmt::steps::StepState;
use tmt::steps::execute::{RESULTS_FILE, load_results};
use tmt::test_support::{Sandbox, local_plan};

fn status(sandbox: &Sandbox, id: u32, plan: &str, step: StepName) -> StepStatus {
    let path = sandbox.step_dir(id, plan, step).join("step.yaml");
    let text = fs::read_to_string(&path).expect("read step state");
    let state: StepState = serde_yaml::from_str(&text).expect("parse step state");
    state.status
}

#[test]
fn smoke_plan_passes_and_leaves_a_test_log() {
    let sandbox = Sandbox::new();
    sandbox.write("plan.fmf", &local_plan("true"));

    let outcome = run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect("run");

    assert_eq!(outcome.exit_code, exit_codes::OK);
    assert_eq!(outcome.workdir, sandbox.workdirs().join("run-001"));
    assert_eq!(outcome.summary.count(Outcome::Pass), 1);
    let execute = sandbox.step_dir(1, "/plan", StepName::Execute);
    let results = load_results(&execute.join(RESULTS_FILE)).expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "/t1");
    assert_eq!(results[0].result, Outcome::Pass);
    assert!(execute.join("data/t1/out.log").is_file());

    let manifest: RunManifest =
        serde_yaml::from_str(&fs::read_to_string(outcome.workdir.join(RUN_FILE)).expect("manifest"))
            .expect("parse manifest");
    assert_eq!(manifest.plans, ["/plan"]);
    assert_eq!(manifest.steps, StepName::ALL.to_vec());
}

#[test]
fn failing_test_exits_with_failure() {
    let sandbox = Sandbox::new();
    sandbox.write("plan.fmf", &local_plan("false"));

    let outcome = run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect("run");

    assert_eq!(outcome.exit_code, exit_codes::FAILED);
    assert_eq!(outcome.summary.count(Outcome::Fail), 1);
    assert!(outcome.errors.is_empty());
}

#[test]
fn finished_run_resumes_as_no_op() {
    let sandbox = Sandbox::new();
    let marker = sandbox.path().join("count");
    sandbox.write(
        "plan.fmf",
        &local_plan(&format!("echo run >> {}", marker.display())),
    );

    let first = run(&sandbox.options_for(1), &sandbox.config(), Printer::silent()).expect("first");
    assert_eq!(first.exit_code, exit_codes::OK);
    let second = run(&sandbox.options_for(1), &sandbox.config(), Printer::silent()).expect("second");

    assert_eq!(second.exit_code, exit_codes::OK);
    assert_eq!(second.summary, first.summary);
    assert_eq!(fs::read_to_string(&marker).expect("marker").lines().count(), 1);
    for step in StepName::ALL {
        assert_eq!(status(&sandbox, 1, "/plan", step), StepStatus::Done, "{step}");
    }
}

#[test]
fn force_reruns_every_step_with_equal_results() {
    let sandbox = Sandbox::new();
    let marker = sandbox.path().join("count");
    sandbox.write(
        "plan.fmf",
        &local_plan(&format!("echo run >> {}", marker.display())),
    );

    let first = run(&sandbox.options_for(1), &sandbox.config(), Printer::silent()).expect("first");
    let mut forced = sandbox.options_for(1);
    forced.force = true;
    let second = run(&forced, &sandbox.config(), Printer::silent()).expect("forced");

    assert_eq!(second.summary, first.summary);
    assert_eq!(fs::read_to_string(&marker).expect("marker").lines().count(), 2);
}

#[test]
fn interrupted_execute_starts_over_while_done_steps_are_kept() {
    let sandbox = Sandbox::new();
    sandbox.write("plan.fmf", &local_plan("true"));
    let mut partial = sandbox.options_for(1);
    partial.until = Some(StepName::Provision);
    run(&partial, &sandbox.config(), Printer::silent()).expect("partial");

    // A leftover `todo` state marks execute as interrupted.
    let execute = sandbox.step_dir(1, "/plan", StepName::Execute);
    fs::create_dir_all(execute.join("data/stale")).expect("stale data");
    fs::write(execute.join("step.yaml"), "status: todo\ndata: []\n").expect("todo state");
    let discovered = fs::metadata(sandbox.step_dir(1, "/plan", StepName::Discover).join("tests.yaml"))
        .and_then(|meta| meta.modified())
        .expect("tests.yaml");

    let mut resumed = sandbox.options_for(1);
    resumed.all = true;
    let outcome = run(&resumed, &sandbox.config(), Printer::silent()).expect("resumed");

    assert_eq!(outcome.exit_code, exit_codes::OK);
    assert!(!execute.join("data/stale").exists());
    assert_eq!(status(&sandbox, 1, "/plan", StepName::Execute), StepStatus::Done);
    let after = fs::metadata(sandbox.step_dir(1, "/plan", StepName::Discover).join("tests.yaml"))
        .and_then(|meta| meta.modified())
        .expect("tests.yaml");
    assert_eq!(discovered, after);
}

#[test]
fn prepare_phases_run_by_order_then_position() {
    let sandbox = Sandbox::new();
    let trace = sandbox.path().join("trace");
    let plan = format!(
        "{}prepare:\n  - name: late\n    how: shell\n    order: 50\n    script: echo a >> {trace}\n\
         \x20 - name: early\n    how: shell\n    order: 40\n    script: echo b >> {trace}\n\
         \x20 - name: default\n    how: shell\n    script: echo c >> {trace}\n",
        local_plan("true"),
        trace = trace.display()
    );
    sandbox.write("plan.fmf", &plan);

    let outcome = run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect("run");

    assert_eq!(outcome.exit_code, exit_codes::OK);
    assert_eq!(fs::read_to_string(&trace).expect("trace"), "b\na\nc\n");
}

#[test]
fn xfail_turns_a_failure_into_a_pass() {
    let sandbox = Sandbox::new();
    sandbox.write(
        "plan.fmf",
        "discover:\n  how: shell\n  tests:\n    - name: /t1\n      test: exit 1\n      result: xfail\n\
         provision:\n  how: local\nexecute:\n  how: tmt\n",
    );

    let outcome = run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect("run");

    assert_eq!(outcome.exit_code, exit_codes::OK);
    let results = load_results(&sandbox.step_dir(1, "/plan", StepName::Execute).join(RESULTS_FILE))
        .expect("results");
    assert_eq!(results[0].result, Outcome::Pass);
    assert_eq!(results[0].note.as_deref(), Some("original result: fail"));
}

#[test]
fn plan_environment_wins_over_test_environment() {
    let sandbox = Sandbox::new();
    let seen = sandbox.path().join("seen");
    sandbox.write(
        "plan.fmf",
        &format!(
            "environment:\n  COLOR: plan\n\
             discover:\n  how: shell\n  tests:\n    - name: /t1\n      test: echo $COLOR-$SHAPE > {}\n\
             \x20     environment: {{COLOR: test, SHAPE: round}}\n\
             provision:\n  how: local\nexecute:\n  how: tmt\n",
            seen.display()
        ),
    );

    run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect("run");

    assert_eq!(fs::read_to_string(&seen).expect("seen").trim(), "plan-round");
}

#[test]
fn command_line_environment_wins_over_plan() {
    let sandbox = Sandbox::new();
    let seen = sandbox.path().join("seen");
    sandbox.write(
        "plan.fmf",
        &format!(
            "environment:\n  COLOR: plan\n{}",
            local_plan(&format!("echo $COLOR > {}", seen.display()))
        ),
    );
    let mut options = sandbox.options();
    options.environment.insert("COLOR".to_string(), "cli".to_string());

    run(&options, &sandbox.config(), Printer::silent()).expect("run");

    assert_eq!(fs::read_to_string(&seen).expect("seen").trim(), "cli");
}

#[test]
fn slow_test_times_out_as_failure() {
    let sandbox = Sandbox::new();
    sandbox.write(
        "plan.fmf",
        "discover:\n  how: shell\n  tests:\n    - name: /slow\n      test: sleep 30\n      duration: 1s\n\
         provision:\n  how: local\nexecute:\n  how: tmt\n",
    );

    let started = std::time::Instant::now();
    let outcome = run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect("run");

    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    assert_eq!(outcome.exit_code, exit_codes::FAILED);
    let results = load_results(&sandbox.step_dir(1, "/plan", StepName::Execute).join(RESULTS_FILE))
        .expect("results");
    assert_eq!(results[0].result, Outcome::Fail);
    assert_eq!(results[0].note.as_deref(), Some("timeout"));
}

#[test]
fn failing_prepare_is_an_error_and_finish_still_runs() {
    let sandbox = Sandbox::new();
    let cleaned = sandbox.path().join("cleaned");
    sandbox.write(
        "plan.fmf",
        &format!(
            "{}prepare:\n  how: shell\n  script: exit 4\nfinish:\n  how: shell\n  script: touch {}\n",
            local_plan("true"),
            cleaned.display()
        ),
    );

    let outcome = run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect("run");

    assert_eq!(outcome.exit_code, exit_codes::ERROR);
    assert_eq!(outcome.errors.len(), 1);
    assert!(cleaned.is_file());
    assert_eq!(status(&sandbox, 1, "/plan", StepName::Prepare), StepStatus::Todo);
    assert_eq!(status(&sandbox, 1, "/plan", StepName::Finish), StepStatus::Todo);
}

#[test]
fn tree_without_plans_is_a_specification_error() {
    let sandbox = Sandbox::new();
    sandbox.write("tests.fmf", "test: 'true'\n");

    let err = run(&sandbox.options(), &sandbox.config(), Printer::silent()).expect_err("no plans");

    assert_eq!(tmt::error::kind_of(&err), tmt::error::ErrorKind::Specification);
}

#[test]
fn each_plan_gets_its_own_workdir_and_remove_cleans_up() {
    let sandbox = Sandbox::new();
    sandbox.write("plans/one.fmf", &local_plan("true"));
    sandbox.write("plans/two.fmf", &local_plan("true"));
    let mut options = sandbox.options();
    options.plan_names = vec!["two".to_string()];

    let outcome = run(&options, &sandbox.config(), Printer::silent()).expect("run");
    assert_eq!(outcome.summary.total(), 1);
    assert!(outcome.workdir.join("plans/two/execute").is_dir());
    assert!(!outcome.workdir.join("plans/one").exists());

    let mut removing = sandbox.options();
    removing.remove = true;
    let removed = run(&removing, &sandbox.config(), Printer::silent()).expect("run");
    assert_eq!(removed.summary.total(), 2);
    assert!(!removed.workdir.exists());
}
