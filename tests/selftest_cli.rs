// CLASSIFICATION: COMMUNITY
// Filename: selftest_cli.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

use std::process::{Command, Output};

fn selftest(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_clcanary_selftest"))
        .args(args)
        .env_remove("CLCANARY_LOG_LOCATION")
        .env_remove("CLCANARY_EXIT_ON_OVERFLOW")
        .env_remove("CLCANARY_DEVICE_SELECT")
        .output()
        .unwrap()
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn clean_runs_find_nothing() {
    for scenario in ["buffer", "svm", "image"] {
        let out = selftest(&["--scenario", scenario]);
        assert!(out.status.success(), "{}", scenario);
        assert!(stdout(&out).contains("overflows: 0"), "{}", scenario);
    }
}

#[test]
fn injected_overflow_is_counted() {
    for strategy in ["single", "bulk", "bulk-pointer"] {
        for scenario in ["buffer", "svm", "image"] {
            let out = selftest(&["--scenario", scenario, "--strategy", strategy, "--force-gpu", "--inject-overflow"]);
            assert!(out.status.success());
            assert!(stdout(&out).contains("overflows: 1"), "{} {}", scenario, strategy);
        }
    }
    let out = selftest(&["--device", "cpu", "--inject-overflow"]);
    assert!(stdout(&out).contains("overflows: 1"));
}

#[test]
fn kill_policy_exits_with_configured_code() {
    let out = selftest(&["--inject-overflow", "--exit-on-overflow", "--exit-code", "7"]);
    assert_eq!(out.status.code(), Some(7));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Exiting application because of buffer overflow."));
    assert!(!stdout(&out).contains("overflows:"));

    let out = selftest(&["--device", "cpu", "--inject-overflow", "--exit-on-overflow", "--exit-code", "9"]);
    assert_eq!(out.status.code(), Some(9));
}
