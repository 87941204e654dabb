//! Quality gate rules engine.
//!
//! Evaluates a [`GateReport`] (generated test run, regression run, baseline)
//! against a list of [`GateRule`]s. No violations means the change is ready.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::runner::{TestOutcome, TestRun};

/// Regression tests that passed before the change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub passing: BTreeSet<String>,
}

impl Baseline {
    pub fn from_run(run: &TestRun) -> Self {
        Self {
            passing: run.passing().map(str::to_string).collect(),
        }
    }
}

/// Input to the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateReport<'a> {
    pub generated: &'a TestRun,
    pub regression: &'a TestRun,
    pub baseline: &'a Baseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRule {
    /// The generated test ran and every case passed.
    GeneratedTestPasses,
    /// Every baseline-passing regression test still passes.
    NoRegression,
}

impl GateRule {
    pub fn standard() -> Vec<GateRule> {
        vec![GateRule::GeneratedTestPasses, GateRule::NoRegression]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: GateRule,
    pub reason: String,
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Ready,
    NeedsFix,
    Regression,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Ready => "ready",
            GateStatus::NeedsFix => "needs_fix",
            GateStatus::Regression => "regression",
        }
    }
}

/// Gate outcome with per-test detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub status: GateStatus,
    /// Repository-relative path of the generated test file.
    pub generated_test: String,
    pub generated: Vec<TestOutcome>,
    pub regression: Vec<TestOutcome>,
    pub violations: Vec<Violation>,
}

impl QualityGateResult {
    pub fn is_ready(&self) -> bool {
        self.status == GateStatus::Ready
    }

    /// Names of the tests behind the violations, for error reporting.
    pub fn failing_tests(&self) -> Vec<String> {
        self.violations
            .iter()
            .flat_map(|v| v.tests.iter().cloned())
            .collect()
    }

    pub fn summary(&self) -> String {
        if self.violations.is_empty() {
            return format!(
                "generated test passed; {} regression test(s) passed",
                self.regression.iter().filter(|o| o.passed()).count()
            );
        }
        self.violations
            .iter()
            .map(|v| v.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Evaluate every rule; the status is the most severe violation
/// (Regression over NeedsFix).
pub fn evaluate_gate(rules: &[GateRule], report: &GateReport<'_>) -> (GateStatus, Vec<Violation>) {
    let violations: Vec<Violation> = rules
        .iter()
        .filter_map(|rule| check_rule(*rule, report))
        .collect();
    let status = if violations.iter().any(|v| v.rule == GateRule::NoRegression) {
        GateStatus::Regression
    } else if violations.is_empty() {
        GateStatus::Ready
    } else {
        GateStatus::NeedsFix
    };
    (status, violations)
}

fn check_rule(rule: GateRule, report: &GateReport<'_>) -> Option<Violation> {
    match rule {
        GateRule::GeneratedTestPasses => {
            if report.generated.outcomes.is_empty() {
                return Some(Violation {
                    rule,
                    reason: "generated test did not run".to_string(),
                    tests: Vec::new(),
                });
            }
            let failing: Vec<String> = report
                .generated
                .outcomes
                .iter()
                .filter(|o| !o.passed())
                .map(|o| o.test_id.clone())
                .collect();
            (!failing.is_empty()).then(|| Violation {
                rule,
                reason: format!("generated test failed: {}", failing.join(", ")),
                tests: failing,
            })
        }
        GateRule::NoRegression => {
            // A baseline test that vanished (e.g. its module no longer
            // imports) counts as failing.
            let failing: Vec<String> = report
                .baseline
                .passing
                .iter()
                .filter(|id| {
                    !report
                        .regression
                        .outcome(id)
                        .is_some_and(|o| o.passed())
                })
                .cloned()
                .collect();
            (!failing.is_empty()).then(|| Violation {
                rule,
                reason: format!(
                    "{} previously passing test(s) now fail: {}",
                    failing.len(),
                    failing.join(", ")
                ),
                tests: failing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testgen::runner::TestStatus;

    fn run(outcomes: &[(&str, TestStatus)]) -> TestRun {
        TestRun {
            outcomes: outcomes
                .iter()
                .map(|(id, s)| TestOutcome::new(*id, *s))
                .collect(),
            ..TestRun::default()
        }
    }

    #[test]
    fn test_all_passing_is_ready() {
        let generated = run(&[("gen::t", TestStatus::Passed)]);
        let regression = run(&[("a", TestStatus::Passed), ("b", TestStatus::Failed)]);
        // `b` was already failing before the change.
        let baseline = Baseline::from_run(&run(&[("a", TestStatus::Passed), ("b", TestStatus::Failed)]));
        let (status, violations) = evaluate_gate(
            &GateRule::standard(),
            &GateReport {
                generated: &generated,
                regression: &regression,
                baseline: &baseline,
            },
        );
        assert_eq!(status, GateStatus::Ready);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_generated_failure_needs_fix() {
        let generated = run(&[("gen::t", TestStatus::Failed)]);
        let regression = TestRun::default();
        let (status, violations) = evaluate_gate(
            &GateRule::standard(),
            &GateReport {
                generated: &generated,
                regression: &regression,
                baseline: &Baseline::default(),
            },
        );
        assert_eq!(status, GateStatus::NeedsFix);
        assert_eq!(violations[0].tests, vec!["gen::t"]);
    }

    #[test]
    fn test_one_lost_test_is_a_regression() {
        let generated = run(&[("gen::t", TestStatus::Passed)]);
        let baseline = Baseline::from_run(&run(&[
            ("a", TestStatus::Passed),
            ("b", TestStatus::Passed),
            ("c", TestStatus::Passed),
        ]));
        // `c` is missing after the change.
        let regression = run(&[("a", TestStatus::Passed), ("b", TestStatus::Passed)]);
        let (status, violations) = evaluate_gate(
            &GateRule::standard(),
            &GateReport {
                generated: &generated,
                regression: &regression,
                baseline: &baseline,
            },
        );
        assert_eq!(status, GateStatus::Regression);
        assert_eq!(violations[0].tests, vec!["c"]);
    }

    #[test]
    fn test_empty_generated_run_is_a_violation() {
        let empty = TestRun::default();
        let (status, _) = evaluate_gate(
            &[GateRule::GeneratedTestPasses],
            &GateReport {
                generated: &empty,
                regression: &empty,
                baseline: &Baseline::default(),
            },
        );
        assert_eq!(status, GateStatus::NeedsFix);
    }
}
