//! Aggregated run results.

use std::fmt::Write as _;

use serde::Serialize;

/// Final status of one situation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    /// Not run because a dependency did not pass.
    Skipped { blocked_by: String },
    /// The diagnostic panicked or was aborted.
    Crashed,
}

impl Verdict {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    fn label(&self) -> &'static str {
        match self {
            Verdict::Passed => "PASS",
            Verdict::Failed => "FAIL",
            Verdict::Skipped { .. } => "SKIP",
            Verdict::Crashed => "CRASH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SituationResult {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub detail: String,
    pub elapsed_ms: u64,
}

/// Protocol anomaly still logged on a connection when the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub role: String,
    pub detail: String,
}

/// Results in execution order, then anomalies no situation claimed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub results: Vec<SituationResult>,
    pub anomalies: Vec<Anomaly>,
}

impl Report {
    pub fn get(&self, id: &str) -> Option<&SituationResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.verdict.is_pass()).count()
    }

    /// Situations that did not pass, whatever the reason.
    pub fn not_passed(&self) -> usize {
        self.results.len() - self.passed()
    }

    /// Every situation passed and no anomaly was left over.
    pub fn all_passed(&self) -> bool {
        self.anomalies.is_empty() && self.results.iter().all(|r| r.verdict.is_pass())
    }

    /// One line per situation, then a summary line.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            let _ = write!(
                out,
                "[{}] {} - {} ({}ms)",
                result.verdict.label(),
                result.id,
                result.name,
                result.elapsed_ms
            );
            if let Verdict::Skipped { blocked_by } = &result.verdict {
                let _ = write!(out, " blocked by {}", blocked_by);
            }
            out.push('\n');
            if !result.detail.is_empty() && !result.verdict.is_pass() {
                let _ = writeln!(out, "    {}", result.detail);
            }
        }
        for anomaly in &self.anomalies {
            let _ = writeln!(out, "[ANOMALY] {} - {}", anomaly.role, anomaly.detail);
        }
        let _ = write!(
            out,
            "\n{} passed, {} not passed, {} total",
            self.passed(),
            self.not_passed(),
            self.results.len()
        );
        if !self.anomalies.is_empty() {
            let _ = write!(out, ", {} anomalies", self.anomalies.len());
        }
        out.push('\n');
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, verdict: Verdict, detail: &str) -> SituationResult {
        SituationResult {
            id: id.to_string(),
            name: format!("{} name", id),
            verdict,
            detail: detail.to_string(),
            elapsed_ms: 3,
        }
    }

    fn sample() -> Report {
        Report {
            results: vec![
                result("a", Verdict::Passed, "fine"),
                result("b", Verdict::Failed, "no DONE"),
                result(
                    "c",
                    Verdict::Skipped {
                        blocked_by: "b".into(),
                    },
                    "",
                ),
            ],
            anomalies: Vec::new(),
        }
    }

    #[test]
    fn test_counts() {
        let report = sample();
        assert_eq!(report.passed(), 1);
        assert_eq!(report.not_passed(), 2);
        assert!(!report.all_passed());
        assert!(Report::default().all_passed());
    }

    #[test]
    fn test_render_text() {
        let text = sample().render_text();
        assert!(text.contains("[PASS] a - a name (3ms)\n"));
        assert!(text.contains("[FAIL] b - b name (3ms)\n    no DONE\n"));
        assert!(text.contains("[SKIP] c - c name (3ms) blocked by b\n"));
        assert!(text.ends_with("1 passed, 2 not passed, 3 total\n"));
    }

    #[test]
    fn test_leftover_anomaly_fails_the_run() {
        let report = Report {
            results: vec![result("a", Verdict::Passed, "fine")],
            anomalies: vec![Anomaly {
                role: "primary".into(),
                detail: "unsolicited DONE for stream 4".into(),
            }],
        };
        assert_eq!(report.not_passed(), 0);
        assert!(!report.all_passed());

        let text = report.render_text();
        assert!(text.contains("[ANOMALY] primary - unsolicited DONE for stream 4\n"));
        assert!(text.ends_with("1 passed, 0 not passed, 1 total, 1 anomalies\n"));

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["anomalies"][0]["role"], "primary");
    }

    #[test]
    fn test_json_shape() {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(value["results"][0]["status"], "passed");
        assert_eq!(value["results"][2]["status"], "skipped");
        assert_eq!(value["results"][2]["blocked_by"], "b");
    }
}
