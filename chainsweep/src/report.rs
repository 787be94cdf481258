//! Sweep outcomes and the final report.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Serialize;
use tracing::info;

/// Which CA set a test case was drawn from.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Serialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Scenario {
    /// The bundled CAs exclude the root the client trusts.
    NoBundledRoot,
    /// The bundled CAs include the trusted root itself.
    BundledRoot,
}

/// What happened when the verifying client dialed one bundle.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Handshake and chain verification succeeded (client exit 0).
    Accepted { client_stdout: String },
    /// The client rejected the handshake (nonzero exit). Expected for some
    /// permutations; the diagnostic text says which check failed.
    Rejected {
        exit_code: Option<i32>,
        client_stderr: String,
    },
    /// The server never reached a usable listening state. Reported
    /// distinctly from a TLS-level rejection.
    ServerError { reason: String },
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ServerError { .. })
    }

    /// Short verdict label for summary lines.
    pub fn verdict(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "ACCEPTED",
            Self::Rejected { .. } => "REJECTED",
            Self::ServerError { .. } => "SERVER-ERROR",
        }
    }
}

/// The record of one tested bundle. Immutable once recorded.
#[derive(Clone, Debug, Serialize)]
pub struct HandshakeResult {
    pub scenario: Scenario,
    /// CA names in the order they appeared in the bundle.
    pub ca_order: Vec<String>,
    pub bundle_file: PathBuf,
    /// `subject <- issuer` per cert in the bundle, in bundle order.
    pub chain: Vec<String>,
    pub outcome: Outcome,
    /// Stderr the server wrote during this case, if any.
    pub server_stderr: String,
}

impl HandshakeResult {
    /// `[scenario] ca -> ca -> ca`
    pub fn label(&self) -> String {
        format!("[{}] {}", self.scenario, self.ca_order.join(" -> "))
    }
}

/// Ordered results across both scenarios, one entry per tested bundle.
/// Results are append-only; each permutation is tested exactly once.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    results: Vec<HandshakeResult>,
}

impl Report {
    pub fn record(&mut self, result: HandshakeResult) {
        info!("{}: {}", result.label(), result.outcome.verdict());
        self.results.push(result);
    }

    pub fn results(&self) -> &[HandshakeResult] {
        &self.results
    }

    pub fn num_accepted(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_accepted()).count()
    }

    pub fn num_server_errors(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_server_error()).count()
    }

    pub fn num_rejected(&self) -> usize {
        self.results.len() - self.num_accepted() - self.num_server_errors()
    }

    /// Human-readable summary: one verdict line per permutation, with
    /// diagnostics for everything that wasn't accepted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "handshake sweep: {} bundles tested, {} accepted, {} rejected, \
             {} server errors",
            self.results.len(),
            self.num_accepted(),
            self.num_rejected(),
            self.num_server_errors(),
        );

        let label_width = self
            .results
            .iter()
            .map(|res| res.label().len())
            .max()
            .unwrap_or(0);

        for res in &self.results {
            let _ = writeln!(
                out,
                "  {:<label_width$}  {}",
                res.label(),
                res.outcome.verdict(),
            );

            match &res.outcome {
                Outcome::Accepted { .. } => (),
                Outcome::Rejected { client_stderr, .. } => {
                    for line in &res.chain {
                        let _ = writeln!(out, "      chain: {line}");
                    }
                    for line in nonempty_lines(client_stderr) {
                        let _ = writeln!(out, "      client: {line}");
                    }
                }
                Outcome::ServerError { reason } => {
                    let _ = writeln!(out, "      {reason}");
                    for line in nonempty_lines(&res.server_stderr) {
                        let _ = writeln!(out, "      server: {line}");
                    }
                }
            }
        }
        out
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

fn nonempty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter(|line| !line.trim().is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    fn rejected_result() -> HandshakeResult {
        HandshakeResult {
            scenario: Scenario::BundledRoot,
            ca_order: vec!["root-ca".to_owned(), "issuing-ca".to_owned()],
            bundle_file: PathBuf::from("out/server+root-ca+issuing-ca.pem"),
            chain: vec!["CN=server <- CN=issuing".to_owned()],
            outcome: Outcome::Rejected {
                exit_code: Some(1),
                client_stderr: "verify error:num=19:self-signed certificate \
                                in certificate chain\n"
                    .to_owned(),
            },
            server_stderr: String::new(),
        }
    }

    fn accepted_result() -> HandshakeResult {
        HandshakeResult {
            scenario: Scenario::NoBundledRoot,
            ca_order: vec!["issuing-ca".to_owned(), "cross-ca".to_owned()],
            bundle_file: PathBuf::from("out/server+issuing-ca+cross-ca.pem"),
            chain: Vec::new(),
            outcome: Outcome::Accepted {
                client_stdout: "CONNECTED\n".to_owned(),
            },
            server_stderr: String::new(),
        }
    }

    #[test]
    fn scenario_labels() {
        assert_eq!(Scenario::NoBundledRoot.to_string(), "no-bundled-root");
        assert_eq!(Scenario::BundledRoot.to_string(), "bundled-root");
    }

    #[test]
    fn render_summarizes_every_case() {
        let mut report = Report::default();
        report.record(accepted_result());
        report.record(rejected_result());

        assert_eq!(report.results().len(), 2);

        let rendered = report.render();
        assert!(rendered.contains("2 bundles tested"), "{rendered}");
        assert!(rendered.contains("1 accepted"), "{rendered}");
        assert!(rendered.contains("1 rejected"), "{rendered}");
        assert!(rendered.contains("issuing-ca -> cross-ca"), "{rendered}");
        // Diagnostics appear for the rejection only.
        assert!(rendered.contains("verify error:num=19"), "{rendered}");
        assert!(!rendered.contains("CONNECTED"), "{rendered}");
    }

    #[test]
    fn server_errors_are_counted_separately() {
        let mut report = Report::default();
        let mut result = accepted_result();
        result.outcome = Outcome::ServerError {
            reason: "server not listening on 127.0.0.1:45011 after 5000ms"
                .to_owned(),
        };
        report.record(result);

        assert_eq!(report.num_accepted(), 0);
        assert_eq!(report.num_rejected(), 0);
        assert_eq!(report.num_server_errors(), 1);
        assert!(report.render().contains("SERVER-ERROR"));
    }

    #[test]
    fn json_report_tags_outcomes() {
        let mut report = Report::default();
        report.record(rejected_result());

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["results"][0]["outcome"]["kind"], "rejected");
        assert_eq!(value["results"][0]["scenario"], "bundled-root");
    }
}
