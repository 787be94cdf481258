//! Command line interface: the permutation sweep and the fixture generator.

use std::{env, path::PathBuf};

use anyhow::Context;
use argh::FromArgs;
use tracing::{info, warn};

use crate::{
    bundle::{self, CertificateFile},
    error::FatalError,
    report::{Report, Scenario},
    runner::{HandshakeRunner, RunnerConfig},
    testca,
};

pub const DEFAULT_CERTS_DIR: &str = "certs";
pub const DEFAULT_OUT_DIR: &str = "handshake-bundles";
/// The CA names bundled by default; `gen-certs` writes fixtures under
/// exactly these names.
pub const DEFAULT_BUNDLE_CAS: [&str; 2] = [testca::SUCCESSOR, testca::CROSS_SIGNED];
pub const DEFAULT_TRUST_ROOT: &str = testca::OLD_ROOT;
pub const DEFAULT_LEAF: &str = testca::LEAF;
pub const DEFAULT_KEY_FILE: &str = testca::LEAF_KEY;
pub const DEFAULT_PORT: u16 = 45011;
pub const DEFAULT_SNI: &str = "localhost";
pub const DEFAULT_CLIENT_BIN: &str = "openssl";

/// Exercise TLS chain validation across serving-bundle CA orderings.
#[derive(Debug, FromArgs, PartialEq)]
pub struct Args {
    #[argh(subcommand)]
    pub command: Option<SweepCommand>,
}

#[derive(Debug, FromArgs, PartialEq)]
#[argh(subcommand)]
pub enum SweepCommand {
    Sweep(SweepArgs),
    GenCerts(GenCertsArgs),
}

impl SweepCommand {
    pub fn run(self) -> anyhow::Result<()> {
        match self {
            Self::Sweep(args) => args.run(),
            Self::GenCerts(args) => args.run(),
        }
    }
}

/// Run the full two-scenario permutation sweep.
#[derive(Debug, FromArgs, PartialEq)]
#[argh(subcommand, name = "sweep")]
pub struct SweepArgs {
    /// directory containing the input certificate and key files
    #[argh(option, default = "PathBuf::from(DEFAULT_CERTS_DIR)")]
    pub certs_dir: PathBuf,

    /// name of the leaf (serving) certificate, without the `.pem` suffix
    #[argh(option, default = "DEFAULT_LEAF.to_owned()")]
    pub leaf: String,

    /// server private key file name, relative to --certs-dir
    #[argh(option, default = "DEFAULT_KEY_FILE.to_owned()")]
    pub key: String,

    /// name of a CA cert to include in bundles; repeat once per CA.
    /// Defaults to the issuing CA and its cross-signed form
    #[argh(option)]
    pub ca: Vec<String>,

    /// name of the trusted root: the client's trust anchor, excluded from
    /// bundles in the first scenario and appended to the CA set in the
    /// second
    #[argh(option, default = "DEFAULT_TRUST_ROOT.to_owned()")]
    pub trust_root: String,

    /// directory the generated bundle files are written to
    #[argh(option, default = "PathBuf::from(DEFAULT_OUT_DIR)")]
    pub out_dir: PathBuf,

    /// loopback port the test server binds; shared by all (sequential)
    /// cases
    #[argh(option, default = "DEFAULT_PORT")]
    pub port: u16,

    /// server name (SNI) the client sends in its hello
    #[argh(option, default = "DEFAULT_SNI.to_owned()")]
    pub sni: String,

    /// path to the TLS test server binary. Defaults to `chainsweep-server`
    /// next to this executable
    #[argh(option)]
    pub server_bin: Option<PathBuf>,

    /// verifying client program
    #[argh(option, default = "DEFAULT_CLIENT_BIN.to_owned()")]
    pub client_bin: String,

    /// also write the full report as JSON to this path
    #[argh(option)]
    pub json: Option<PathBuf>,
}

impl Default for SweepArgs {
    fn default() -> Self {
        Self {
            certs_dir: PathBuf::from(DEFAULT_CERTS_DIR),
            leaf: DEFAULT_LEAF.to_owned(),
            key: DEFAULT_KEY_FILE.to_owned(),
            ca: Vec::new(),
            trust_root: DEFAULT_TRUST_ROOT.to_owned(),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            port: DEFAULT_PORT,
            sni: DEFAULT_SNI.to_owned(),
            server_bin: None,
            client_bin: DEFAULT_CLIENT_BIN.to_owned(),
            json: None,
        }
    }
}

impl SweepArgs {
    pub fn run(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build Tokio runtime")?;
        rt.block_on(self.sweep())
    }

    async fn sweep(self) -> anyhow::Result<()> {
        // Load and validate every input up front, before any child process
        // is spawned.
        let leaf = CertificateFile::load(&self.certs_dir, &self.leaf)?;
        let ca_names = if self.ca.is_empty() {
            DEFAULT_BUNDLE_CAS.map(str::to_owned).to_vec()
        } else {
            self.ca.clone()
        };
        let cas = ca_names
            .iter()
            .map(|name| CertificateFile::load(&self.certs_dir, name))
            .collect::<Result<Vec<_>, _>>()?;
        let root = CertificateFile::load(&self.certs_dir, &self.trust_root)?;

        let key_path = self.certs_dir.join(&self.key);
        if !key_path.is_file() {
            return Err(FatalError::invalid_input(
                key_path,
                "missing private key file",
            )
            .into());
        }

        let server_bin = match &self.server_bin {
            Some(path) => path.clone(),
            None => default_server_bin()?,
        };

        let config = RunnerConfig {
            server_bin,
            client_bin: self.client_bin.clone(),
            key_path,
            trust_root_path: self
                .certs_dir
                .join(format!("{}.pem", self.trust_root)),
            port: self.port,
            sni: self.sni.clone(),
        };
        let runner = HandshakeRunner::new(config);

        // Scenario one bundles only the intermediate CAs; scenario two
        // appends the trusted root to the permuted set.
        let mut cas_with_root = cas.clone();
        cas_with_root.push(root);
        let scenarios = [
            (Scenario::NoBundledRoot, cas),
            (Scenario::BundledRoot, cas_with_root),
        ];

        let mut report = Report::default();
        'sweep: for (scenario, ca_set) in scenarios {
            for case in bundle::test_cases(scenario, &leaf, &ca_set) {
                let bundle_path = case.bundle.write_to(&self.out_dir)?;
                info!("testing {scenario} bundle {}", case.bundle.file_name());

                tokio::select! {
                    biased;
                    _ = tokio::signal::ctrl_c() => {
                        warn!("interrupted; stopping sweep");
                        break 'sweep;
                    }
                    result = runner.run_case(&case, &bundle_path) => {
                        report.record(result?);
                    }
                }
            }
        }

        print!("{}", report.render());

        if let Some(path) = &self.json {
            report.write_json(path)?;
            info!("wrote JSON report to {}", path.display());
        }

        Ok(())
    }
}

/// `chainsweep-server` installed next to the current executable.
fn default_server_bin() -> anyhow::Result<PathBuf> {
    let exe = env::current_exe()
        .context("Failed to resolve the current executable")?;
    let dir = exe
        .parent()
        .context("Current executable has no parent directory")?;
    Ok(dir.join("chainsweep-server"))
}

/// Generate the cross-signed rotation PKI fixture files.
#[derive(Debug, FromArgs, PartialEq)]
#[argh(subcommand, name = "gen-certs")]
pub struct GenCertsArgs {
    /// directory to write the fixture PEM files into
    #[argh(option, default = "PathBuf::from(DEFAULT_CERTS_DIR)")]
    pub out_dir: PathBuf,

    /// DNS name the server leaf certificate is bound to
    #[argh(option, default = "DEFAULT_SNI.to_owned()")]
    pub sni: String,
}

impl GenCertsArgs {
    pub fn run(self) -> anyhow::Result<()> {
        let written = testca::write_fixtures(&self.out_dir, &self.sni)?;
        for path in &written {
            info!("wrote {}", path.display());
        }
        Ok(())
    }
}
