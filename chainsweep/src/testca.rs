//! The cross-signed rotation PKI used as the harness's default fixtures.
//!
//! Models a CA rotation in flight: clients still trust the old root
//! (keypair A) while the server's leaf is already issued by the successor
//! CA (keypair B). The successor exists in two forms with the same subject
//! and key: self-signed, and cross-signed by the old root. The cross-signed
//! form is the bridge that lets old clients build a path to the new leaf.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyPair,
};

/// File stem of the old root CA cert, the client's trust anchor.
pub const OLD_ROOT: &str = "root-ca";
/// File stem of the self-signed successor CA cert.
pub const SUCCESSOR: &str = "issuing-ca";
/// File stem of the cross-signed successor CA cert.
pub const CROSS_SIGNED: &str = "cross-ca";
/// File stem of the server leaf cert.
pub const LEAF: &str = "server";
/// File name of the leaf private key.
pub const LEAF_KEY: &str = "server.key";

const OLD_ROOT_CN: &str = "chainsweep old root CA";
const SUCCESSOR_CN: &str = "chainsweep issuing CA";
const LEAF_CN: &str = "chainsweep server";

/// PEM artifacts of a freshly generated rotation PKI.
pub struct RotationPki {
    /// Self-signed old root (keypair A).
    pub old_root_pem: String,
    /// Self-signed successor CA (keypair B).
    pub successor_pem: String,
    /// Same subject and keypair as the successor, issued by the old root.
    pub cross_signed_pem: String,
    /// Server leaf with its own keypair, issued by keypair B, bound to one
    /// DNS name.
    pub leaf_pem: String,
    /// The leaf's PKCS#8 private key.
    pub leaf_key_pem: String,
}

impl RotationPki {
    pub fn generate(dns_name: &str) -> anyhow::Result<Self> {
        let root_key =
            KeyPair::generate().context("Failed to generate root CA keypair")?;
        let successor_key = KeyPair::generate()
            .context("Failed to generate successor CA keypair")?;
        let leaf_key =
            KeyPair::generate().context("Failed to generate leaf keypair")?;

        let old_root = ca_params(OLD_ROOT_CN)?
            .self_signed(&root_key)
            .context("Failed to self-sign old root CA")?;

        // The two successor certs must share subject and key so a verifier
        // can treat either as the leaf's issuer.
        let successor = ca_params(SUCCESSOR_CN)?
            .self_signed(&successor_key)
            .context("Failed to self-sign successor CA")?;
        let cross_signed = ca_params(SUCCESSOR_CN)?
            .signed_by(&successor_key, &old_root, &root_key)
            .context("Failed to cross-sign successor CA")?;

        let leaf = leaf_params(dns_name)?
            .signed_by(&leaf_key, &successor, &successor_key)
            .context("Failed to issue server leaf")?;

        Ok(Self {
            old_root_pem: old_root.pem(),
            successor_pem: successor.pem(),
            cross_signed_pem: cross_signed.pem(),
            leaf_pem: leaf.pem(),
            leaf_key_pem: leaf_key.serialize_pem(),
        })
    }
}

fn ca_params(common_name: &str) -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .context("Failed to build CA cert params")?;
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    set_fixture_validity(&mut params);
    Ok(params)
}

fn leaf_params(dns_name: &str) -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![dns_name.to_owned()])
        .context("Failed to build leaf cert params")?;
    params.distinguished_name = distinguished_name(LEAF_CN);
    set_fixture_validity(&mut params);
    Ok(params)
}

// Fixed validity window keeps regenerated fixtures comparable across runs.
fn set_fixture_validity(params: &mut CertificateParams) {
    params.not_before = rcgen::date_time_ymd(1975, 1, 1);
    params.not_after = rcgen::date_time_ymd(4096, 1, 1);
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, "chainsweep");
    name.push(DnType::CommonName, common_name);
    name
}

/// Write the five fixture PEMs into `dir` (created if absent) under the
/// harness's default input names. Returns the written paths.
pub fn write_fixtures(
    dir: &Path,
    dns_name: &str,
) -> anyhow::Result<Vec<PathBuf>> {
    let pki = RotationPki::generate(dns_name)?;

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let files = [
        (format!("{OLD_ROOT}.pem"), &pki.old_root_pem),
        (format!("{SUCCESSOR}.pem"), &pki.successor_pem),
        (format!("{CROSS_SIGNED}.pem"), &pki.cross_signed_pem),
        (format!("{LEAF}.pem"), &pki.leaf_pem),
        (LEAF_KEY.to_owned(), &pki.leaf_key_pem),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (file_name, pem) in files {
        let path = dir.join(file_name);
        fs::write(&path, pem)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
