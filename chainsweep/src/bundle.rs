//! Serving-bundle construction.
//!
//! A bundle is the PEM file a TLS server presents: the fixed leaf cert
//! first, then CA certs in one specific order. Misordered chains are a
//! real-world misconfiguration that TLS stacks tolerate to different
//! degrees, so the generator expands a CA set into every ordering and
//! writes one bundle file per ordering.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rustls::pki_types::{CertificateDer, pem::PemObject};
use tracing::debug;

use crate::{error::FatalError, report::Scenario};

/// A named PEM certificate file. Immutable once loaded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateFile {
    name: String,
    pem: String,
}

/// One serving bundle: the leaf cert followed by CA certs in a specific
/// order. Only the CA ordering varies across bundles; the leaf is fixed.
#[derive(Clone, Debug)]
pub struct Bundle {
    leaf: CertificateFile,
    cas: Vec<CertificateFile>,
}

/// A bundle tagged with the CA-set scenario it was drawn from.
#[derive(Clone, Debug)]
pub struct TestCase {
    pub scenario: Scenario,
    pub bundle: Bundle,
}

// --- impl CertificateFile --- //

impl CertificateFile {
    /// Load `<name>.pem` from `dir`. The file must contain at least one
    /// parseable `CERTIFICATE` block.
    pub fn load(dir: &Path, name: &str) -> Result<Self, FatalError> {
        let path = dir.join(format!("{name}.pem"));

        let pem = fs::read_to_string(&path).map_err(|err| {
            FatalError::invalid_input(&path, format!("unreadable: {err}"))
        })?;

        let num_certs = CertificateDer::pem_slice_iter(pem.as_bytes())
            .filter(Result::is_ok)
            .count();
        if num_certs == 0 {
            return Err(FatalError::invalid_input(
                &path,
                "no CERTIFICATE blocks found",
            ));
        }

        Ok(Self {
            name: name.to_owned(),
            pem,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

// --- impl Bundle --- //

impl Bundle {
    pub fn new(leaf: CertificateFile, cas: Vec<CertificateFile>) -> Self {
        Self { leaf, cas }
    }

    /// `<leaf>+<ca>+...+<ca>.pem`. Distinct orderings of the same CA set
    /// always map to distinct file names, so a sweep never overwrites one
    /// permutation's bundle with another's.
    pub fn file_name(&self) -> String {
        let mut parts = vec![self.leaf.name()];
        parts.extend(self.cas.iter().map(CertificateFile::name));
        format!("{}.pem", parts.join("+"))
    }

    /// The CA names in bundle order.
    pub fn ca_names(&self) -> Vec<String> {
        self.cas.iter().map(|ca| ca.name().to_owned()).collect()
    }

    /// Leaf PEM first, byte for byte, then each CA's PEM in bundle order.
    pub fn to_pem(&self) -> String {
        let mut out = String::new();
        for cert in std::iter::once(&self.leaf).chain(self.cas.iter()) {
            out.push_str(cert.pem());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    /// Write the bundle into `dir` (created if absent) so it can be
    /// inspected after the run. Returns the bundle file path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, FatalError> {
        fs::create_dir_all(dir).map_err(|err| {
            FatalError::harness(
                format!("failed to create bundle dir {}", dir.display()),
                err,
            )
        })?;

        let path = dir.join(self.file_name());
        fs::write(&path, self.to_pem()).map_err(|err| {
            FatalError::harness(
                format!("failed to write bundle {}", path.display()),
                err,
            )
        })?;
        debug!("wrote bundle {}", path.display());

        Ok(path)
    }
}

/// Expand one scenario's CA set into its test cases, one per CA ordering.
/// A set of size n yields n! cases; a single CA still yields its one
/// (identity) ordering.
pub fn test_cases(
    scenario: Scenario,
    leaf: &CertificateFile,
    cas: &[CertificateFile],
) -> Vec<TestCase> {
    permutations(cas)
        .into_iter()
        .map(|ordering| TestCase {
            scenario,
            bundle: Bundle::new(leaf.clone(), ordering),
        })
        .collect()
}

/// All orderings of `items`, in a deterministic order. The empty slice
/// yields the single empty ordering.
pub fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.is_empty() {
        return vec![Vec::new()];
    }

    let mut out = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(idx);
        for mut tail in permutations(&rest) {
            tail.insert(0, item.clone());
            out.push(tail);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::testca::RotationPki;

    fn cert(name: &str) -> CertificateFile {
        CertificateFile {
            name: name.to_owned(),
            pem: format!(
                "-----BEGIN CERTIFICATE-----\n{name}\n-----END CERTIFICATE-----\n"
            ),
        }
    }

    #[test]
    fn permutation_counts() {
        assert_eq!(permutations::<u8>(&[]).len(), 1);
        assert_eq!(permutations(&[1]).len(), 1);
        assert_eq!(permutations(&[1, 2]).len(), 2);
        assert_eq!(permutations(&[1, 2, 3]).len(), 6);
    }

    #[test]
    fn single_ca_still_yields_one_case() {
        let cases = test_cases(Scenario::NoBundledRoot, &cert("leaf"), &[cert("ca")]);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].bundle.ca_names(), vec!["ca".to_owned()]);
    }

    #[test]
    fn bundles_start_with_leaf_bytes() {
        let leaf = cert("leaf");
        let cases =
            test_cases(Scenario::BundledRoot, &leaf, &[cert("a"), cert("b")]);
        assert_eq!(cases.len(), 2);
        for case in &cases {
            assert!(case.bundle.to_pem().starts_with(leaf.pem()));
        }
    }

    #[test]
    fn file_names_are_distinct_and_deterministic() {
        let leaf = cert("leaf");
        let cas = [cert("a"), cert("b"), cert("c")];
        let cases = test_cases(Scenario::NoBundledRoot, &leaf, &cas);

        let names: HashSet<String> =
            cases.iter().map(|case| case.bundle.file_name()).collect();
        assert_eq!(names.len(), cases.len());

        // Regenerating gives the same names in the same order.
        let again = test_cases(Scenario::NoBundledRoot, &leaf, &cas);
        for (case, repeat) in cases.iter().zip(again.iter()) {
            assert_eq!(case.bundle.file_name(), repeat.bundle.file_name());
        }
    }

    #[test]
    fn write_to_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let leaf = cert("leaf");
        let bundle = Bundle::new(leaf.clone(), vec![cert("a"), cert("b")]);

        let path = bundle.write_to(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("leaf+a+b.pem"));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with(leaf.pem()));
        assert!(written.contains("-----BEGIN CERTIFICATE-----\na\n"));
    }

    #[test]
    fn missing_file_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = CertificateFile::load(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, FatalError::InvalidInput { .. }));
    }

    #[test]
    fn non_certificate_content_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.pem"), "hello\n").unwrap();
        let err = CertificateFile::load(dir.path(), "junk").unwrap_err();
        assert!(matches!(err, FatalError::InvalidInput { .. }));
    }

    #[test]
    fn generated_fixture_loads() {
        let dir = tempfile::tempdir().unwrap();
        let pki = RotationPki::generate("localhost").unwrap();
        std::fs::write(dir.path().join("root-ca.pem"), &pki.old_root_pem)
            .unwrap();

        let file = CertificateFile::load(dir.path(), "root-ca").unwrap();
        assert_eq!(file.name(), "root-ca");
        assert!(file.pem().contains("BEGIN CERTIFICATE"));
    }

    proptest! {
        /// A CA set of size n yields n! orderings, all distinct, each a
        /// reordering of the same multiset.
        #[test]
        fn permutation_properties(
            raw in prop::collection::hash_set(0u16..1000, 1..=4)
        ) {
            let names: Vec<String> =
                raw.iter().map(|n| format!("ca{n}")).collect();

            let perms = permutations(&names);
            let expected: usize = (1..=names.len()).product();
            prop_assert_eq!(perms.len(), expected);

            let unique: HashSet<&Vec<String>> = perms.iter().collect();
            prop_assert_eq!(unique.len(), perms.len());

            let mut sorted_input = names.clone();
            sorted_input.sort();
            for perm in &perms {
                let mut sorted = perm.clone();
                sorted.sort();
                prop_assert_eq!(&sorted, &sorted_input);
            }
        }
    }
}
