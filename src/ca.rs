//! Local certificate authority: a self-signed root generated once, and
//! short-chain ECDSA leaf certificates issued under it on demand.
//!
//! Layout on disk (under the state dir):
//!   `ca/rootCA.pem`, `ca/rootCA-key.pem` (0600),
//!   `certs/<name>.pem`, `certs/<name>-key.pem` (0600).
//!
//! The root is 2048-bit RSA with a 10-year lifetime so it can be imported
//! into OS trust stores once and forgotten. Leaves are ECDSA P-256 with a
//! ~825-day lifetime, which keeps them inside operating-system policy limits
//! while the ECDSA key keeps TLS handshakes cheap. A leaf is reissued when
//! it is missing, not ECDSA, or within 30 days of expiry.

use std::fs::{self, OpenOptions};
use std::io::{BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::crypto::ring;
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::public_key::PublicKey;

use crate::error::{Error, Result};
use crate::paths::Paths;

const ROOT_KEY_BITS: usize = 2048;
const ROOT_VALIDITY: Duration = Duration::days(10 * 365);
const LEAF_VALIDITY: Duration = Duration::days(825);
const RENEWAL_WINDOW: Duration = Duration::days(30);
const BACKDATE: Duration = Duration::hours(1);

pub struct CertAuthority {
    paths: Paths,
}

struct RootCa {
    cert: Certificate,
    key: KeyPair,
}

impl CertAuthority {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn root_exists(&self) -> bool {
        self.paths.ca_cert().exists() && self.paths.ca_key().exists()
    }

    /// Generate the root CA if it is not already on disk. Idempotent; an
    /// existing root is never regenerated.
    pub fn ensure_root(&self) -> Result<()> {
        if self.root_exists() {
            return Ok(());
        }

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(self.paths.ca_dir())
            .map_err(|e| Error::certificate(format!("creating CA dir: {e}")))?;

        let rsa_key = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, ROOT_KEY_BITS)
            .map_err(|e| Error::certificate(format!("generating CA key: {e}")))?;
        let key_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::certificate(format!("encoding CA key: {e}")))?;
        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::certificate(format!("loading CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "dotlocal");
        dn.push(DnType::CommonName, "dotlocal Root CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + ROOT_VALIDITY;

        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::certificate(format!("creating CA cert: {e}")))?;

        write_file(&self.paths.ca_cert(), cert.pem().as_bytes(), 0o644)?;
        write_file(&self.paths.ca_key(), key_pem.as_bytes(), 0o600)?;

        info!(path = %self.paths.ca_cert().display(), "generated root CA");
        Ok(())
    }

    fn load_root(&self) -> Result<RootCa> {
        let cert_pem = fs::read_to_string(self.paths.ca_cert())
            .map_err(|e| Error::certificate(format!("reading CA cert: {e}")))?;
        let key_pem = fs::read_to_string(self.paths.ca_key())
            .map_err(|e| Error::certificate(format!("reading CA key: {e}")))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::certificate(format!("parsing CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| Error::certificate(format!("parsing CA cert: {e}")))?;
        // Re-signing yields the issuer value rcgen needs; the subject and key
        // identifiers used in issued leaves come from the parsed params.
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::certificate(format!("rebuilding CA cert: {e}")))?;

        Ok(RootCa { cert, key })
    }

    pub fn leaf_exists(&self, name: &str) -> bool {
        self.paths.leaf_cert(name).exists() && self.paths.leaf_key(name).exists()
    }

    /// Issue a leaf for `<name>.local` unless a fresh one is already on disk.
    pub fn ensure_leaf(&self, name: &str) -> Result<()> {
        if self.leaf_exists(name) && !self.leaf_needs_renewal(name) {
            return Ok(());
        }
        self.generate_leaf(name)
    }

    fn generate_leaf(&self, name: &str) -> Result<()> {
        let root = self.load_root()?;

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(self.paths.certs_dir())
            .map_err(|e| Error::certificate(format!("creating certs dir: {e}")))?;

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::certificate(format!("generating leaf key: {e}")))?;

        let hostname = format!("{name}.local");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.subject_alt_names = vec![
            SanType::DnsName(
                hostname
                    .clone()
                    .try_into()
                    .map_err(|e| Error::certificate(format!("invalid SAN {hostname:?}: {e}")))?,
            ),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + LEAF_VALIDITY;

        let cert = params
            .signed_by(&key, &root.cert, &root.key)
            .map_err(|e| Error::certificate(format!("signing leaf for {hostname}: {e}")))?;

        write_file(&self.paths.leaf_cert(name), cert.pem().as_bytes(), 0o644)?;
        write_file(&self.paths.leaf_key(name), key.serialize_pem().as_bytes(), 0o600)?;

        debug!(host = %hostname, "issued leaf certificate");
        Ok(())
    }

    /// A leaf needs renewal when it cannot be parsed, is not ECDSA, or
    /// expires within the renewal window. Parse failures count as stale.
    fn leaf_needs_renewal(&self, name: &str) -> bool {
        let data = match fs::read(self.paths.leaf_cert(name)) {
            Ok(data) => data,
            Err(_) => return true,
        };
        let pem = match x509_parser::pem::parse_x509_pem(&data) {
            Ok((_, pem)) => pem,
            Err(_) => return true,
        };
        let cert = match pem.parse_x509() {
            Ok(cert) => cert,
            Err(_) => return true,
        };

        if !matches!(cert.public_key().parsed(), Ok(PublicKey::EC(_))) {
            return true;
        }

        let renew_at = OffsetDateTime::now_utc() + RENEWAL_WINDOW;
        cert.validity().not_after.timestamp() < renew_at.unix_timestamp()
    }

    /// Load a leaf as a rustls [`CertifiedKey`] ready for the SNI resolver.
    pub fn load_leaf_certified(&self, name: &str) -> Result<Arc<CertifiedKey>> {
        let cert_path = self.paths.leaf_cert(name);
        let key_path = self.paths.leaf_key(name);

        let mut cert_reader = BufReader::new(
            fs::File::open(&cert_path)
                .map_err(|e| Error::certificate(format!("reading cert for {name}: {e}")))?,
        );
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::certificate(format!("parsing cert for {name}: {e}")))?;
        if certs.is_empty() {
            return Err(Error::certificate(format!("no certificate in {}", cert_path.display())));
        }

        let mut key_reader = BufReader::new(
            fs::File::open(&key_path)
                .map_err(|e| Error::certificate(format!("reading key for {name}: {e}")))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| Error::certificate(format!("parsing key for {name}: {e}")))?
            .ok_or_else(|| Error::certificate(format!("no private key in {}", key_path.display())))?;

        let signing_key = ring::default_provider()
            .key_provider
            .load_private_key(key)
            .map_err(|e| Error::certificate(format!("loading key for {name}: {e}")))?;

        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }
}

fn write_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| Error::certificate(format!("writing {}: {e}", path.display())))?;
    file.write_all(data)
        .map_err(|e| Error::certificate(format!("writing {}: {e}", path.display())))
}
