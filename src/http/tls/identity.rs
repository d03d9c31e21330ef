//! Certificates and keys presented during a handshake

use super::config::TlsError;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::SslContextBuilder;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::fs;
use std::path::Path;

/// A certificate chain and its private key
#[derive(Clone)]
pub struct Identity {
    certificate: X509,
    chain: Vec<X509>,
    key: PKey<Private>,
}

impl Identity {
    /// Generate a throwaway self-signed identity (RSA 2048, one year)
    pub fn self_signed(common_name: &str) -> Result<Self, TlsError> {
        let rsa = Rsa::generate(2048)?;
        let key = PKey::from_rsa(rsa)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let name = name.build();

        let mut serial = BigNum::new()?;
        serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        let serial: openssl::asn1::Asn1Integer = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
        let not_after: Asn1Time = Asn1Time::days_from_now(365)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().build()?)?;

        let san = SubjectAlternativeName::new()
            .dns(common_name)
            .ip("127.0.0.1")
            .build(&builder.x509v3_context(None, None))?;
        builder.append_extension(san)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Identity {
            certificate: builder.build(),
            chain: Vec::new(),
            key,
        })
    }

    /// Load a certificate chain and private key from one PEM blob
    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        let mut certs = X509::stack_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        if certs.is_empty() {
            return Err(TlsError::Certificate("no certificate in PEM".to_string()));
        }
        let certificate = certs.remove(0);

        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;

        Ok(Identity {
            certificate,
            chain: certs,
            key,
        })
    }

    /// Load certificate and key from a PEM file
    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        let pem = fs::read(path.as_ref())?;
        Self::from_pem(&pem)
    }

    /// Serialize as certificate chain followed by a PKCS#8 key
    pub fn to_pem(&self) -> Result<Vec<u8>, TlsError> {
        let mut pem = self.certificate.to_pem()?;
        for cert in &self.chain {
            pem.extend_from_slice(&cert.to_pem()?);
        }
        pem.extend_from_slice(&self.key.private_key_to_pem_pkcs8()?);
        Ok(pem)
    }

    /// Subject common name of the leaf certificate
    pub fn common_name(&self) -> Option<String> {
        self.certificate
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub(crate) fn apply(&self, builder: &mut SslContextBuilder) -> Result<(), TlsError> {
        builder.set_certificate(&self.certificate)?;
        for cert in &self.chain {
            builder.add_extra_chain_cert(cert.clone())?;
        }
        builder.set_private_key(&self.key)?;
        Ok(())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("common_name", &self.common_name())
            .field("chain", &self.chain.len())
            .finish()
    }
}
