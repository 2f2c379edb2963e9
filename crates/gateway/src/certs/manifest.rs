//! Content-addressed certificate manifests
//!
//! A [`Manifest`] describes the certificate the CA should hand out. Its
//! `description` is `<digest>:<label>`, where the digest is a SHA-256 hash
//! over every other field. The CA stores the description verbatim, which
//! makes it the search key for "has this exact certificate been issued
//! before?".
//!
//! The digest is computed once in [`ManifestBuilder::build`]. A built
//! manifest has no setters, so it cannot drift away from its digest.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use lemur_common::ManifestDigest;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Joins the digest and the human readable label
pub const DIGEST_SEPARATOR: char = ':';

/// Label for certificates requested by end users
pub const CLIENT_CERT_LABEL: &str = "Temporary Client Certificate (2 weeks)";

/// Label for the gateway's own serving certificate
pub const SERVER_CERT_LABEL: &str = "Gateway Server Certificate";

const DEFAULT_COUNTRY: &str = "US";
const DEFAULT_STATE: &str = "OR";
const DEFAULT_LOCATION: &str = "Portland";

/// Which side of a TLS connection the certificate authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CertificateUsage {
    #[default]
    Client,
    Server,
}

impl CertificateUsage {
    fn extensions(self) -> Extensions {
        Extensions {
            key_usage: KeyUsage {
                is_critical: true,
                use_digital_signature: true,
            },
            extended_key_usage: ExtendedKeyUsage {
                is_critical: true,
                client_auth: self == Self::Client,
                server_auth: self == Self::Server,
            },
            subject_key_identifier: SubjectKeyIdentifier {
                is_critical: false,
                include_ski: true,
            },
        }
    }

    fn default_label(self) -> &'static str {
        match self {
            Self::Client => CLIENT_CERT_LABEL,
            Self::Server => SERVER_CERT_LABEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authority {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUsage {
    pub is_critical: bool,
    pub use_digital_signature: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedKeyUsage {
    pub is_critical: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub client_auth: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub server_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectKeyIdentifier {
    pub is_critical: bool,
    #[serde(rename = "includeSKI")]
    pub include_ski: bool,
}

/// X.509 extension policy sent to the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    pub key_usage: KeyUsage,
    pub extended_key_usage: ExtendedKeyUsage,
    pub subject_key_identifier: SubjectKeyIdentifier,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A frozen, digest-stamped certificate request.
///
/// Serializes to the body the CA's create endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    authority: Authority,
    common_name: String,
    owner: String,
    validity_start: String,
    validity_end: String,
    description: String,
    country: String,
    state: String,
    location: String,
    organization: String,
    organizational_unit: String,
    active: bool,
    extensions: Extensions,
    #[serde(skip)]
    digest: ManifestDigest,
    #[serde(skip)]
    usage: CertificateUsage,
}

impl Manifest {
    /// Build a client certificate manifest.
    ///
    /// `organization` is used for both the organization and the
    /// organizational unit.
    pub fn new(
        authority: impl Into<String>,
        common_name: impl Into<String>,
        owner: impl Into<String>,
        validity_start: impl Into<String>,
        validity_end: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        ManifestBuilder::new(authority, common_name, owner)
            .validity(validity_start, validity_end)
            .organization(organization)
            .build()
    }

    pub fn builder(
        authority: impl Into<String>,
        common_name: impl Into<String>,
        owner: impl Into<String>,
    ) -> ManifestBuilder {
        ManifestBuilder::new(authority, common_name, owner)
    }

    pub fn authority(&self) -> &str {
        &self.authority.name
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn validity_start(&self) -> &str {
        &self.validity_start
    }

    pub fn validity_end(&self) -> &str {
        &self.validity_end
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn organizational_unit(&self) -> &str {
        &self.organizational_unit
    }

    pub fn usage(&self) -> CertificateUsage {
        self.usage
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// `<digest>:<label>`, the value the CA is searched by
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn digest(&self) -> &ManifestDigest {
        &self.digest
    }

    /// The human readable part of the description
    pub fn label(&self) -> &str {
        // The digest is base64 and never contains the separator.
        let skip = self.digest.as_str().len() + DIGEST_SEPARATOR.len_utf8();
        self.description.get(skip..).unwrap_or_default()
    }
}

/// Collects manifest fields; [`build`](Self::build) stamps the digest.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    authority: String,
    common_name: String,
    owner: String,
    validity_start: String,
    validity_end: String,
    organization: String,
    organizational_unit: Option<String>,
    label: Option<String>,
    usage: CertificateUsage,
}

impl ManifestBuilder {
    pub fn new(
        authority: impl Into<String>,
        common_name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            common_name: common_name.into(),
            owner: owner.into(),
            validity_start: String::new(),
            validity_end: String::new(),
            organization: String::new(),
            organizational_unit: None,
            label: None,
            usage: CertificateUsage::Client,
        }
    }

    /// Validity window as `YYYY-MM-DD` dates
    pub fn validity(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.validity_start = start.into();
        self.validity_end = end.into();
        self
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    /// Defaults to the organization
    pub fn organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }

    /// Defaults to a label matching the usage
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn usage(mut self, usage: CertificateUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn build(self) -> Manifest {
        let label = self
            .label
            .unwrap_or_else(|| self.usage.default_label().to_string());
        let organizational_unit = self
            .organizational_unit
            .unwrap_or_else(|| self.organization.clone());

        let mut manifest = Manifest {
            authority: Authority {
                name: self.authority,
            },
            common_name: self.common_name,
            owner: self.owner,
            validity_start: self.validity_start,
            validity_end: self.validity_end,
            description: String::new(),
            country: DEFAULT_COUNTRY.to_string(),
            state: DEFAULT_STATE.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            organization: self.organization,
            organizational_unit,
            active: true,
            extensions: self.usage.extensions(),
            digest: ManifestDigest::new(String::new()),
            usage: self.usage,
        };

        let digest = compute_digest(&manifest);
        manifest.description = format!("{}{}{}", digest, DIGEST_SEPARATOR, label);
        manifest.digest = digest;
        manifest
    }
}

/// Length-prefixed `name`/`value` pairs in a fixed order. Every field but
/// the description is covered.
fn compute_digest(manifest: &Manifest) -> ManifestDigest {
    let mut encoder = CanonicalEncoder::default();
    let ext = &manifest.extensions;

    encoder.field("authority.name", manifest.authority.name.as_bytes());
    encoder.field("commonName", manifest.common_name.as_bytes());
    encoder.field("owner", manifest.owner.as_bytes());
    encoder.field("validityStart", manifest.validity_start.as_bytes());
    encoder.field("validityEnd", manifest.validity_end.as_bytes());
    encoder.field("country", manifest.country.as_bytes());
    encoder.field("state", manifest.state.as_bytes());
    encoder.field("location", manifest.location.as_bytes());
    encoder.field("organization", manifest.organization.as_bytes());
    encoder.field("organizationalUnit", manifest.organizational_unit.as_bytes());
    encoder.flag("active", manifest.active);
    encoder.flag("keyUsage.isCritical", ext.key_usage.is_critical);
    encoder.flag(
        "keyUsage.useDigitalSignature",
        ext.key_usage.use_digital_signature,
    );
    encoder.flag("extendedKeyUsage.isCritical", ext.extended_key_usage.is_critical);
    encoder.flag("extendedKeyUsage.clientAuth", ext.extended_key_usage.client_auth);
    encoder.flag("extendedKeyUsage.serverAuth", ext.extended_key_usage.server_auth);
    encoder.flag(
        "subjectKeyIdentifier.isCritical",
        ext.subject_key_identifier.is_critical,
    );
    encoder.flag(
        "subjectKeyIdentifier.includeSKI",
        ext.subject_key_identifier.include_ski,
    );

    ManifestDigest::new(URL_SAFE.encode(encoder.finish()))
}

#[derive(Default)]
struct CanonicalEncoder {
    hasher: Sha256,
}

impl CanonicalEncoder {
    fn field(&mut self, name: &str, value: &[u8]) {
        self.hasher.update((name.len() as u64).to_be_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value);
    }

    fn flag(&mut self, name: &str, value: bool) {
        self.field(name, &[u8::from(value)]);
    }

    fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}
