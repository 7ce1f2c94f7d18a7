// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! CMS signature verification.

The signature slot of an embedded signature holds a CMS `SignedData` whose
detached content is the slot 0 code directory. Verifying it involves two
collaborators:

* A [SignatureDecoder] parses the CMS structure, checks the signer's
  message digest and signature over the detached content and extracts the
  certificates, signing time, timestamp and hash agility attribute.
* A [TrustEvaluator] builds and evaluates a certificate chain under a
  [VerificationPolicy].

[verify_signature] drives both and applies the code signing specific
policy on top: ad-hoc signatures need no CMS, the hash agility list must
match the directories present, expired certificates are tolerated when no
timestamp vouches for the signing time, team identifiers must match
developer certificates, and a timestamp must chain to the same vendor root
as the signature.
*/

use {
    crate::{
        directories::CodeDirectoryMap,
        error::{CodeValidationError, Result, ValidationStatus},
        flags::ValidationFlags,
    },
    bcder::{ConstOid, Oid, OctetString},
    chrono::{DateTime, Utc},
    cryptographic_message_syntax::{asn1::rfc3161::TstInfo, SignedData, SignerInfo},
    log::{debug, warn},
    std::fmt::Debug,
    x509_certificate::{asn1time::Time, rfc5280, CapturedX509Certificate, X509Certificate},
};

/// Signed attribute holding a plist of the cdhashes of all code directories.
///
/// 1.2.840.113635.100.9.1
const OID_CDHASH_PLIST: ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 1]);

/// Certificate extension marking iPhone developer certificates.
///
/// 1.2.840.113635.100.6.1.2
const OID_EXTENSION_IPHONE_DEVELOPER: ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1, 2]);

/// Certificate extension marking Mac developer certificates.
///
/// 1.2.840.113635.100.6.1.12
const OID_EXTENSION_MAC_DEVELOPER: ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1, 12]);

/// Certificate extension marking Developer ID application certificates.
///
/// 1.2.840.113635.100.6.1.13
const OID_EXTENSION_DEVELOPER_ID_APPLICATION: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1, 13]);

/// Maximum chain length the default evaluator will build.
const MAX_CHAIN_LENGTH: usize = 16;

/// Content extracted from a verified CMS signature.
#[derive(Clone, Debug, Default)]
pub struct DecodedSignature {
    /// Certificates carried by the signature, signer first.
    pub certificates: Vec<CapturedX509Certificate>,
    /// Signing time claimed by the signer.
    pub signing_time: Option<DateTime<Utc>>,
    /// Time certified by a timestamp authority.
    pub timestamp: Option<DateTime<Utc>>,
    /// Certificates of the timestamp token, timestamp signer first.
    pub timestamp_certificates: Vec<CapturedX509Certificate>,
    /// Content of the hash agility attribute, when present.
    pub cdhashes: Option<Vec<Vec<u8>>>,
}

/// Parses and cryptographically verifies a CMS signature.
pub trait SignatureDecoder: Debug + Send + Sync {
    /// Decode `signature` over `detached_content`.
    ///
    /// A signer whose digest or signature does not verify is a
    /// [ValidationStatus::SignatureFailed] error.
    fn decode(&self, signature: &[u8], detached_content: &[u8]) -> Result<DecodedSignature>;
}

/// Parameters of a trust evaluation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VerificationPolicy {
    /// Evaluate under the software signing policy instead of code signing.
    pub software_signing: bool,
    pub network_allowed: bool,
    pub enforce_revocation: bool,
    /// Require the chain to end at a configured anchor.
    pub check_anchors: bool,
    /// Tolerate certificates outside their validity window.
    pub allow_expired: bool,
    /// Time to evaluate validity at. `None` means now.
    pub verify_time: Option<DateTime<Utc>>,
}

impl VerificationPolicy {
    /// Derive a policy from validation flags.
    ///
    /// Network access is allowed unless forbidden. An explicit allowance
    /// overrides a prohibition.
    pub fn from_flags(flags: ValidationFlags) -> Self {
        Self {
            software_signing: flags.contains(ValidationFlags::USE_SOFTWARE_SIGNING_CERT),
            network_allowed: flags.contains(ValidationFlags::ALLOW_NETWORK_ACCESS)
                || !flags.contains(ValidationFlags::NO_NETWORK_ACCESS),
            enforce_revocation: flags.contains(ValidationFlags::ENFORCE_REVOCATION_CHECKS),
            check_anchors: flags.contains(ValidationFlags::CHECK_TRUSTED_ANCHORS),
            allow_expired: false,
            verify_time: None,
        }
    }
}

/// Verdict of a trust evaluation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrustResult {
    Proceed,
    /// Trust settings explicitly deny the chain.
    Deny,
    /// Evaluation failed with a status.
    Failed(ValidationStatus),
}

/// Outcome of a trust evaluation.
#[derive(Clone, Debug)]
pub struct TrustEvaluation {
    /// The evaluated chain, leaf first.
    pub chain: Vec<CapturedX509Certificate>,
    pub result: TrustResult,
}

/// Evaluates certificate chains.
pub trait TrustEvaluator: Debug + Send + Sync {
    /// Build and evaluate a chain from `certificates`, the first being the leaf.
    fn evaluate(
        &self,
        certificates: &[CapturedX509Certificate],
        policy: &VerificationPolicy,
    ) -> Result<TrustEvaluation>;

    /// Whether a certificate is a root of the platform vendor.
    fn is_vendor_anchor(&self, cert: &CapturedX509Certificate) -> bool;

    /// Whether a chain ends at a vendor root.
    fn chain_is_vendor_anchored(&self, chain: &[CapturedX509Certificate]) -> bool {
        chain
            .last()
            .map(|root| self.is_vendor_anchor(root))
            .unwrap_or(false)
    }
}

fn signer_failed(message: impl ToString) -> CodeValidationError {
    CodeValidationError::detailed(ValidationStatus::SignatureFailed, message)
}

fn malformed(message: impl ToString) -> CodeValidationError {
    CodeValidationError::detailed(ValidationStatus::SignatureInvalid, message)
}

/// Order certificates so the one identified by the signer comes first.
fn signer_first(
    signer: &SignerInfo,
    certificates: impl Iterator<Item = CapturedX509Certificate>,
) -> Vec<CapturedX509Certificate> {
    let mut certificates = certificates.collect::<Vec<_>>();

    if let Some((issuer, serial)) = signer.certificate_issuer_and_serial() {
        if let Some(pos) = certificates
            .iter()
            .position(|cert| cert.issuer_name() == issuer && cert.serial_number_asn1() == serial)
        {
            let leaf = certificates.remove(pos);
            certificates.insert(0, leaf);
        }
    }

    certificates
}

/// Parse the plist value of the hash agility attribute.
pub fn parse_cdhashes_plist(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let value = plist::Value::from_reader(std::io::Cursor::new(data))?;

    let hashes = value
        .as_dictionary()
        .and_then(|dict| dict.get("cdhashes"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| signer_failed("hash agility attribute lacks a cdhashes array"))?;

    hashes
        .iter()
        .map(|v| {
            v.as_data()
                .map(|d| d.to_vec())
                .ok_or_else(|| signer_failed("cdhashes entry is not data"))
        })
        .collect()
}

fn hash_agility(signer: &SignerInfo) -> Result<Option<Vec<Vec<u8>>>> {
    let attributes = match signer.signed_attributes() {
        Some(attributes) => attributes,
        None => return Ok(None),
    };

    for attr in attributes.attributes().iter() {
        if attr.typ.as_ref() != OID_CDHASH_PLIST.as_ref() {
            continue;
        }

        let value = attr
            .values
            .first()
            .ok_or_else(|| malformed("hash agility attribute has no value"))?;

        let data = (**value)
            .clone()
            .decode(|cons| OctetString::take_from(cons))
            .map_err(|e| malformed(format!("hash agility attribute is malformed: {}", e)))?;

        return Ok(Some(parse_cdhashes_plist(&data.to_bytes())?));
    }

    Ok(None)
}

/// Extract and verify the timestamp token of a signer.
fn timestamp(
    signer: &SignerInfo,
) -> Result<Option<(DateTime<Utc>, Vec<CapturedX509Certificate>)>> {
    let token = match signer.time_stamp_token_signed_data()? {
        Some(token) => token,
        None => return Ok(None),
    };

    signer
        .verify_time_stamp_token()
        .map_err(|e| signer_failed(format!("timestamp token does not verify: {}", e)))?;

    let content = token
        .signed_content()
        .ok_or_else(|| malformed("timestamp token has no content"))?;

    let tst_info = bcder::decode::Constructed::decode(content, bcder::Mode::Der, |cons| {
        TstInfo::take_from(cons)
    })
    .map_err(|e| malformed(format!("timestamp token info is malformed: {}", e)))?;

    let certificates = match token.signers().next() {
        Some(tsa) => signer_first(tsa, token.certificates().cloned()),
        None => token.certificates().cloned().collect(),
    };

    Ok(Some((tst_info.gen_time.into(), certificates)))
}

/// Decodes signatures with the `cryptographic-message-syntax` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct CmsSignatureDecoder;

impl SignatureDecoder for CmsSignatureDecoder {
    fn decode(&self, signature: &[u8], detached_content: &[u8]) -> Result<DecodedSignature> {
        let signed_data = SignedData::parse_ber(signature)
            .map_err(|e| malformed(format!("CMS signature does not parse: {}", e)))?;

        let signers = signed_data.signers().collect::<Vec<_>>();
        let signer = match signers.as_slice() {
            [signer] => *signer,
            _ => {
                return Err(signer_failed(format!(
                    "expected exactly one signer; found {}",
                    signers.len()
                )))
            }
        };

        signer
            .verify_message_digest_with_content(detached_content)
            .map_err(|e| signer_failed(format!("message digest does not verify: {}", e)))?;

        let signed_content = signer.signed_content(Some(detached_content));
        signer
            .verify_signature_with_signed_data_and_content(&signed_data, &signed_content)
            .map_err(|e| signer_failed(format!("signature does not verify: {}", e)))?;

        let signing_time = signer
            .signed_attributes()
            .and_then(|attrs| attrs.signing_time())
            .copied();

        let (timestamp, timestamp_certificates) = match timestamp(signer)? {
            Some((time, certs)) => (Some(time), certs),
            None => (None, vec![]),
        };

        Ok(DecodedSignature {
            certificates: signer_first(signer, signed_data.certificates().cloned()),
            signing_time,
            timestamp,
            timestamp_certificates,
            cdhashes: hash_agility(signer)?,
        })
    }
}

fn to_datetime(time: &Time) -> DateTime<Utc> {
    match time {
        Time::UtcTime(t) => **t,
        Time::GeneralTime(t) => t.clone().into(),
    }
}

fn tbs(cert: &CapturedX509Certificate) -> &rfc5280::Certificate {
    let x509: &X509Certificate = cert.as_ref();
    x509.as_ref()
}

fn same_certificate(a: &CapturedX509Certificate, b: &CapturedX509Certificate) -> bool {
    a.constructed_data() == b.constructed_data()
}

fn has_extension(cert: &CapturedX509Certificate, oid: &ConstOid) -> bool {
    tbs(cert)
        .iter_extensions()
        .any(|extension| extension.id.as_ref() == oid.as_ref())
}

/// Whether a leaf certificate was issued to a developer.
pub fn is_developer_certificate(cert: &CapturedX509Certificate) -> bool {
    [
        &OID_EXTENSION_IPHONE_DEVELOPER,
        &OID_EXTENSION_MAC_DEVELOPER,
        &OID_EXTENSION_DEVELOPER_ID_APPLICATION,
    ]
    .into_iter()
    .any(|oid| has_extension(cert, oid))
}

/// Subject organizational unit of a certificate.
pub fn organizational_unit(cert: &CapturedX509Certificate) -> Option<String> {
    cert.subject_name()
        .find_first_attribute_string(Oid(
            x509_certificate::rfc4519::OID_ORGANIZATIONAL_UNIT_NAME
                .as_ref()
                .into(),
        ))
        .unwrap_or(None)
}

/// Trust evaluation against in-memory anchor sets.
///
/// Chains are built by matching issuer to subject names and verifying each
/// link's signature. Validity windows are checked at the policy's time.
/// Revocation is not evaluated.
#[derive(Clone, Debug, Default)]
pub struct X509TrustEvaluator {
    anchors: Vec<CapturedX509Certificate>,
    vendor_anchors: Vec<CapturedX509Certificate>,
    denied: Vec<CapturedX509Certificate>,
}

impl X509TrustEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust a root certificate.
    pub fn add_anchor(&mut self, cert: CapturedX509Certificate) {
        self.anchors.push(cert);
    }

    /// Trust a root certificate of the platform vendor.
    pub fn add_vendor_anchor(&mut self, cert: CapturedX509Certificate) {
        self.vendor_anchors.push(cert);
    }

    /// Deny any chain containing a certificate.
    pub fn add_denied(&mut self, cert: CapturedX509Certificate) {
        self.denied.push(cert);
    }

    /// Add PEM encoded vendor anchors.
    pub fn add_vendor_anchors_pem(&mut self, data: &[u8]) -> Result<()> {
        self.vendor_anchors
            .extend(CapturedX509Certificate::from_pem_multiple(data)?);

        Ok(())
    }

    fn is_anchor(&self, cert: &CapturedX509Certificate) -> bool {
        self.anchors
            .iter()
            .chain(self.vendor_anchors.iter())
            .any(|anchor| same_certificate(anchor, cert))
    }

    fn build_chain(&self, certificates: &[CapturedX509Certificate]) -> Vec<CapturedX509Certificate> {
        let mut chain = match certificates.first() {
            Some(leaf) => vec![leaf.clone()],
            None => return vec![],
        };

        while chain.len() < MAX_CHAIN_LENGTH {
            let current = &chain[chain.len() - 1];

            if current.subject_is_issuer() || self.is_anchor(current) {
                break;
            }

            let issuer = certificates[1..]
                .iter()
                .chain(self.anchors.iter())
                .chain(self.vendor_anchors.iter())
                .find(|candidate| {
                    candidate.subject_name() == current.issuer_name()
                        && !chain.iter().any(|c| same_certificate(c, candidate))
                        && current.verify_signed_by_certificate(*candidate).is_ok()
                });

            match issuer {
                Some(issuer) => chain.push(issuer.clone()),
                None => break,
            }
        }

        chain
    }
}

impl TrustEvaluator for X509TrustEvaluator {
    fn evaluate(
        &self,
        certificates: &[CapturedX509Certificate],
        policy: &VerificationPolicy,
    ) -> Result<TrustEvaluation> {
        let chain = self.build_chain(certificates);

        if chain.is_empty() {
            return Ok(TrustEvaluation {
                chain,
                result: TrustResult::Failed(ValidationStatus::SignatureUntrusted),
            });
        }

        if policy.enforce_revocation {
            debug!("revocation status is not evaluated for in-memory anchors");
        }

        if chain
            .iter()
            .any(|cert| self.denied.iter().any(|d| same_certificate(d, cert)))
        {
            return Ok(TrustEvaluation {
                chain,
                result: TrustResult::Deny,
            });
        }

        if !policy.allow_expired {
            let now = policy.verify_time.unwrap_or_else(Utc::now);

            for cert in &chain {
                let validity = &tbs(cert).tbs_certificate.validity;

                if to_datetime(&validity.not_before) > now {
                    return Ok(TrustEvaluation {
                        chain,
                        result: TrustResult::Failed(ValidationStatus::CertNotYetValid),
                    });
                }
                if to_datetime(&validity.not_after) < now {
                    return Ok(TrustEvaluation {
                        chain,
                        result: TrustResult::Failed(ValidationStatus::CertExpired),
                    });
                }
            }
        }

        let root = &chain[chain.len() - 1];
        if policy.check_anchors && !self.is_anchor(root) {
            return Ok(TrustEvaluation {
                chain,
                result: TrustResult::Failed(ValidationStatus::CertUntrusted),
            });
        }

        Ok(TrustEvaluation {
            chain,
            result: TrustResult::Proceed,
        })
    }

    fn is_vendor_anchor(&self, cert: &CapturedX509Certificate) -> bool {
        self.vendor_anchors
            .iter()
            .any(|anchor| same_certificate(anchor, cert))
    }
}

/// Result of a successful signature verification.
#[derive(Clone, Debug, Default)]
pub struct SignatureVerification {
    /// Trust only succeeded after tolerating certificate validity windows.
    pub expired: bool,
    /// The evaluated chain, leaf first.
    pub chain: Vec<CapturedX509Certificate>,
    /// The chain ends at a vendor root.
    pub vendor_anchored: bool,
    pub signing_time: Option<DateTime<Utc>>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Verify the CMS signature binding a set of code directories.
///
/// Returns `Ok(None)` for ad-hoc signatures, which carry no CMS.
pub fn verify_signature(
    directories: &CodeDirectoryMap,
    signature: Option<&[u8]>,
    flags: ValidationFlags,
    decoder: &dyn SignatureDecoder,
    trust: &dyn TrustEvaluator,
) -> Result<Option<SignatureVerification>> {
    let canonical = directories.canonical();

    if canonical.is_adhoc() {
        debug!("{} is ad-hoc signed", canonical.identifier());
        return Ok(None);
    }

    let signature = signature.ok_or(ValidationStatus::Unsigned)?;

    let decoded = decoder.decode(signature, directories.base().raw())?;

    if let Some(listed) = &decoded.cdhashes {
        if listed != &directories.cdhashes()? {
            return Err(signer_failed(
                "hash agility attribute does not match code directories",
            ));
        }
    }

    let mut policy = VerificationPolicy::from_flags(flags);
    policy.verify_time = decoded.timestamp;

    let evaluation = loop {
        let evaluation = trust.evaluate(&decoded.certificates, &policy)?;

        if let Some(team) = canonical.team_identifier() {
            if let Some(leaf) = evaluation.chain.first() {
                if trust.chain_is_vendor_anchored(&evaluation.chain)
                    && is_developer_certificate(leaf)
                {
                    if let Some(ou) = organizational_unit(leaf) {
                        if ou != team {
                            return Err(CodeValidationError::detailed(
                                ValidationStatus::BadTeamIdentifier,
                                format!(
                                    "certificate team {} does not match code directory team {}",
                                    ou, team
                                ),
                            ));
                        }
                    }
                }
            }
        }

        match evaluation.result {
            TrustResult::Proceed => break evaluation,
            TrustResult::Deny => return Err(ValidationStatus::TrustDenied.into()),
            TrustResult::Failed(status)
                if decoded.timestamp.is_none()
                    && status.is_certificate_validity()
                    && !policy.allow_expired =>
            {
                warn!("signing certificate validity: {}; retrying tolerating it", status);
                policy.allow_expired = true;
            }
            TrustResult::Failed(status) => return Err(status.into()),
        }
    };

    let vendor_anchored = trust.chain_is_vendor_anchored(&evaluation.chain);

    if decoded.timestamp.is_some() && vendor_anchored {
        let timestamp_chain = trust
            .evaluate(
                &decoded.timestamp_certificates,
                &VerificationPolicy {
                    allow_expired: true,
                    ..policy.clone()
                },
            )?
            .chain;

        if !trust.chain_is_vendor_anchored(&timestamp_chain) {
            return Err(CodeValidationError::detailed(
                ValidationStatus::CertUntrusted,
                "timestamp is not anchored by the signature's root",
            ));
        }
    }

    Ok(Some(SignatureVerification {
        expired: policy.allow_expired,
        chain: evaluation.chain,
        vendor_anchored,
        signing_time: decoded.signing_time,
        timestamp: decoded.timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            code_directory::{fixture_code_directory, CodeSignatureFlags},
            embedded_signature::{CodeSigningSlot, DigestType},
        },
        std::sync::Mutex,
        x509_certificate::{KeyAlgorithm, X509CertificateBuilder},
    };

    fn directories(flags: CodeSignatureFlags, team: Option<&str>) -> CodeDirectoryMap {
        let cd = fixture_code_directory(
            DigestType::Sha256,
            "com.example.signed",
            team,
            0,
            b"code",
            &[],
            flags,
        );

        CodeDirectoryMap::load(|slot| {
            Ok(if slot == CodeSigningSlot::CodeDirectory {
                Some(cd.clone())
            } else {
                None
            })
        })
        .unwrap()
        .unwrap()
    }

    fn certificate(ou: &str, developer: bool, hours: i64) -> CapturedX509Certificate {
        let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ed25519);
        builder
            .subject()
            .append_common_name_utf8_string("Test Developer")
            .unwrap();
        builder
            .subject()
            .append_organizational_unit_utf8_string(ou)
            .unwrap();
        if developer {
            builder.add_extension_der_data(
                Oid(OID_EXTENSION_MAC_DEVELOPER.as_ref().into()),
                true,
                [0x05u8, 0x00].as_ref(),
            );
        }
        builder.validity_duration(chrono::Duration::hours(hours));

        builder.create_with_random_keypair().unwrap().0
    }

    #[derive(Debug)]
    struct FixedDecoder(DecodedSignature);

    impl SignatureDecoder for FixedDecoder {
        fn decode(&self, _: &[u8], _: &[u8]) -> Result<DecodedSignature> {
            Ok(self.0.clone())
        }
    }

    /// Replays scripted results and records the policies it saw.
    #[derive(Debug, Default)]
    struct ScriptedTrust {
        results: Mutex<Vec<TrustResult>>,
        policies: Mutex<Vec<VerificationPolicy>>,
        vendor: bool,
    }

    impl ScriptedTrust {
        fn new(results: Vec<TrustResult>, vendor: bool) -> Self {
            Self {
                results: Mutex::new(results),
                policies: Mutex::new(vec![]),
                vendor,
            }
        }
    }

    impl TrustEvaluator for ScriptedTrust {
        fn evaluate(
            &self,
            certificates: &[CapturedX509Certificate],
            policy: &VerificationPolicy,
        ) -> Result<TrustEvaluation> {
            self.policies.lock().unwrap().push(policy.clone());
            let mut results = self.results.lock().unwrap();
            let result = if results.is_empty() {
                TrustResult::Proceed
            } else {
                results.remove(0)
            };

            Ok(TrustEvaluation {
                chain: certificates.to_vec(),
                result,
            })
        }

        fn is_vendor_anchor(&self, _: &CapturedX509Certificate) -> bool {
            self.vendor
        }
    }

    #[test]
    fn policy_network_access() {
        assert!(VerificationPolicy::from_flags(ValidationFlags::empty()).network_allowed);
        assert!(
            !VerificationPolicy::from_flags(ValidationFlags::NO_NETWORK_ACCESS).network_allowed
        );
        assert!(
            VerificationPolicy::from_flags(
                ValidationFlags::NO_NETWORK_ACCESS | ValidationFlags::ALLOW_NETWORK_ACCESS
            )
            .network_allowed
        );

        let policy = VerificationPolicy::from_flags(
            ValidationFlags::USE_SOFTWARE_SIGNING_CERT | ValidationFlags::CHECK_TRUSTED_ANCHORS,
        );
        assert!(policy.software_signing);
        assert!(policy.check_anchors);
        assert!(!policy.enforce_revocation);
    }

    #[test]
    fn adhoc_needs_no_cms() {
        let dirs = directories(CodeSignatureFlags::ADHOC, None);
        let decoder = FixedDecoder(DecodedSignature::default());
        let trust = ScriptedTrust::new(vec![], false);

        assert!(verify_signature(&dirs, None, ValidationFlags::empty(), &decoder, &trust)
            .unwrap()
            .is_none());
        assert!(trust.policies.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_signature_is_unsigned() {
        let dirs = directories(CodeSignatureFlags::empty(), None);
        let decoder = FixedDecoder(DecodedSignature::default());
        let trust = ScriptedTrust::new(vec![], false);

        let err = verify_signature(&dirs, None, ValidationFlags::empty(), &decoder, &trust)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::Unsigned);
    }

    #[test]
    fn hash_agility_must_match() {
        let dirs = directories(CodeSignatureFlags::empty(), None);
        let trust = ScriptedTrust::new(vec![], false);

        let decoder = FixedDecoder(DecodedSignature {
            cdhashes: Some(vec![vec![0; 20]]),
            ..Default::default()
        });
        let err = verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::SignatureFailed);

        let decoder = FixedDecoder(DecodedSignature {
            cdhashes: Some(dirs.cdhashes().unwrap()),
            ..Default::default()
        });
        verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
            .unwrap()
            .unwrap();
    }

    #[test]
    fn expired_retried_without_timestamp() {
        let dirs = directories(CodeSignatureFlags::empty(), None);
        let decoder = FixedDecoder(DecodedSignature::default());
        let trust = ScriptedTrust::new(
            vec![TrustResult::Failed(ValidationStatus::CertExpired)],
            false,
        );

        let verification =
            verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
                .unwrap()
                .unwrap();
        assert!(verification.expired);

        let policies = trust.policies.lock().unwrap();
        assert_eq!(policies.len(), 2);
        assert!(!policies[0].allow_expired);
        assert!(policies[1].allow_expired);
    }

    #[test]
    fn expired_fatal_with_timestamp() {
        let dirs = directories(CodeSignatureFlags::empty(), None);
        let decoder = FixedDecoder(DecodedSignature {
            timestamp: Some(Utc::now()),
            ..Default::default()
        });
        let trust = ScriptedTrust::new(
            vec![TrustResult::Failed(ValidationStatus::CertExpired)],
            false,
        );

        let err = verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::CertExpired);
    }

    #[test]
    fn deny_is_trust_denied() {
        let dirs = directories(CodeSignatureFlags::empty(), None);
        let decoder = FixedDecoder(DecodedSignature::default());
        let trust = ScriptedTrust::new(vec![TrustResult::Deny], false);

        let err = verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::TrustDenied);
    }

    #[test]
    fn team_identifier_checked_for_developer_certificates() {
        let dirs = directories(CodeSignatureFlags::empty(), Some("TEAM000001"));

        let decoder = FixedDecoder(DecodedSignature {
            certificates: vec![certificate("TEAM000002", true, 1)],
            ..Default::default()
        });

        let trust = ScriptedTrust::new(vec![], true);
        let err = verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::BadTeamIdentifier);

        // Not anchored by the vendor: no team binding.
        let trust = ScriptedTrust::new(vec![], false);
        verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
            .unwrap()
            .unwrap();

        let decoder = FixedDecoder(DecodedSignature {
            certificates: vec![certificate("TEAM000001", true, 1)],
            ..Default::default()
        });
        let trust = ScriptedTrust::new(vec![], true);
        let verification =
            verify_signature(&dirs, Some(b"cms"), ValidationFlags::empty(), &decoder, &trust)
                .unwrap()
                .unwrap();
        assert!(verification.vendor_anchored);
    }

    #[test]
    fn x509_evaluator_windows_and_anchors() {
        let cert = certificate("TEAM000001", false, 1);
        let mut evaluator = X509TrustEvaluator::new();

        let policy = VerificationPolicy {
            check_anchors: true,
            ..Default::default()
        };
        let evaluation = evaluator.evaluate(&[cert.clone()], &policy).unwrap();
        assert_eq!(
            evaluation.result,
            TrustResult::Failed(ValidationStatus::CertUntrusted)
        );

        // Implicit anchors.
        let evaluation = evaluator
            .evaluate(&[cert.clone()], &VerificationPolicy::default())
            .unwrap();
        assert_eq!(evaluation.result, TrustResult::Proceed);

        evaluator.add_vendor_anchor(cert.clone());
        let evaluation = evaluator.evaluate(&[cert.clone()], &policy).unwrap();
        assert_eq!(evaluation.result, TrustResult::Proceed);
        assert!(evaluator.chain_is_vendor_anchored(&evaluation.chain));

        let later = VerificationPolicy {
            verify_time: Some(Utc::now() + chrono::Duration::hours(3)),
            ..policy.clone()
        };
        let evaluation = evaluator.evaluate(&[cert.clone()], &later).unwrap();
        assert_eq!(
            evaluation.result,
            TrustResult::Failed(ValidationStatus::CertExpired)
        );

        let tolerant = VerificationPolicy {
            allow_expired: true,
            ..later
        };
        let evaluation = evaluator.evaluate(&[cert.clone()], &tolerant).unwrap();
        assert_eq!(evaluation.result, TrustResult::Proceed);

        let earlier = VerificationPolicy {
            verify_time: Some(Utc::now() - chrono::Duration::hours(3)),
            ..policy.clone()
        };
        let evaluation = evaluator.evaluate(&[cert.clone()], &earlier).unwrap();
        assert_eq!(
            evaluation.result,
            TrustResult::Failed(ValidationStatus::CertNotYetValid)
        );

        evaluator.add_denied(cert.clone());
        let evaluation = evaluator.evaluate(&[cert], &policy).unwrap();
        assert_eq!(evaluation.result, TrustResult::Deny);
    }

    #[test]
    fn certificate_properties() {
        let dev = certificate("TEAM000001", true, 1);
        assert!(is_developer_certificate(&dev));
        assert_eq!(organizational_unit(&dev), Some("TEAM000001".into()));

        assert!(!is_developer_certificate(&certificate("TEAM000001", false, 1)));
    }

    #[test]
    fn cdhashes_plist() {
        let plist = indoc::indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <dict>
                <key>cdhashes</key>
                <array>
                    <data>AAECAwQ=</data>
                </array>
            </dict>
            </plist>
        "#};

        assert_eq!(
            parse_cdhashes_plist(plist.as_bytes()).unwrap(),
            vec![vec![0, 1, 2, 3, 4]]
        );

        let err = parse_cdhashes_plist(b"<plist version=\"1.0\"><dict/></plist>").unwrap_err();
        assert_eq!(err.status(), ValidationStatus::SignatureFailed);
    }

    #[test]
    fn cms_garbage_is_invalid() {
        let err = CmsSignatureDecoder.decode(b"not cms", b"content").unwrap_err();
        assert_eq!(err.status(), ValidationStatus::SignatureInvalid);
    }
}
