//! Reshare-chain signing and verification.
//!
//! A reshare chain is an ordered list of JWT-signed links. Each link
//! delegates the right to reshare or accept one offer from one organization
//! to the next. See `spec.md` §4.2 for the normative semantics; this module
//! is the Rust encoding of them.

use std::collections::HashSet;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a chain link's recipient is permitted to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Reshare,
    Accept,
}

/// Claims carried by a single signed link, as encoded in the JWT body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkClaims {
    #[serde(rename = "iss")]
    pub sharing_org_url: String,
    #[serde(rename = "sub")]
    pub recipient_org_url: String,
    pub scopes: Vec<Scope>,
    /// Offer ids (or other entitlement strings) this link authorizes.
    pub entitlements: Vec<String>,
}

/// A link after signature verification: the claims plus its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLink {
    pub claims: LinkClaims,
}

/// An encoded reshare chain: an ordered list of compact JWTs.
pub type ReshareChain = Vec<String>;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid reshare chain: {0}")]
    InvalidChain(String),
    #[error("failed to encode chain link")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

/// Requirements a verified chain must satisfy, per spec.md §4.2.
pub struct VerifyOptions<'a> {
    /// The first link's issuer must equal this org.
    pub initial_issuer: &'a str,
    /// The first link's entitlements must contain this value (the offer id).
    pub initial_entitlement: &'a str,
    /// The last link's recipient must equal this org.
    pub final_subject: &'a str,
    /// The last link must carry at least one of these scopes (ACCEPT for
    /// local acceptance, RESHARE for producing a further listing). An empty
    /// slice skips the scope check entirely.
    pub required_final_scopes: &'a [Scope],
}

/// Verifies and decodes a reshare chain. An empty chain is valid only when
/// `initial_issuer == final_subject` (the offer is locally originated and
/// the "chain" is the identity relationship); otherwise an empty chain
/// fails as `INVALID_CHAIN`.
pub trait Verifier: Send + Sync {
    fn verify_chain(
        &self,
        chain: &ReshareChain,
        opts: &VerifyOptions,
    ) -> Result<Vec<DecodedLink>, ChainError>;
}

/// Produces new signed links, appending to an existing chain.
pub trait Signer: Send + Sync {
    /// Signs a single root link: `issuer` vouching for `recipient` over
    /// `entitlements` with `scopes`.
    fn sign_root(
        &self,
        issuer: &str,
        recipient: &str,
        entitlements: &[String],
        scopes: &[Scope],
    ) -> Result<String, ChainError>;

    /// Appends one signed link to `chain`, recipient `recipient`, carrying
    /// `scopes`, preserving the root's entitlements. The new link's issuer
    /// is the previous link's recipient (or `root_issuer` if `chain` is
    /// empty, i.e. the offer is locally originated).
    fn extend_chain(
        &self,
        chain: &ReshareChain,
        root_issuer: &str,
        root_entitlements: &[String],
        recipient: &str,
        scopes: &[Scope],
    ) -> Result<ReshareChain, ChainError> {
        let issuer = match chain.last() {
            Some(link) => {
                let claims = decode_claims_unchecked(link)?;
                claims.recipient_org_url
            }
            None => root_issuer.to_string(),
        };
        let link = self.sign_root(&issuer, recipient, root_entitlements, scopes)?;
        let mut out = chain.clone();
        out.push(link);
        Ok(out)
    }
}

/// Decodes a link's claims without checking its signature. Used where the
/// caller only needs to read `sharingOrgUrl`/`recipientOrgUrl` from an
/// already-verified chain (e.g. history-viewer fan-out); never use this to
/// authorize anything.
pub fn decode_claims_unchecked(token: &str) -> Result<LinkClaims, ChainError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.set_required_spec_claims::<&str>(&[]);
    jsonwebtoken::decode::<LinkClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| ChainError::InvalidChain(format!("malformed link: {e}")))
}

/// HMAC-keyed signer/verifier. Each organization's key is looked up by the
/// caller and handed in; this type holds exactly one key pair, matching how
/// a single host signs links under its own key.
pub struct HmacChain {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl HmacChain {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }
}

impl Signer for HmacChain {
    #[tracing::instrument(skip(self, entitlements))]
    fn sign_root(
        &self,
        issuer: &str,
        recipient: &str,
        entitlements: &[String],
        scopes: &[Scope],
    ) -> Result<String, ChainError> {
        let claims = LinkClaims {
            sharing_org_url: issuer.to_string(),
            recipient_org_url: recipient.to_string(),
            scopes: scopes.to_vec(),
            entitlements: entitlements.to_vec(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(token)
    }
}

impl Verifier for HmacChain {
    #[tracing::instrument(skip(self, chain, opts))]
    fn verify_chain(
        &self,
        chain: &ReshareChain,
        opts: &VerifyOptions,
    ) -> Result<Vec<DecodedLink>, ChainError> {
        if chain.is_empty() {
            return if opts.initial_issuer == opts.final_subject {
                Ok(Vec::new())
            } else {
                Err(ChainError::InvalidChain(
                    "empty chain but issuer and final subject differ".into(),
                ))
            };
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims::<&str>(&[]);

        let mut decoded = Vec::with_capacity(chain.len());
        let mut prev_recipient: Option<String> = None;
        for (index, token) in chain.iter().enumerate() {
            let claims = jsonwebtoken::decode::<LinkClaims>(token, &self.decoding_key, &validation)
                .map_err(|e| ChainError::InvalidChain(format!("link {index}: bad signature: {e}")))?
                .claims;

            if index == 0 {
                if claims.sharing_org_url != opts.initial_issuer {
                    return Err(ChainError::InvalidChain(format!(
                        "first link issuer {} != expected {}",
                        claims.sharing_org_url, opts.initial_issuer
                    )));
                }
                if !claims
                    .entitlements
                    .iter()
                    .any(|e| e == opts.initial_entitlement)
                {
                    return Err(ChainError::InvalidChain(format!(
                        "first link entitlements do not name {}",
                        opts.initial_entitlement
                    )));
                }
            } else if Some(&claims.sharing_org_url) != prev_recipient.as_ref() {
                return Err(ChainError::InvalidChain(format!(
                    "link {index} issuer {} does not match previous recipient",
                    claims.sharing_org_url
                )));
            }

            prev_recipient = Some(claims.recipient_org_url.clone());
            decoded.push(DecodedLink { claims });
        }

        let last = decoded.last().expect("non-empty chain");
        if last.claims.recipient_org_url != opts.final_subject {
            return Err(ChainError::InvalidChain(format!(
                "last link recipient {} != expected {}",
                last.claims.recipient_org_url, opts.final_subject
            )));
        }
        if !opts.required_final_scopes.is_empty()
            && !opts
                .required_final_scopes
                .iter()
                .any(|s| last.claims.scopes.contains(s))
        {
            return Err(ChainError::InvalidChain(format!(
                "last link lacks any of the required scopes {:?}",
                opts.required_final_scopes
            )));
        }

        Ok(decoded)
    }
}

/// The set of organizations that appear as `sharingOrgUrl` anywhere in a
/// decoded chain — used by the listing policy to avoid re-listing to an
/// org that has already resharesd the offer.
pub fn shared_by(decoded: &[DecodedLink]) -> HashSet<String> {
    decoded
        .iter()
        .map(|l| l.claims.sharing_org_url.clone())
        .collect()
}
