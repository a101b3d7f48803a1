//! AWS KMS master keys.
//!
//! The wrapped form is the base64 of the `kms:Encrypt` ciphertext blob. The
//! region is extracted from the entry's ARN; an optional IAM role is assumed
//! first via STS with session name `sops@<hostname>`. The SDK is async, so
//! calls run to completion on a private current-thread runtime with a
//! per-call deadline.

use std::future::Future;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::primitives::Blob;
use base64::{engine::general_purpose, Engine as _};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::keyring::{DataKey, KeyWrapProvider};
use crate::meta::Recipient;

static KMS_ARN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^arn:aws:kms:(.+):([0-9]+):key/(.+)$").unwrap());

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Extract the region segment of a KMS key ARN.
pub fn region_of(arn: &str) -> Result<String> {
    KMS_ARN
        .captures(arn)
        .map(|caps| caps[1].to_owned())
        .ok_or_else(|| Error::ProviderError(format!("invalid KMS ARN '{arn}'")))
}

pub struct KmsKeyWrap {
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl KmsKeyWrap {
    pub fn new() -> Result<Self> {
        Self::with_timeout(CALL_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(KmsKeyWrap { runtime, timeout })
    }

    /// Drive one provider call to completion under the deadline.
    fn block_on<F>(&self, what: &str, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.runtime
            .block_on(tokio::time::timeout(self.timeout, fut))
            .map_err(|_| Error::ProviderTimeout(what.to_owned()))
    }

    fn entry_fields(entry: &Recipient) -> Result<(String, Option<String>)> {
        match entry {
            Recipient::Kms { arn, role, .. } => Ok((arn.clone(), role.clone())),
            _ => Err(Error::ProviderError("not a KMS recipient entry".into())),
        }
    }
}

async fn client_for(region: String, role: Option<String>) -> Result<aws_sdk_kms::Client> {
    let base = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region))
        .load()
        .await;

    let Some(role) = role else {
        return Ok(aws_sdk_kms::Client::new(&base));
    };

    // Temporary credentials through the entry's role first.
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned());
    let assumed = aws_sdk_sts::Client::new(&base)
        .assume_role()
        .role_arn(&role)
        .role_session_name(format!("sops@{host}"))
        .send()
        .await
        .map_err(|e| Error::ProviderError(format!("unable to assume role '{role}': {e}")))?;
    let creds = assumed
        .credentials()
        .ok_or_else(|| Error::ProviderError(format!("role '{role}' returned no credentials")))?;
    info!("assumed AWS role '{role}'");

    let provider = aws_sdk_kms::config::Credentials::new(
        creds.access_key_id(),
        creds.secret_access_key(),
        Some(creds.session_token().to_owned()),
        None,
        "svault-assume-role",
    );
    let conf = aws_sdk_kms::config::Builder::from(&base)
        .credentials_provider(provider)
        .build();
    Ok(aws_sdk_kms::Client::from_conf(conf))
}

impl KeyWrapProvider for KmsKeyWrap {
    fn name(&self) -> &'static str {
        "kms"
    }

    fn recognizes(&self, entry: &Recipient) -> bool {
        matches!(entry, Recipient::Kms { arn, .. } if !arn.is_empty())
    }

    fn wrap(&self, entry: &Recipient, key: &DataKey) -> Result<String> {
        let (arn, role) = Self::entry_fields(entry)?;
        let region = region_of(&arn)?;
        let plaintext = Blob::new(key.expose().to_vec());

        let blob = self.block_on(&arn, {
            let arn = arn.clone();
            async move {
                let client = client_for(region, role).await?;
                let resp = client
                    .encrypt()
                    .key_id(&arn)
                    .plaintext(plaintext)
                    .send()
                    .await
                    .map_err(|e| Error::ProviderError(format!("kms:Encrypt on '{arn}': {e}")))?;
                resp.ciphertext_blob()
                    .cloned()
                    .ok_or_else(|| Error::ProviderError("kms:Encrypt returned no ciphertext".into()))
            }
        })??;

        Ok(general_purpose::STANDARD.encode(blob.as_ref()))
    }

    fn unwrap(&self, entry: &Recipient, enc: &str) -> Result<DataKey> {
        let (arn, role) = Self::entry_fields(entry)?;
        let region = region_of(&arn)?;
        let raw = general_purpose::STANDARD
            .decode(enc)
            .map_err(|e| Error::ProviderError(format!("invalid base64 in KMS 'enc': {e}")))?;

        let blob = self.block_on(&arn, {
            let arn = arn.clone();
            async move {
                let client = client_for(region, role).await?;
                let resp = client
                    .decrypt()
                    .ciphertext_blob(Blob::new(raw))
                    .send()
                    .await
                    .map_err(|e| Error::ProviderError(format!("kms:Decrypt on '{arn}': {e}")))?;
                resp.plaintext()
                    .cloned()
                    .ok_or_else(|| Error::ProviderError("kms:Decrypt returned no plaintext".into()))
            }
        })??;

        DataKey::from_bytes(blob.as_ref())
    }
}
