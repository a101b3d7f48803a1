//! OpenPGP master keys via the local `gpg` binary.
//!
//! Shelling out is the interoperability contract: key selection and the
//! armored message format match whatever the operator's gpg does. The data
//! key crosses to the child on stdin and the armored blob comes back on
//! stdout; nothing secret rides in the environment or on the command line.

use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};
use crate::keyring::{DataKey, KeyWrapProvider};
use crate::meta::Recipient;

pub struct PgpKeyWrap {
    gpg: String,
}

impl PgpKeyWrap {
    pub fn new() -> Self {
        PgpKeyWrap { gpg: "gpg".to_owned() }
    }

    pub fn with_binary(gpg: impl Into<String>) -> Self {
        PgpKeyWrap { gpg: gpg.into() }
    }

    fn run(&self, args: &[&str], input: &[u8], what: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.gpg)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ProviderError(format!("unable to run '{}': {e}", self.gpg)))?;

        {
            let mut stdin = child.stdin.take().expect("stdin is piped");
            stdin
                .write_all(input)
                .map_err(|e| Error::ProviderError(format!("{what}: writing to gpg failed: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Error::ProviderError(format!("{what}: waiting for gpg failed: {e}")))?;
        if !output.status.success() {
            return Err(Error::ProviderError(format!(
                "{what}: gpg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(Error::ProviderError(format!("{what}: gpg produced no output")));
        }
        Ok(output.stdout)
    }

    fn fingerprint(entry: &Recipient) -> Result<&str> {
        match entry {
            Recipient::Pgp { fp, .. } => Ok(fp),
            _ => Err(Error::ProviderError("not a PGP recipient entry".into())),
        }
    }
}

impl Default for PgpKeyWrap {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyWrapProvider for PgpKeyWrap {
    fn name(&self) -> &'static str {
        "pgp"
    }

    fn recognizes(&self, entry: &Recipient) -> bool {
        matches!(entry, Recipient::Pgp { fp, .. } if !fp.is_empty())
    }

    fn wrap(&self, entry: &Recipient, key: &DataKey) -> Result<String> {
        let fp = Self::fingerprint(entry)?;
        if fp.len() < 16 {
            return Err(Error::ProviderError(format!("PGP fingerprint '{fp}' is too short")));
        }
        let trusted = &fp[fp.len() - 16..];
        let armored = self.run(
            &[
                "--no-default-recipient",
                "--yes",
                "--encrypt",
                "-a",
                "-r",
                fp,
                "--trusted-key",
                trusted,
                "--no-encrypt-to",
            ],
            key.expose(),
            "pgp wrap",
        )?;
        String::from_utf8(armored)
            .map_err(|_| Error::ProviderError("gpg armor output is not UTF-8".into()))
    }

    fn unwrap(&self, entry: &Recipient, enc: &str) -> Result<DataKey> {
        Self::fingerprint(entry)?;
        let key = self.run(&["-d"], enc.as_bytes(), "pgp unwrap")?;
        DataKey::from_bytes(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_only_pgp_entries_with_a_fingerprint() {
        let provider = PgpKeyWrap::new();
        assert!(provider.recognizes(&Recipient::pgp("85D77543B3D624B63CEA9E6DBC17301B491B3F21")));
        assert!(!provider.recognizes(&Recipient::pgp("")));
        assert!(!provider.recognizes(&Recipient::kms("arn:aws:kms:us-east-1:0:key/a", None)));
    }

    #[test]
    fn short_fingerprints_cannot_wrap() {
        let provider = PgpKeyWrap::new();
        let entry = Recipient::pgp("ABC123");
        let res = provider.wrap(&entry, &DataKey::generate());
        assert!(matches!(res, Err(Error::ProviderError(_))));
    }

    #[test]
    fn missing_binary_is_a_provider_error() {
        let provider = PgpKeyWrap::with_binary("gpg-binary-that-does-not-exist");
        let entry = Recipient::pgp("85D77543B3D624B63CEA9E6DBC17301B491B3F21");
        let res = provider.unwrap(&entry, "-----BEGIN PGP MESSAGE-----");
        assert!(matches!(res, Err(Error::ProviderError(_))));
    }
}
