use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use svault_core::{
    decrypt_document, encrypt_document, security, session_timestamp, DataKey, Error, FileType,
    KeyRing, Metadata, Node, StashNode, Value,
};

const DESC: &str = "\
svault supports AWS KMS and PGP master keys:
  * To encrypt or decrypt a document with AWS KMS, specify the KMS ARN
    in the `-k` flag or in the SOPS_KMS_ARN environment variable.
    (you need valid credentials in ~/.aws/credentials or in your env)
  * To encrypt or decrypt using PGP, specify the PGP fingerprint in the
    `-p` flag or in the SOPS_PGP_FP environment variable.

To use multiple KMS or PGP keys, separate them by commas.

The -p and -k flags are ignored if the document already contains master
keys. To add or remove master keys in existing documents, open them with -s
and edit the `sops` branch directly.

By default, editing is done in vim, and will use the $EDITOR env if set.";

const DEFAULT_YAML: &str = "\
# Welcome to svault. This is the default template.
# Remove these lines and add your data.
# Don't modify the `sops` section, it contains key material.
example_key: example_value
example_array:
    - example_value1
    - example_value2
example_multiline: |
    this is a
    multiline
    entry
example_number: 1234.5678
example:
    nested:
        values: delete_me
";

const DEFAULT_JSON: &str = "\
{
\"example_key\": \"example_value\",
\"example_array\": [
    \"example_value1\",
    \"example_value2\"
],
\"example_number\": 1234.5678
}";

const DEFAULT_TEXT: &str = "Welcome to svault!\nRemove this text and add your content to the file.\n\n";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "svault - encrypted structured-files editor that uses AWS KMS and PGP",
    after_help = DESC
)]
struct Cli {
    /// File to edit; created from a template if it doesn't exist
    file: PathBuf,

    /// Comma separated list of KMS ARNs (a role may be glued with '+')
    #[arg(short = 'k', long = "kms")]
    kms: Option<String>,

    /// Comma separated list of PGP fingerprints
    #[arg(short = 'p', long = "pgp")]
    pgp: Option<String>,

    /// Decrypt <FILE> and print it to stdout
    #[arg(short = 'd', long)]
    decrypt: bool,

    /// Encrypt <FILE> and print it to stdout
    #[arg(short = 'e', long)]
    encrypt: bool,

    /// Write output back to <FILE> instead of stdout for encrypt/decrypt
    #[arg(short = 'i', long = "in-place")]
    in_place: bool,

    /// Generate a new data encryption key and encrypt all values with it
    #[arg(short = 'r', long)]
    rotate: bool,

    /// Extract a specific key or branch from the input document
    /// (decrypt mode only), e.g. --extract '["somekey"][0]'
    #[arg(long, value_name = "TREE_PATH")]
    extract: Option<String>,

    /// Input type (yaml, json, bytes); guessed from the file extension if unset
    #[arg(long = "input-type", value_name = "TYPE")]
    input_type: Option<String>,

    /// Output type (yaml, json, bytes); same as the input type if unset
    #[arg(long = "output-type", value_name = "TYPE")]
    output_type: Option<String>,

    /// Display master encryption keys in the file during editing
    #[arg(short = 's', long = "show-master-keys")]
    show_master_keys: bool,

    /// Ignore the message authentication code during decryption
    #[arg(long = "ignore-mac")]
    ignore_mac: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("svault: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::NoChange) => 200,
        Some(Error::IntegrityMissing) => 52,
        Some(Error::IntegrityMismatch { .. }) => 51,
        Some(Error::NoUsableRecipient(op)) => {
            if *op == "wrap" {
                37
            } else {
                128
            }
        }
        Some(Error::UnsupportedType(_)) => 23,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    security::disable_core_dumps().ok();

    let itype = match &cli.input_type {
        Some(t) => t.parse::<FileType>()?,
        None => FileType::detect(&cli.file),
    };
    let otype = match &cli.output_type {
        Some(t) => t.parse::<FileType>()?,
        None => itype,
    };

    let exists = cli.file.exists();
    if !exists && (cli.encrypt || cli.decrypt) {
        eprintln!("svault: cannot operate on non-existent file {}", cli.file.display());
        std::process::exit(100);
    }

    let mut tree = if exists {
        let raw = fs::read(&cli.file)
            .with_context(|| format!("unable to read {}", cli.file.display()))?;
        itype.codec().parse(&raw)?
    } else {
        eprintln!("{} doesn't exist, creating it.", cli.file.display());
        default_template(itype)?
    };

    let mut meta = Metadata::from_tree(&tree)?;
    if !meta.has_usable_recipient() {
        bootstrap_recipients(&cli, &mut meta);
    }

    let ring = KeyRing::with_default_providers()?;
    let now = session_timestamp();

    if cli.encrypt {
        return encrypt_mode(&cli, &ring, tree, meta, &now, otype);
    }
    if cli.decrypt {
        return decrypt_mode(&cli, &ring, tree, meta, otype);
    }
    edit_mode(&cli, &ring, tree, meta, &now, otype, exists)
}

/// Seed the recipient list from flags or the environment. Only reached when
/// the document holds no usable recipient of its own.
fn bootstrap_recipients(cli: &Cli, meta: &mut Metadata) {
    let kms = cli.kms.clone().or_else(|| env::var("SOPS_KMS_ARN").ok());
    let pgp = cli.pgp.clone().or_else(|| env::var("SOPS_PGP_FP").ok());

    let mut recipients = Vec::new();
    if let Some(specs) = kms {
        recipients.extend(Metadata::parse_kms_specs(&specs));
    }
    if let Some(specs) = pgp {
        recipients.extend(Metadata::parse_pgp_specs(&specs));
    }
    if recipients.is_empty() {
        eprintln!(
            "svault: no KMS ARN or PGP fingerprint found to encrypt the data key, \
             read the help (-h) for more information"
        );
        std::process::exit(111);
    }
    meta.recipients = recipients;
}

/// The data key used for writing: the document's own (unwrapped), a rotated
/// one, or a freshly generated one wrapped to every recipient.
fn write_key(ring: &KeyRing, meta: &mut Metadata, now: &str, rotate: bool) -> Result<DataKey> {
    if meta.has_usable_recipient() {
        if rotate {
            return Ok(ring.rotate(meta, now)?);
        }
        return Ok(ring.unwrap_key(meta)?);
    }
    eprintln!("please wait while a data encryption key is being generated and stored securely");
    let key = ring.generate();
    ring.wrap_key(&key, meta, now)?;
    Ok(key)
}

fn encrypt_mode(
    cli: &Cli,
    ring: &KeyRing,
    mut tree: Node,
    mut meta: Metadata,
    now: &str,
    otype: FileType,
) -> Result<()> {
    let key = write_key(ring, &mut meta, now, cli.rotate)?;
    encrypt_document(&mut tree, &key, &mut meta, None, now)?;
    emit(cli, otype, &tree)
}

fn decrypt_mode(
    cli: &Cli,
    ring: &KeyRing,
    mut tree: Node,
    meta: Metadata,
    otype: FileType,
) -> Result<()> {
    let key = ring.unwrap_key(&meta)?;
    decrypt_document(&mut tree, &key, &meta, None, cli.ignore_mac)?;
    if !cli.show_master_keys {
        drop_metadata(&mut tree);
    }
    if let Some(path) = &cli.extract {
        let sub = tree.at_path(path)?.clone();
        return write_out(cli, &render_extract(&sub, otype)?);
    }
    emit(cli, otype, &tree)
}

fn edit_mode(
    cli: &Cli,
    ring: &KeyRing,
    mut tree: Node,
    mut meta: Metadata,
    now: &str,
    otype: FileType,
    exists: bool,
) -> Result<()> {
    let key = write_key(ring, &mut meta, now, false)?;

    // the stash carries each leaf's IV across the session so unchanged
    // values re-encrypt to identical envelopes
    let mut stash = StashNode::new();
    if exists {
        decrypt_document(&mut tree, &key, &meta, Some(&mut stash), cli.ignore_mac)?;
    }
    if !cli.show_master_keys {
        drop_metadata(&mut tree);
    }

    let suffix = match otype {
        FileType::Yaml => ".yaml",
        FileType::Json => ".json",
        FileType::Bytes => "",
    };
    let tmp = tempfile::Builder::new()
        .prefix(".svault-edit-")
        .suffix(suffix)
        .tempfile()
        .context("unable to create a temporary file")?;
    security::set_secure_permissions(tmp.path()).ok();
    fs::write(tmp.path(), otype.codec().emit(&tree)?)?;
    let before = snapshot(tmp.path())?;
    eprintln!("temp file created at {}", tmp.path().display());

    // reopen the editor until the document parses and still names at least
    // one master key to wrap the data key with
    let edited = loop {
        run_editor(tmp.path())?;
        let raw = fs::read(tmp.path())?;
        let parsed = match otype.codec().parse(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!(
                    "Syntax error: {e}\nPress enter to return to the editor, \
                     or ctrl+c to exit without saving."
                );
                wait_for_enter()?;
                continue;
            }
        };
        let candidate = if cli.show_master_keys {
            Metadata::from_tree(&parsed)?
        } else {
            meta.clone()
        };
        if !candidate.has_any_recipient() {
            eprintln!(
                "Could not find a valid master key to encrypt the data key with.\n\
                 Add at least one KMS or PGP master key to the `sops` branch,\n\
                 then press enter, or ctrl+c to exit without saving."
            );
            wait_for_enter()?;
            continue;
        }
        meta = candidate;
        break parsed;
    };

    if snapshot(tmp.path())? == before {
        return Err(Error::NoChange.into());
    }

    tree = edited;
    let (key, stash) = if cli.rotate {
        // rotation already clears and re-wraps every entry, session
        // additions included; fresh IVs only under the new key
        (ring.rotate(&mut meta, now)?, None)
    } else {
        // recipients added during the session get their wrapped copy now
        ring.wrap_key(&key, &mut meta, now)?;
        (key, Some(&stash))
    };
    encrypt_document(&mut tree, &key, &mut meta, stash, now)?;

    write_atomic(&cli.file, &otype.codec().emit(&tree)?)?;
    eprintln!("file written to {}", cli.file.display());
    Ok(())
}

fn default_template(itype: FileType) -> Result<Node> {
    Ok(match itype {
        FileType::Yaml => itype.codec().parse(DEFAULT_YAML.as_bytes())?,
        FileType::Json => itype.codec().parse(DEFAULT_JSON.as_bytes())?,
        FileType::Bytes => {
            let mut root = svault_core::Mapping::new();
            root.insert("data".into(), Node::str(DEFAULT_TEXT));
            Node::Map(root)
        }
    })
}

fn drop_metadata(tree: &mut Node) {
    if let Node::Map(map) = tree {
        map.shift_remove(svault_core::METADATA_KEY);
    }
}

/// A `--extract`ed scalar prints bare; branches go through the codec.
fn render_extract(node: &Node, otype: FileType) -> Result<Vec<u8>> {
    if let Node::Leaf(leaf) = node {
        let mut out = match &leaf.value {
            Value::Str(s) => s.clone().into_bytes(),
            Value::Bytes(b) => b.clone(),
            Value::Int(i) => i.to_string().into_bytes(),
            Value::Float(f) => f.to_string().into_bytes(),
            Value::Bool(b) => b.to_string().into_bytes(),
            Value::Null => b"null".to_vec(),
        };
        out.push(b'\n');
        return Ok(out);
    }
    Ok(otype.codec().emit(node)?)
}

fn emit(cli: &Cli, otype: FileType, tree: &Node) -> Result<()> {
    write_out(cli, &otype.codec().emit(tree)?)
}

fn write_out(cli: &Cli, bytes: &[u8]) -> Result<()> {
    if cli.in_place {
        write_atomic(&cli.file, bytes)?;
        info!("file written to {}", cli.file.display());
    } else {
        io::stdout().write_all(bytes)?;
    }
    Ok(())
}

/// Atomic replace: write to a temp file in the destination directory, sync,
/// rename. A failed session never leaves a half-written document behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("unable to create a temporary file next to {}", path.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("unable to replace {}", path.display()))?;
    Ok(())
}

fn run_editor(path: &Path) -> Result<()> {
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vim".to_owned());
    let mut parts = editor.split_whitespace();
    let program = parts.next().context("EDITOR is empty")?;
    let status = Command::new(program)
        .args(parts)
        .arg(path)
        .status()
        .with_context(|| format!("unable to launch editor '{editor}'"))?;
    if !status.success() {
        bail!("editor exited with {status}");
    }
    Ok(())
}

fn wait_for_enter() -> Result<()> {
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        bail!("stdin closed, exiting without saving");
    }
    Ok(())
}

fn snapshot(path: &Path) -> io::Result<(SystemTime, u64)> {
    let md = fs::metadata(path)?;
    Ok((md.modified()?, md.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_parse_for_every_file_type() {
        for itype in [FileType::Yaml, FileType::Json, FileType::Bytes] {
            let tree = default_template(itype).unwrap();
            assert!(tree.as_map().is_some(), "{itype:?} template must be a mapping");
        }
        let yaml = default_template(FileType::Yaml).unwrap();
        assert_eq!(yaml.get("example_key").unwrap().as_str(), Some("example_value"));
    }

    #[test]
    fn extracted_scalars_print_bare() {
        let out = render_extract(&Node::int(42), FileType::Yaml).unwrap();
        assert_eq!(out, b"42\n");
        let out = render_extract(&Node::str("hello"), FileType::Json).unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn failure_classes_map_to_distinct_exit_codes() {
        assert_eq!(exit_code(&Error::NoChange.into()), 200);
        assert_eq!(exit_code(&Error::IntegrityMissing.into()), 52);
        assert_eq!(
            exit_code(
                &Error::IntegrityMismatch { expected: "A".into(), computed: "B".into() }.into()
            ),
            51
        );
        assert_eq!(exit_code(&Error::NoUsableRecipient("unwrap").into()), 128);
        assert_eq!(exit_code(&Error::NoUsableRecipient("wrap").into()), 37);
        assert_eq!(exit_code(&anyhow::anyhow!("anything else")), 1);
    }
}
