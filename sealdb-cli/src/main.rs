//! `SealDB` CLI tool for key management and one-shot column operations.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sealdb::blind_index::Normalizer;
use sealdb::config::{CompressionConfig, VaultConfig};
use sealdb::envelope;
use sealdb::search::SearchParam;
use sealdb::vault::Vault;
use sealdb_key_file::FileKeyRegistry;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_KEY_DIR: &str = "./keys";

#[derive(Parser)]
#[command(name = "sealdb")]
#[command(about = "SealDB key management and column encryption CLI", long_about = None)]
struct Cli {
    /// Directory holding master keys
    #[arg(short, long, global = true)]
    key_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Minimum payload size, in bytes, before compression is attempted
    #[arg(long, global = true)]
    compression_threshold: Option<usize>,

    /// Never compress payloads
    #[arg(long, global = true)]
    no_compression: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a key directory with one fresh default key
    Init {
        /// Identifier of the first key
        #[arg(long, default_value = "v1")]
        key_id: String,
    },
    /// Generate a new master key
    Keygen {
        /// Identifier of the new key
        key_id: String,
        /// Make the new key the default
        #[arg(long)]
        set_current: bool,
    },
    /// Encrypt a value, printing the envelope as hex
    Encrypt {
        /// Value to encrypt
        value: String,
        /// Treat the value as hex-encoded bytes
        #[arg(long)]
        hex: bool,
        /// Encrypt under this key instead of the default
        #[arg(long)]
        key_id: Option<String>,
    },
    /// Decrypt a hex envelope
    Decrypt {
        /// Envelope as hex
        envelope: String,
        /// Print the plaintext as hex
        #[arg(long)]
        hex: bool,
        /// Require the envelope to name this key
        #[arg(long)]
        key_id: Option<String>,
    },
    /// Compute a blind index, printed as hex
    BlindIndex {
        /// Value to index
        value: String,
        /// Normalization applied before hashing
        #[arg(short, long, value_enum, default_value_t = NormalizerArg::Identity)]
        normalizer: NormalizerArg,
        /// Index under this key instead of the default
        #[arg(long)]
        key_id: Option<String>,
        /// Index under every active key
        #[arg(long, conflicts_with = "key_id")]
        all: bool,
    },
    /// Build an equality search condition over every active key
    Condition {
        /// Column name
        column: String,
        /// Value to search for
        value: String,
        /// Normalization applied before hashing
        #[arg(short, long, value_enum, default_value_t = NormalizerArg::Identity)]
        normalizer: NormalizerArg,
        /// Number of the first positional parameter
        #[arg(long, default_value_t = 1)]
        offset: usize,
    },
    /// Re-encrypt a hex envelope under the default key
    Rotate {
        /// Envelope as hex
        envelope: String,
    },
    /// Report whether a hex envelope was written under an old key
    NeedsRotation {
        /// Envelope as hex
        envelope: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum NormalizerArg {
    Identity,
    Email,
    Digits,
    Trim,
    Lowercase,
}

impl From<NormalizerArg> for Normalizer {
    fn from(arg: NormalizerArg) -> Self {
        match arg {
            NormalizerArg::Identity => Self::Identity,
            NormalizerArg::Email => Self::Email,
            NormalizerArg::Digits => Self::Digits,
            NormalizerArg::Trim => Self::Trim,
            NormalizerArg::Lowercase => Self::Lowercase,
        }
    }
}

/// Settings read from `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    key_dir: Option<PathBuf>,
    compression: CompressionConfig,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }
}

struct Settings {
    key_dir: PathBuf,
    vault: VaultConfig,
}

impl Settings {
    fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let key_dir = cli
            .key_dir
            .clone()
            .or(file.key_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_DIR));

        let mut vault = VaultConfig { compression: file.compression };
        if let Some(threshold) = cli.compression_threshold {
            vault = vault.with_compression_threshold(threshold);
        }
        if cli.no_compression {
            vault = vault.without_compression();
        }

        Ok(Self { key_dir, vault })
    }

    fn open_vault(&self) -> Result<Vault> {
        let registry = FileKeyRegistry::new(&self.key_dir)
            .with_context(|| format!("loading keys from {}", self.key_dir.display()))?;
        Vault::new(&registry, self.vault.clone()).context("opening vault")
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn decode_hex(label: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim()).with_context(|| format!("{label} is not valid hex"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Settings::resolve(&cli)?;

    match cli.command {
        Commands::Init { key_id } => {
            FileKeyRegistry::init(&settings.key_dir, &key_id).with_context(|| {
                format!("initializing key directory {}", settings.key_dir.display())
            })?;
            println!("Initialized {} with default key {key_id}", settings.key_dir.display());
        }
        Commands::Keygen { key_id, set_current } => {
            let mut registry = FileKeyRegistry::new(&settings.key_dir)
                .with_context(|| format!("loading keys from {}", settings.key_dir.display()))?;
            registry.generate_key(&key_id).context("generating key")?;
            if set_current {
                registry.set_current(&key_id).context("setting default key")?;
            }
            println!("Generated key {key_id}{}", if set_current { " (default)" } else { "" });
        }
        Commands::Encrypt { value, hex: hex_input, key_id } => {
            let plaintext = if hex_input { decode_hex("value", &value)? } else { value.into_bytes() };
            let vault = settings.open_vault()?;
            let envelope = match key_id {
                Some(key_id) => vault.encrypt_with_key(&key_id, Some(&plaintext)),
                None => vault.encrypt(Some(&plaintext)),
            }
            .context("encrypting")?;
            println!("{}", hex::encode(envelope.unwrap_or_default()));
        }
        Commands::Decrypt { envelope, hex: hex_output, key_id } => {
            let envelope = decode_hex("envelope", &envelope)?;
            let vault = settings.open_vault()?;
            let plaintext = match key_id {
                Some(key_id) => vault.decrypt_with_key(&key_id, Some(&envelope)),
                None => vault.decrypt(Some(&envelope)),
            }
            .context("decrypting")?
            .unwrap_or_default();

            if hex_output {
                println!("{}", hex::encode(plaintext));
            } else {
                let text = String::from_utf8(plaintext)
                    .context("plaintext is not UTF-8, use --hex")?;
                println!("{text}");
            }
        }
        Commands::BlindIndex { value, normalizer, key_id, all } => {
            let vault = settings.open_vault()?;
            let normalized = Normalizer::from(normalizer).apply(&value);

            if all {
                let indexes = vault
                    .blind_index_all(Some(normalized.as_bytes()))
                    .context("computing blind indexes")?
                    .unwrap_or_default();
                for key_id in vault.active_key_ids() {
                    if let Some(index) = indexes.get(key_id) {
                        println!("{key_id} {}", hex::encode(index));
                    }
                }
            } else {
                let index = match key_id {
                    Some(key_id) => vault
                        .blind_index_with_key(&key_id, Some(normalized.as_bytes()))
                        .context("computing blind index")?,
                    None => vault.blind_index(Some(normalized.as_bytes())),
                };
                if let Some(index) = index {
                    println!("{}", hex::encode(index));
                }
            }
        }
        Commands::Condition { column, value, normalizer, offset } => {
            let vault = settings.open_vault()?;

            // The builder panics on unsafe input; report it as an error instead.
            sealdb::search::validate_identifier(&column)?;
            sealdb::search::validate_offset(offset, vault.active_key_ids().len())?;

            let condition =
                vault.build_condition_str(&column, Some(&value), normalizer.into(), offset);
            println!("{}", condition.predicate());
            for (i, param) in condition.parameters().iter().enumerate() {
                match param {
                    SearchParam::KeyId(key_id) => println!("${} {key_id}", offset + i),
                    SearchParam::BlindIndex(index) => {
                        println!("${} {}", offset + i, hex::encode(index));
                    }
                }
            }
        }
        Commands::Rotate { envelope } => {
            let envelope = decode_hex("envelope", &envelope)?;
            let vault = settings.open_vault()?;
            let rotated = vault.rotate_value(Some(&envelope)).context("rotating")?;
            println!("{}", hex::encode(rotated.unwrap_or_default()));
        }
        Commands::NeedsRotation { envelope } => {
            let envelope = decode_hex("envelope", &envelope)?;
            let vault = settings.open_vault()?;
            match envelope::peek_key_id(&envelope) {
                Ok(key_id) => {
                    println!("{} (key {key_id})", vault.needs_rotation(Some(&envelope)));
                }
                Err(e) => bail!("cannot read envelope header: {e}"),
            }
        }
    }

    Ok(())
}
