//! tokensign CLI
//!
//! Provision USB key tokens, sign documents with the key on a token, and
//! verify signed documents against a trusted public key.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokensign_core::config::{Config, MarkerCriteria};
use tokensign_core::error::Classify;
use tokensign_core::logging::{self, AUDIT_TARGET};
use tokensign_crypto::{
    FileDocument, Fingerprint, Passphrase, PdfSignatureChecker, PublicKeyMaterial,
    VerificationReason,
};
use tokensign_token::{
    MountPresence, PassphraseProvider, PresenceCheck, PromptPurpose, ProvisionReport,
    Provisioner, PublicKeyDestination, SecurePdfSigner, TokenHandle, TokenPresence,
    TokenError, TokenWatcher, WatcherHandle,
};
use tracing::{error, info};
use zeroize::Zeroizing;

/// Passphrase source for unattended use.
const PASSPHRASE_ENV_VAR: &str = "TOKENSIGN_PASSPHRASE";

#[derive(Parser)]
#[command(name = "tokensign")]
#[command(about = "USB-token-backed document signing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $TOKENSIGN_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Machine-readable output on stdout and JSON logs on stderr
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a key and deploy it to one token
    Keygen {
        /// RSA modulus size (defaults to the configured size)
        #[arg(short, long)]
        bits: Option<usize>,

        /// Mount path of the token; waits for an insertion when omitted
        #[arg(short, long)]
        token: Option<PathBuf>,

        /// Where to save the public key PEM
        #[arg(short, long)]
        public_key: PathBuf,

        /// Seconds to wait for a token
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Watch for blank drives and provision each one as it is inserted
    Provision {
        /// Directory receiving `<fingerprint>.pem` per token
        #[arg(short, long)]
        public_key_dir: PathBuf,

        /// Stop after this many tokens
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Sign a document with the key on a token
    ///
    /// The passphrase attempt limit applies to one insertion as seen by this
    /// process. Each run starts a fresh count, even if the token was never
    /// removed.
    Sign {
        input: PathBuf,
        output: PathBuf,

        /// Mount path of the token; waits for an insertion when omitted
        #[arg(short, long)]
        token: Option<PathBuf>,

        /// Seconds to wait for a token
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Verify a signed document
    Verify {
        signed: PathBuf,

        /// Trusted public key PEM
        #[arg(short, long)]
        public_key: PathBuf,
    },

    /// Print the fingerprint of a public key PEM
    Fingerprint { public_key: PathBuf },
}

#[derive(Debug, Serialize)]
struct SignOutput {
    output: PathBuf,
    device_id: String,
    fingerprint: Fingerprint,
    timestamp_ms: u64,
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    valid: bool,
    reason: VerificationReason,
    fingerprint: Fingerprint,
}

#[derive(Debug, Serialize)]
struct FingerprintOutput {
    fingerprint: Fingerprint,
    bits: usize,
}

/// Presence for either a mount path given on the command line or a
/// watcher-tracked insertion.
enum CliPresence {
    Mount(MountPresence),
    Watched(TokenPresence),
}

impl PresenceCheck for CliPresence {
    fn is_present(&self, handle: &TokenHandle) -> bool {
        match self {
            CliPresence::Mount(p) => p.is_present(handle),
            CliPresence::Watched(p) => p.is_present(handle),
        }
    }
}

/// Reads passphrases from the environment or the terminal.
struct TerminalPrompt {
    from_env: Option<Passphrase>,
    env_unlock_tried: bool,
}

impl TerminalPrompt {
    fn new() -> Self {
        Self {
            from_env: std::env::var(PASSPHRASE_ENV_VAR).ok().map(Passphrase::from),
            env_unlock_tried: false,
        }
    }

    fn read_line(label: &str) -> Option<Passphrase> {
        eprint!("{}: ", label);
        io::stderr().flush().ok()?;
        let mut line = Zeroizing::new(String::new());
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(Passphrase::from(line.trim_end_matches(['\r', '\n']))),
        }
    }
}

impl PassphraseProvider for TerminalPrompt {
    fn prompt_passphrase(&mut self, purpose: PromptPurpose) -> Option<Passphrase> {
        if let Some(passphrase) = &self.from_env {
            // A fixed passphrase that fails once fails forever.
            if let PromptPurpose::Unlock { .. } = purpose {
                if std::mem::replace(&mut self.env_unlock_tried, true) {
                    return None;
                }
            }
            return Some(passphrase.clone());
        }

        match purpose {
            PromptPurpose::NewKey => loop {
                let first = Self::read_line("New token passphrase")?;
                let second = Self::read_line("Repeat passphrase")?;
                if first.as_bytes() == second.as_bytes() && !first.is_empty() {
                    return Some(first);
                }
                eprintln!("Passphrases were empty or did not match, try again");
            },
            PromptPurpose::Unlock { remaining_attempts } => Self::read_line(&format!(
                "Token passphrase ({} attempts left)",
                remaining_attempts
            )),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_public_key(path: &Path) -> Result<PublicKeyMaterial> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read public key {}", path.display()))?;
    PublicKeyMaterial::from_pem(&pem)
        .with_context(|| format!("Invalid public key {}", path.display()))
}

/// Resolve the token to use: an explicit mount path, or the next insertion.
async fn locate_token(
    config: &Config,
    explicit: Option<PathBuf>,
    timeout: Option<u64>,
) -> Result<(TokenHandle, CliPresence, Option<WatcherHandle>)> {
    if let Some(path) = explicit {
        if !path.is_dir() {
            bail!("Token mount path {} is not a directory", path.display());
        }
        let device_id = path.display().to_string();
        let handle = TokenHandle::new(device_id, path, 1);
        return Ok((handle, CliPresence::Mount(MountPresence), None));
    }

    let watcher = TokenWatcher::from_config(&config.token).spawn();
    eprintln!("Waiting for a key token...");
    let handle = watcher
        .wait_for_token(timeout.map(Duration::from_secs))
        .await
        .context("No token inserted")?;
    let presence = CliPresence::Watched(watcher.presence());
    Ok((handle, presence, Some(watcher)))
}

async fn stop(watcher: Option<WatcherHandle>) -> Result<()> {
    if let Some(watcher) = watcher {
        watcher.shutdown().await?;
    }
    Ok(())
}

fn report_provisioned(report: &ProvisionReport, json: bool) -> Result<()> {
    if json {
        print_json(report)
    } else {
        println!("Provisioned token {}", report.device_id);
        println!("  Fingerprint: {}", report.fingerprint);
        println!("  Key size:    {} bits", report.key_bits);
        println!("  Public key:  {}", report.public_key_path.display());
        Ok(())
    }
}

async fn cmd_keygen(
    mut config: Config,
    bits: Option<usize>,
    token: Option<PathBuf>,
    public_key: PathBuf,
    timeout: Option<u64>,
    json: bool,
) -> Result<()> {
    if let Some(bits) = bits {
        config.keys.default_bits = bits;
    }
    // A blank drive has no payload yet, so wait for a fresh insertion.
    config.token.marker = MarkerCriteria::Any;
    config.token.ignore_preexisting = true;

    let (handle, presence, watcher) = locate_token(&config, token, timeout).await?;
    let provisioner = Provisioner::from_config(&config, presence);
    let result = provisioner.provision_with_prompt(
        &handle,
        &mut TerminalPrompt::new(),
        &PublicKeyDestination::File(public_key),
    );
    stop(watcher).await?;

    report_provisioned(&result.context("Provisioning failed")?, json)
}

async fn cmd_provision(
    mut config: Config,
    public_key_dir: PathBuf,
    count: Option<usize>,
    json: bool,
) -> Result<()> {
    std::fs::create_dir_all(&public_key_dir)
        .with_context(|| format!("Cannot create {}", public_key_dir.display()))?;
    config.token.marker = MarkerCriteria::Any;
    config.token.ignore_preexisting = true;

    let watcher = TokenWatcher::from_config(&config.token).spawn();
    let mut events = watcher.subscribe();
    let provisioner =
        Provisioner::from_config(&config, CliPresence::Watched(watcher.presence()));

    eprintln!("Insert drives to provision (Ctrl-D at the passphrase prompt to stop)");
    let reports = provisioner
        .provision_on_insert(
            &mut events,
            &mut TerminalPrompt::new(),
            &PublicKeyDestination::Directory(public_key_dir),
            count,
        )
        .await;
    watcher.shutdown().await?;

    let reports = reports?;
    if json {
        print_json(&reports)?;
    } else {
        for report in &reports {
            report_provisioned(report, false)?;
        }
    }
    info!(provisioned = reports.len(), "Provisioning session finished");
    Ok(())
}

async fn cmd_sign(
    config: Config,
    input: PathBuf,
    output: PathBuf,
    token: Option<PathBuf>,
    timeout: Option<u64>,
    json: bool,
) -> Result<()> {
    let (handle, presence, watcher) = locate_token(&config, token, timeout).await?;
    let mut signer = SecurePdfSigner::from_config(&config, presence);
    let result = signer.sign_file(&handle, &mut TerminalPrompt::new(), &input, &output);
    stop(watcher).await?;

    let signed = result.with_context(|| format!("Failed to sign {}", input.display()))?;
    if json {
        print_json(&SignOutput {
            output,
            device_id: handle.device_id,
            fingerprint: signed.record.signer_fingerprint(),
            timestamp_ms: signed.record.timestamp_ms(),
        })
    } else {
        println!("Signed {} -> {}", input.display(), output.display());
        println!("  Signer: {}", signed.record.signer_fingerprint());
        Ok(())
    }
}

/// Returns whether the signature is valid.
fn cmd_verify(signed: PathBuf, public_key: PathBuf, json: bool) -> Result<bool> {
    let trusted = read_public_key(&public_key)?;
    let result = PdfSignatureChecker::new()
        .verify_source(&FileDocument::new(&signed), &trusted)
        .with_context(|| format!("Cannot verify {}", signed.display()))?;

    if json {
        print_json(&VerifyOutput {
            valid: result.valid,
            reason: result.reason,
            fingerprint: trusted.fingerprint(),
        })?;
    } else if result.valid {
        println!("✓ Signature is VALID");
        println!("  Signer: {}", trusted.fingerprint());
    } else {
        println!("✗ Signature is INVALID ({:?})", result.reason);
    }
    Ok(result.valid)
}

fn cmd_fingerprint(public_key: PathBuf, json: bool) -> Result<()> {
    let key = read_public_key(&public_key)?;
    let bits = key.bits()?;
    if json {
        print_json(&FingerprintOutput {
            fingerprint: key.fingerprint(),
            bits,
        })
    } else {
        println!("{}  ({} bits)", key.fingerprint(), bits);
        Ok(())
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Keygen {
            bits,
            token,
            public_key,
            timeout,
        } => cmd_keygen(config, bits, token, public_key, timeout, cli.json).await?,
        Commands::Provision {
            public_key_dir,
            count,
        } => cmd_provision(config, public_key_dir, count, cli.json).await?,
        Commands::Sign {
            input,
            output,
            token,
            timeout,
        } => cmd_sign(config, input, output, token, timeout, cli.json).await?,
        Commands::Verify { signed, public_key } => {
            return cmd_verify(signed, public_key, cli.json)
        }
        Commands::Fingerprint { public_key } => cmd_fingerprint(public_key, cli.json)?,
    }
    Ok(true)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.json {
        logging::init_json();
    } else {
        logging::init();
    }

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            match e.downcast_ref::<TokenError>() {
                Some(token_err @ (TokenError::LockedOut { .. } | TokenError::Cancelled)) => {
                    eprintln!("Error: {}", token_err);
                }
                // Precise reason to the audit log, coarse class to the operator.
                Some(token_err) => {
                    error!(target: AUDIT_TARGET, error = %format!("{:#}", e), "Command failed");
                    eprintln!("Error: {}", token_err.user_message());
                }
                None => eprintln!("Error: {:#}", e),
            }
            process::exit(2);
        }
    }
}
