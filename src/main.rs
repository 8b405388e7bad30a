//! rcryptfs - Reverse-encrypting FUSE filesystem
//!
//! Usage:
//!   rcryptfs init                          - Write config and generate keys
//!   rcryptfs mount <source> <mount_point>  - Mount the encrypted view
//!   rcryptfs unmount <mount_point>         - Unmount
//!   rcryptfs status                        - Show configuration and key state
//!   rcryptfs decrypt <input>               - Decrypt a file taken from the mount

use clap::{Parser, Subcommand};
use rcryptfs::{
    config::Config,
    crypto::KeyManager,
    fs::{self as rfs, ReverseFs},
    Error, Result,
};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Size of each chunk `decrypt` streams through the cipher
const DECRYPT_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "rcryptfs")]
#[command(author = "rcryptfs Contributors")]
#[command(version)]
#[command(about = "Read-only FUSE mount exposing an AES-256-CTR encrypted view of a directory")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/rcryptfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and generate key material
    Init {
        /// Key file location
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Plaintext directory to expose
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Mount the encrypted view in the foreground
    Mount {
        /// Plaintext source directory
        source: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Extra FUSE options, passed through verbatim
        #[arg(short = 'o', value_name = "OPT")]
        options: Vec<String>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show configuration and key file state
    Status,

    /// Decrypt a file read through the mount
    Decrypt {
        /// Encrypted input file
        input: PathBuf,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Plaintext offset the input starts at
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr);

    let installed = if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    if let Err(e) = installed {
        eprintln!("Failed to set subscriber: {}", e);
    }

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init { key_file, source } => cmd_init(config_path, key_file, source),

        Commands::Mount {
            source,
            mount_point,
            options,
            allow_other,
        } => cmd_mount(config_path, &source, &mount_point, options, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Status => cmd_status(config_path),

        Commands::Decrypt {
            input,
            output,
            offset,
        } => cmd_decrypt(config_path, &input, output.as_deref(), offset),
    }
}

fn cmd_init(config_path: &Path, key_file: Option<PathBuf>, source: Option<PathBuf>) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;

    if let Some(key_file) = key_file {
        config.key_file = expand_tilde(&key_file);
    }
    if let Some(source) = source {
        config.source_dir = expand_tilde(&source);
    }
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    info!("Wrote config to {:?}", config_path);

    let keys = KeyManager::load_or_generate(&config)?;

    println!("rcryptfs initialized");
    println!("Config: {:?}", config_path);
    println!("Source: {:?}", config.source_dir);
    println!("Key file: {:?}", config.key_file);
    println!("Key fingerprint: {}", keys.fingerprint());
    println!();
    println!("Back up the key file separately; without it the encrypted view cannot be decrypted.");

    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    source: &Path,
    mount_point: &Path,
    options: Vec<String>,
    allow_other: bool,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    config.source_dir = expand_tilde(source);
    config.mount.mount_point = expand_tilde(mount_point);
    config.mount.options.extend(options);
    config.mount.allow_other |= allow_other;
    config.validate()?;

    info!("Starting rcryptfs...");

    // Key problems abort here, before anything is mounted
    let keys = KeyManager::load_or_generate(&config)?;

    let fs = ReverseFs::new(&config, std::sync::Arc::new(keys))?;

    rfs::mount(fs, &config)
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;

    println!("rcryptfs Status");
    println!("===============");
    println!();
    println!(
        "Configuration: {:?}{}",
        config_path,
        if config_path.exists() { "" } else { " (not found, using defaults)" }
    );
    println!("Source directory: {:?}", config.source_dir);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Scratch retain: {} KB", config.read.scratch_retain_bytes / 1024);

    if !config.key_file.exists() {
        println!("Key file: {:?} (missing, run 'rcryptfs init')", config.key_file);
        return Ok(());
    }

    match KeyManager::load(&config) {
        Ok(keys) => println!(
            "Key file: {:?} (valid, fingerprint {})",
            config.key_file,
            keys.fingerprint()
        ),
        Err(e) => println!("Key file: {:?} (INVALID: {})", config.key_file, e),
    }

    Ok(())
}

fn cmd_decrypt(config_path: &Path, input: &Path, output: Option<&Path>, offset: u64) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let keys = KeyManager::load(&config)?;

    let mut cipher = keys.new_cipher()?;
    cipher.seek(offset);

    let mut reader = File::open(input).map_err(|e| Error::from_io(e, &input.to_string_lossy()))?;
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut buf = vec![0u8; DECRYPT_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        cipher.transform(&mut buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;

    info!("Decrypted {} bytes from {:?}", total, input);
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
