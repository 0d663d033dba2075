//! # vaultfs CLI
//!
//! Command-line interface for vaultfs encrypted filesystem databases:
//! create, mount, rotate passwords, inspect.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use vault_core::VaultFs;
use vault_fuse::VaultFuseFs;
use vault_store::{change_password, init_store, open_store, InitParams};

mod password;

use password::PasswordSource;

/// vaultfs - encrypted mountable filesystem over a transactional store
#[derive(Parser)]
#[command(name = "vaultfs")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new database
    Init {
        /// Database directory (created if missing, must be empty)
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,

        #[command(flatten)]
        password: PasswordArgs,

        /// Page size for file data, fixed at creation
        #[arg(long, default_value_t = vault_store::params::DEFAULT_PAGE_SIZE)]
        page_size: i32,

        /// Record cipher identifier
        #[arg(long, default_value = vault_store::cipher::CIPHER_CHACHA20_POLY1305)]
        cipher_class: String,

        /// Auth module identifier
        #[arg(long, default_value = vault_store::auth::AUTH_ARGON2_AES_CBC)]
        auth_class: String,
    },

    /// Mount a database
    Mount {
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,

        #[arg(value_name = "MOUNT_POINT")]
        mount_point: PathBuf,

        #[command(flatten)]
        password: PasswordArgs,

        /// Mount read-only
        #[arg(long)]
        readonly: bool,

        /// Stay mounted until externally unmounted instead of waiting for
        /// an "exit" line on stdin
        #[arg(long)]
        noexit: bool,
    },

    /// Rewrap the data encryption key under a new password
    Changepassword {
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,

        #[command(flatten)]
        password: PasswordArgs,

        #[command(flatten)]
        new_password: NewPasswordArgs,
    },

    /// Print record counts per table
    Stats {
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,

        #[command(flatten)]
        password: PasswordArgs,
    },

    /// Print a decoded dump of every table
    Dump {
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,

        #[command(flatten)]
        password: PasswordArgs,
    },
}

#[derive(Args)]
struct PasswordArgs {
    /// Password given inline
    #[arg(short = 'w', long = "pw", value_name = "PASSWORD")]
    pw: Option<String>,

    /// Read the password from the first line of a file
    #[arg(long = "pw-file", value_name = "FILE")]
    pw_file: Option<PathBuf>,

    /// Prompt for the password interactively
    #[arg(short = 'W', long = "pw-prompt")]
    pw_prompt: bool,
}

impl PasswordArgs {
    fn source(&self) -> PasswordSource {
        PasswordSource {
            inline: self.pw.clone(),
            file: self.pw_file.clone(),
            prompt: self.pw_prompt,
        }
    }
}

#[derive(Args)]
struct NewPasswordArgs {
    /// New password given inline
    #[arg(long = "new-pw", value_name = "PASSWORD")]
    new_pw: Option<String>,

    /// Read the new password from the first line of a file
    #[arg(long = "new-pw-file", value_name = "FILE")]
    new_pw_file: Option<PathBuf>,

    /// Prompt for the new password interactively
    #[arg(short = 'N', long = "new-pw-prompt")]
    new_pw_prompt: bool,
}

impl NewPasswordArgs {
    fn source(&self) -> PasswordSource {
        PasswordSource {
            inline: self.new_pw.clone(),
            file: self.new_pw_file.clone(),
            prompt: self.new_pw_prompt,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("VAULTFS_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init {
            db_path,
            password,
            page_size,
            cipher_class,
            auth_class,
        } => cmd_init(db_path, password, page_size, cipher_class, auth_class),
        Commands::Mount {
            db_path,
            mount_point,
            password,
            readonly,
            noexit,
        } => cmd_mount(db_path, mount_point, password, readonly, noexit),
        Commands::Changepassword {
            db_path,
            password,
            new_password,
        } => cmd_change_password(db_path, password, new_password),
        Commands::Stats { db_path, password } => cmd_stats(db_path, password),
        Commands::Dump { db_path, password } => cmd_dump(db_path, password),
    }
}

fn cmd_init(
    db_path: PathBuf,
    password: PasswordArgs,
    page_size: i32,
    cipher_class: String,
    auth_class: String,
) -> Result<()> {
    if !db_path.exists() {
        std::fs::create_dir_all(&db_path)
            .with_context(|| format!("creating {}", db_path.display()))?;
    }

    let params = InitParams {
        password: password.source().resolve("Database password")?,
        cipher_class,
        auth_class,
        page_size,
    };
    init_store(&db_path, &params).context("init failed")?;
    println!("database created at {}", db_path.display());
    Ok(())
}

fn open_fs(db_path: &PathBuf, password: &PasswordArgs, readonly: bool) -> Result<VaultFs> {
    let pw = password.source().resolve("Database password")?;
    let env = open_store(db_path, &pw, readonly)
        .with_context(|| format!("opening database at {}", db_path.display()))?;
    Ok(VaultFs::open(env)?)
}

fn cmd_mount(
    db_path: PathBuf,
    mount_point: PathBuf,
    password: PasswordArgs,
    readonly: bool,
    noexit: bool,
) -> Result<()> {
    if !mount_point.is_dir() {
        bail!("mount point {} is not a directory", mount_point.display());
    }

    let fs = open_fs(&db_path, &password, readonly)?;
    let fuse_fs = VaultFuseFs::new(fs, readonly);

    if noexit {
        info!(mount_point = %mount_point.display(), "mounting until externally unmounted");
        fuse_fs.mount(&mount_point)?;
        return Ok(());
    }

    let session = fuse_fs.spawn_mount(&mount_point)?;
    println!(
        "mounted {} at {}; type \"exit\" to unmount",
        db_path.display(),
        mount_point.display()
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap_or_default();
        if line.trim().eq_ignore_ascii_case("exit") {
            break;
        }
    }

    session.unmount();
    println!("unmounted");
    Ok(())
}

fn cmd_change_password(
    db_path: PathBuf,
    password: PasswordArgs,
    new_password: NewPasswordArgs,
) -> Result<()> {
    let old = password.source().resolve("Current password")?;
    let new = new_password.source().resolve("New password")?;
    change_password(&db_path, &old, &new).context("password change failed")?;
    println!("password changed");
    Ok(())
}

fn cmd_stats(db_path: PathBuf, password: PasswordArgs) -> Result<()> {
    let fs = open_fs(&db_path, &password, true)?;

    println!("db stats:");
    for (table, count) in fs.table_counts()? {
        println!("{table} records: {count}");
    }

    let sizes = fs.sizes()?;
    println!("Files: {}", sizes.files);
    println!("Inodes: {}", sizes.inodes);
    println!("Paths: {}", sizes.paths);
    println!("Pages: {}", fs.total_pages_used()?);

    fs.close();
    Ok(())
}

fn cmd_dump(db_path: PathBuf, password: PasswordArgs) -> Result<()> {
    let fs = open_fs(&db_path, &password, true)?;
    let mut stdout = std::io::stdout();
    fs.print_dump(&mut stdout)?;
    fs.close();
    Ok(())
}
