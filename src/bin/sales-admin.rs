//! Operator tooling for the sales service's key material.
//!
//! - `genkey`: write a new RSA key pair into the keys folder
//! - `gentoken`: mint a token signed by a stored key
//! - `verify`: check a token and print the identity or the rejection reason

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use chrono::Duration;
use clap::{Args, Parser, Subcommand};
use sales_api::{
    KeyStore, TokenIssuer, TokenVerifier,
    config::{DEFAULT_ISSUER, DEFAULT_KEYS_FOLDER, parse_algorithms},
    keystore::key_paths,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// sales-admin - key and token tooling for the sales service
#[derive(Parser, Debug)]
#[command(name = "sales-admin", version, about, long_about = None, propagate_version = true)]
struct Cli {
    /// Directory holding `<kid>.pem` and `<kid>.pub.pem` files
    #[arg(long, default_value = DEFAULT_KEYS_FOLDER, env = "AUTH_KEYS_FOLDER", global = true)]
    keys_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new 2048-bit RSA key pair
    Genkey(GenkeyArgs),

    /// Mint a signed token
    Gentoken(GentokenArgs),

    /// Verify a token against the keys folder
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct GenkeyArgs {
    /// Key id; a random UUID when omitted
    #[arg(long)]
    kid: Option<String>,
}

#[derive(Args, Debug)]
struct GentokenArgs {
    /// Key id of the signing key
    #[arg(long)]
    kid: String,

    /// Subject (user id) the token is for
    #[arg(long)]
    subject: String,

    /// Comma-separated roles
    #[arg(long, value_delimiter = ',', default_value = "USER")]
    roles: Vec<String>,

    #[arg(long, default_value = DEFAULT_ISSUER, env = "AUTH_ISSUER")]
    issuer: String,

    /// Validity in hours
    #[arg(long, default_value_t = 8760)]
    ttl_hours: i64,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[arg(long)]
    token: String,

    #[arg(long, default_value = DEFAULT_ISSUER, env = "AUTH_ISSUER")]
    issuer: String,

    /// Comma-separated list of accepted algorithms
    #[arg(long, default_value = "RS256", env = "AUTH_ALGORITHMS")]
    algorithms: String,
}

fn main() -> anyhow::Result<()> {
    // stdout carries the command's output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sales_api=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Genkey(args) => genkey(&cli.keys_dir, args),
        Commands::Gentoken(args) => gentoken(&cli.keys_dir, args),
        Commands::Verify(args) => verify(&cli.keys_dir, args),
    }
}

fn genkey(keys_dir: &Path, args: GenkeyArgs) -> anyhow::Result<()> {
    let kid = args.kid.unwrap_or_else(|| Uuid::new_v4().to_string());

    sales_api::keystore::generate_key_pair(keys_dir, &kid)?;

    let (private, public) = key_paths(keys_dir, &kid);
    println!("kid:         {kid}");
    println!("private key: {}", private.display());
    println!("public key:  {}", public.display());
    Ok(())
}

fn gentoken(keys_dir: &Path, args: GentokenArgs) -> anyhow::Result<()> {
    let keys = Arc::new(load(keys_dir)?);
    let pair = keys.resolve(&args.kid)?;

    let roles: Vec<String> = args
        .roles
        .into_iter()
        .map(|role| role.trim().to_string())
        .filter(|role| !role.is_empty())
        .collect();

    let token = TokenIssuer::new(keys.clone()).issue(
        &args.subject,
        &args.issuer,
        &roles,
        &args.kid,
        Duration::hours(args.ttl_hours),
    )?;

    println!("{token}");
    println!("-----");
    print!("{}", pair.public_key_pem());
    Ok(())
}

fn verify(keys_dir: &Path, args: VerifyArgs) -> anyhow::Result<()> {
    let keys = Arc::new(load(keys_dir)?);
    let algorithms = parse_algorithms(&args.algorithms)?;
    let verifier = TokenVerifier::new(keys, args.issuer, algorithms);

    match verifier.verify(args.token.trim()) {
        Ok(identity) => {
            println!("subject: {}", identity.subject);
            println!("issuer:  {}", identity.issuer);
            println!("roles:   {}", identity.roles.join(","));
            Ok(())
        }
        Err(reason) => anyhow::bail!("token rejected ({}): {reason}", reason.kind()),
    }
}

fn load(keys_dir: &Path) -> anyhow::Result<KeyStore> {
    KeyStore::load_dir(keys_dir).with_context(|| format!("loading keys from {}", keys_dir.display()))
}
