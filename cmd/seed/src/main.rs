//! # seed
//!
//! Grants a privileged role to an identity-provider subject, creating the
//! account if it has never signed in. Sign-in only ever creates citizens,
//! so the first administrator has to come from here.

use anyhow::Context;
use cf_config::AppConfig;
use cf_core::models::{IdentityClaims, Role};
use cf_db_sqlite::SqliteStore;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "seed")]
#[command(about = "Create or promote a Civic-Fix admin or staff account")]
struct Args {
    /// Identity-provider subject id of the account
    #[arg(short, long)]
    subject: String,

    /// Role to grant: admin or staff
    #[arg(short, long, default_value = "admin")]
    role: String,

    /// Display name stored with the account
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    email: Option<String>,

    /// Database URL; defaults to the configured `database.url`
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info,sqlx=warn").init();
    let args = Args::parse();

    let role: Role = args.role.parse()?;
    if role == Role::Citizen {
        anyhow::bail!("seed grants privileged roles only; citizens are created at sign-in");
    }
    if args.subject.trim().is_empty() {
        anyhow::bail!("subject must not be empty");
    }

    let url = match args.database_url {
        Some(url) => url,
        None => AppConfig::load().context("loading configuration")?.database.url,
    };
    let store = SqliteStore::connect(&url)
        .await
        .with_context(|| format!("opening database {url}"))?;

    let claims = IdentityClaims {
        subject: args.subject,
        display_name: args.name,
        email: args.email,
        avatar_url: None,
    };
    let user = store.ensure_role(&claims, role).await?;
    tracing::info!(user_id = %user.id, subject = %user.subject, role = %user.role, "account seeded");
    println!("{} {} {}", user.id, user.subject, user.role);
    Ok(())
}
