use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use credstore_core::archive::default_archive_name;
use credstore_core::kdf::generate_salt;
use credstore_core::password_gen::{generate_password, CharClasses};
use credstore_core::validation::{validate_new_name, validate_passwords, validate_rename};
use credstore_core::{
    paths, Account, Database, DatabaseService, FileStore, KeyCache, PromptOutcome, RecordMap,
    SharedKeyCache, StoreSettings,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const PASSWORD_ENV: &str = "CREDSTORE_PASSWORD";
const MASK: &str = "********";

#[derive(Parser)]
#[command(name = "credstore")]
#[command(about = "Password-protected credential databases", long_about = None)]
struct Cli {
    /// Data directory (defaults to the per-user application directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Database password; prompted for when omitted and CREDSTORE_PASSWORD is unset
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List databases
    List,

    /// Create an empty database
    Create { name: String },

    /// Print the accounts of a database
    Show {
        name: String,
        /// Print account passwords instead of masking them
        #[arg(long)]
        reveal: bool,
    },

    /// Add an account to a database
    AddAccount {
        db: String,
        account: String,
        #[arg(long, default_value = "")]
        username: String,
        #[arg(long, default_value = "")]
        email: String,
        /// Account password; a random one is generated when omitted
        #[arg(long)]
        secret: Option<String>,
        /// Defaults to today's date
        #[arg(long)]
        date: Option<String>,
        #[arg(long, default_value = "")]
        comment: String,
    },

    /// Remove an account from a database
    RemoveAccount { db: String, account: String },

    /// Rename a database
    Rename { db: String, new_name: String },

    /// Change the password of a database
    Passwd {
        db: String,
        /// New password; prompted for when omitted
        #[arg(long)]
        new_password: Option<String>,
    },

    /// Delete a database
    Delete { name: String },

    /// Export a database to a tar archive
    Export {
        name: String,
        /// Output file (defaults to <name>.tar in the current directory)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Import databases from a tar archive
    Import { file: PathBuf },

    /// Generate a random password
    Generate {
        #[arg(short, long, default_value = "16")]
        length: usize,
        #[arg(long)]
        no_digits: bool,
        #[arg(long)]
        no_lower: bool,
        #[arg(long)]
        no_upper: bool,
        #[arg(long)]
        no_punctuation: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Generate {
            length,
            no_digits,
            no_lower,
            no_upper,
            no_punctuation,
        } => {
            let classes = CharClasses {
                digits: !no_digits,
                lower: !no_lower,
                upper: !no_upper,
                punctuation: !no_punctuation,
            };
            println!("{}", generate_password(length, classes)?);
            Ok(())
        }
        command => {
            let service = open_service(cli.data_dir)?;
            run(&service, command, cli.password).await
        }
    }
}

async fn run(
    service: &DatabaseService,
    command: Commands,
    password: Option<String>,
) -> Result<()> {
    match command {
        Commands::List => {
            let names: Vec<String> = service.list().await?.into_iter().map(|db| db.name).collect();
            println!("{}", serde_json::to_string_pretty(&names)?);
        }
        Commands::Create { name } => {
            let existing = service.store().names()?;
            let name = validate_new_name(&name, existing.iter().map(String::as_str))?;
            let pw = new_password(
                password.or_else(password_from_env),
                &format!("Password for {name}: "),
            )?;
            let db = Database::new(name.as_str(), pw, generate_salt(), RecordMap::new());
            service.create(&db).await?;
            println!("created {name}");
        }
        Commands::Show { name, reveal } => {
            let db = unlock(service, &name, password).await?;
            let accounts: Vec<_> = db
                .records
                .values()
                .map(|acc| {
                    let secret = if reveal { acc.password.as_str() } else { MASK };
                    json!({
                        "account": acc.account_name,
                        "name": acc.username,
                        "email": acc.email,
                        "password": secret,
                        "date": acc.date,
                        "comment": acc.comment,
                        "attached_files": acc.attached_files.keys().collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "name": db.name, "accounts": accounts }))?
            );
        }
        Commands::AddAccount {
            db,
            account,
            username,
            email,
            secret,
            date,
            comment,
        } => {
            let mut database = unlock(service, &db, password).await?;
            let secret = match secret {
                Some(secret) => secret,
                None => generate_password(16, CharClasses::default())?,
            };
            let date =
                date.unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());
            database.insert_account(Account::new(
                account.as_str(),
                username,
                email,
                secret,
                date,
                comment,
            ))?;
            service.save(&db, &database).await?;
            println!("added {account} to {db}");
        }
        Commands::RemoveAccount { db, account } => {
            let mut database = unlock(service, &db, password).await?;
            database.remove_account(&account)?;
            service.save(&db, &database).await?;
            println!("removed {account} from {db}");
        }
        Commands::Rename { db, new_name } => {
            let existing = service.store().names()?;
            let new_name = validate_rename(&db, &new_name, existing.iter().map(String::as_str))?;
            let mut database = unlock(service, &db, password).await?;
            database.name = new_name.clone();
            service.save(&db, &database).await?;
            println!("renamed {db} to {new_name}");
        }
        Commands::Passwd { db, new_password: next } => {
            let mut database = unlock(service, &db, password).await?;
            let next = new_password(next, &format!("New password for {db}: "))?;
            database.set_password(next);
            service.save(&db, &database).await?;
            println!("password of {db} changed");
        }
        Commands::Delete { name } => {
            if !service.store().exists(&name) {
                bail!("database not found: {name}");
            }
            service.delete(&name, password.as_deref()).await?;
            println!("deleted {name}");
        }
        Commands::Export { name, out } => {
            let out = out.unwrap_or_else(|| PathBuf::from(default_archive_name(&name)));
            service
                .export(&name, out.clone())
                .await
                .with_context(|| format!("export {name}"))?;
            println!("exported {name} to {}", out.display());
        }
        Commands::Import { file } => {
            let names = service
                .import(file.clone())
                .await
                .with_context(|| format!("import {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&names)?);
        }
        Commands::Generate { .. } => {}
    }
    Ok(())
}

fn open_service(data_dir: Option<PathBuf>) -> Result<DatabaseService> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => paths::data_dir()?,
    };
    let settings = StoreSettings::load_or_default(&data_dir)?;
    let keys: Arc<dyn KeyCache> = Arc::new(SharedKeyCache::new());
    let store = FileStore::open_dir(settings.storage_dir_in(&data_dir), keys)?
        .with_policy(settings.token_policy());
    Ok(DatabaseService::new(store))
}

async fn unlock(
    service: &DatabaseService,
    name: &str,
    password: Option<String>,
) -> Result<Database> {
    let password = existing_password(password, &format!("Password for {name}: "))?;
    match service.unlock(name, &password).await {
        PromptOutcome::Opened(db) => Ok(db),
        PromptOutcome::IncorrectPassword => bail!("incorrect password for {name}"),
        PromptOutcome::Corrupted => bail!("database {name} is corrupted"),
        PromptOutcome::Failed(message) => Err(anyhow!(message)),
        PromptOutcome::Superseded => bail!("unlock of {name} was superseded"),
    }
}

fn existing_password(given: Option<String>, prompt: &str) -> Result<String> {
    if let Some(pw) = given.or_else(password_from_env) {
        return Ok(pw);
    }
    rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))
}

fn new_password(given: Option<String>, prompt: &str) -> Result<String> {
    if let Some(pw) = given {
        validate_passwords(&pw, &pw)?;
        return Ok(pw);
    }
    let first = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    let second = rpassword::prompt_password("Confirm password: ")
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    validate_passwords(&first, &second)?;
    Ok(first)
}

fn password_from_env() -> Option<String> {
    std::env::var(PASSWORD_ENV).ok().filter(|pw| !pw.is_empty())
}
