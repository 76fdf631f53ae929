use anyhow::{Context, Result, bail};
use cardvault::config::Config;
use cardvault::error::SyncError;
use cardvault::generate::{self, CharClass, DEFAULT_LENGTH};
use cardvault::secret::{KeyringStore, SecretStore};
use cardvault::sync::SyncHandle;
use cardvault::transport::CardTransport;
use cardvault::transport::emulator::EmulatedCard;
use cardvault::tree::{
    Entry, Group, NOTES, PASSWORD, SearchField, TITLE, URL, USERNAME, VaultTree,
};
use cardvault::{
    Compression, DEFAULT_VAULT_NAME, Storage, VaultSession, default_config_path,
    default_storage,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use zeroize::Zeroizing;

mod auth;

#[derive(Debug, Parser)]
#[command(name = "cardvault")]
#[command(
    version,
    about = "KDBX3 password vault kept on a Bluetooth hardware card."
)]
struct Cli {
    /// Path to a local vault file
    #[arg(long, global = true, value_name = "PATH", env = "CARDVAULT_FILE")]
    file: Option<PathBuf>,

    /// Directory backing an emulated card
    #[arg(long, global = true, value_name = "DIR", env = "CARDVAULT_CARD")]
    card: Option<PathBuf>,

    /// Path to a JSON config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Remember the vault password in the OS keychain
    #[arg(long, global = true, default_value_t = false)]
    remember: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Field {
    Title,
    Username,
    Url,
    Notes,
}

impl From<Field> for SearchField {
    fn from(f: Field) -> Self {
        match f {
            Field::Title => SearchField::Title,
            Field::Username => SearchField::Username,
            Field::Url => SearchField::Url,
            Field::Notes => SearchField::Notes,
        }
    }
}

#[derive(Debug, clap::Args)]
struct EntryFields {
    #[arg(short, long)]
    username: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Set a random 32-character password
    #[arg(long, conflicts_with = "password", default_value_t = false)]
    generate: bool,

    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, clap::Args)]
struct GeneratorArgs {
    /// Password length (10 to 200)
    #[arg(short, long, default_value_t = DEFAULT_LENGTH)]
    length: usize,

    /// Upper-case letters
    #[arg(long)]
    upper: bool,

    /// Lower-case letters
    #[arg(long)]
    lower: bool,

    /// Digits
    #[arg(long)]
    digits: bool,

    #[arg(long)]
    dash: bool,

    #[arg(long)]
    underscore: bool,

    #[arg(long)]
    space: bool,

    /// Special characters: `~!@#$%^&*+=
    #[arg(long)]
    special: bool,

    /// Brackets: ()[]{}
    #[arg(long)]
    brackets: bool,
}

impl GeneratorArgs {
    /// Selected classes, or upper, lower and digits when none is given.
    fn classes(&self) -> Vec<CharClass> {
        let flags = [
            (self.upper, CharClass::Upper),
            (self.lower, CharClass::Lower),
            (self.digits, CharClass::Digits),
            (self.dash, CharClass::Dash),
            (self.underscore, CharClass::Underscore),
            (self.space, CharClass::Space),
            (self.special, CharClass::Special),
            (self.brackets, CharClass::Brackets),
        ];
        let chosen: Vec<CharClass> = flags
            .into_iter()
            .filter_map(|(on, class)| on.then_some(class))
            .collect();
        if chosen.is_empty() {
            CharClass::DEFAULT.to_vec()
        } else {
            chosen
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates a new empty vault
    Init {
        /// Name of the root group
        #[arg(long, default_value = DEFAULT_VAULT_NAME)]
        name: String,

        /// AES key transform rounds (at least 80000)
        #[arg(long)]
        rounds: Option<u64>,

        /// Store the payload uncompressed
        #[arg(long, default_value_t = false)]
        no_gzip: bool,
    },

    /// Lists groups and entries
    List {
        /// Print entry UUIDs as well
        #[arg(short, long, default_value_t = false)]
        all: bool,
    },

    /// Shows one entry
    #[command(arg_required_else_help = true)]
    Show {
        /// Entry title or UUID
        entry: String,

        /// Print the password in clear text
        #[arg(long, default_value_t = false)]
        reveal: bool,
    },

    /// Adds an entry
    #[command(arg_required_else_help = true)]
    Add {
        title: String,

        /// Parent group name or UUID (default: root)
        #[arg(short, long)]
        group: Option<String>,

        #[command(flatten)]
        fields: EntryFields,
    },

    /// Changes fields of an entry, keeping the old version in its history
    #[command(arg_required_else_help = true)]
    Edit {
        /// Entry title or UUID
        entry: String,

        /// New title
        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        fields: EntryFields,
    },

    /// Removes an entry
    #[command(arg_required_else_help = true)]
    Remove { entry: String },

    /// Creates a group
    #[command(arg_required_else_help = true)]
    Mkgroup {
        name: String,

        /// Parent group name or UUID (default: root)
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Removes a group and everything in it
    #[command(arg_required_else_help = true)]
    Rmgroup { group: String },

    /// Searches entries, ignoring case
    #[command(arg_required_else_help = true)]
    Search {
        query: String,

        /// Fields to search (default: all)
        #[arg(short, long, value_enum)]
        field: Vec<Field>,
    },

    /// Shows information about the vault
    Info,

    /// Changes the vault password
    Passwd,

    /// Changes key transform rounds or compression of the vault
    Settings {
        /// AES key transform rounds (at least 80000)
        #[arg(long)]
        rounds: Option<u64>,

        /// Compress the payload with gzip
        #[arg(long, conflicts_with = "no_gzip", default_value_t = false)]
        gzip: bool,

        /// Store the payload uncompressed
        #[arg(long, default_value_t = false)]
        no_gzip: bool,
    },

    /// Prints a random password
    Generate {
        #[command(flatten)]
        options: GeneratorArgs,
    },

    /// Deletes the remembered password from the OS keychain
    Forget,
}

/// Where the container lives.
enum Backend {
    File(Storage),
    Card(SyncHandle),
}

impl Backend {
    fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        if let Some(dir) = &cli.card {
            let transport = CardTransport::new(EmulatedCard::new(dir), config.transport_settings());
            return Ok(Backend::Card(SyncHandle::spawn(
                transport,
                config.sync_settings(),
            )));
        }
        match &cli.file {
            Some(p) => Ok(Backend::File(Storage::new(p.clone()))),
            None => Ok(Backend::File(default_storage()?)),
        }
    }

    async fn exists(&self, password: &str) -> Result<bool> {
        match self {
            Backend::File(storage) => Ok(storage.exists()),
            Backend::Card(sync) => match sync.load(password).await {
                Ok(_) => Ok(true),
                Err(SyncError::DatabaseNotFound) => Ok(false),
                Err(SyncError::Vault(_)) => Ok(true),
                Err(e) => Err(e).context("failed to reach card"),
            },
        }
    }

    async fn open(&self, password: &str) -> Result<VaultSession> {
        match self {
            Backend::File(storage) => {
                if !storage.exists() {
                    bail!("vault {} does not exist", storage.path().display());
                }
                let raw = storage.load()?;
                VaultSession::open(&raw, password).context("failed to open vault")
            }
            Backend::Card(sync) => sync.load(password).await.context("failed to load vault from card"),
        }
    }

    async fn save(&self, session: &mut VaultSession) -> Result<()> {
        match self {
            Backend::File(storage) => {
                let raw = session.encrypt().context("failed to encrypt vault")?;
                storage.save(&raw)
            }
            Backend::Card(sync) => sync.save(session).await.context("failed to save vault to card"),
        }
    }
}

fn find_entry(tree: &VaultTree, needle: &str) -> Result<Entry> {
    if let Ok(uuid) = Uuid::parse_str(needle) {
        if let Some(entry) = tree.entry(uuid) {
            return Ok(entry.clone());
        }
    }

    let matches: Vec<&Entry> = tree
        .entries()
        .into_iter()
        .filter(|e| e.title().eq_ignore_ascii_case(needle))
        .collect();

    match matches.as_slice() {
        [] => bail!("entry '{needle}' not found"),
        [entry] => Ok((*entry).clone()),
        _ => bail!("several entries are titled '{needle}', use the UUID"),
    }
}

fn all_groups(group: &Group) -> Vec<&Group> {
    let mut out = vec![group];
    for child in &group.groups {
        out.extend(all_groups(child));
    }
    out
}

fn find_group(tree: &VaultTree, needle: Option<&str>) -> Result<Uuid> {
    let Some(needle) = needle else {
        return Ok(tree.root().uuid);
    };
    if let Ok(uuid) = Uuid::parse_str(needle) {
        if tree.group(uuid).is_some() {
            return Ok(uuid);
        }
    }

    let matches: Vec<Uuid> = all_groups(tree.root())
        .into_iter()
        .filter(|g| g.name.eq_ignore_ascii_case(needle))
        .map(|g| g.uuid)
        .collect();

    match matches.as_slice() {
        [] => bail!("group '{needle}' not found"),
        [uuid] => Ok(*uuid),
        _ => bail!("several groups are named '{needle}', use the UUID"),
    }
}

fn apply_fields(entry: &mut Entry, fields: EntryFields) -> Result<()> {
    if let Some(v) = fields.username {
        entry.set_field(USERNAME, &v, false);
    }
    if let Some(v) = fields.password {
        entry.set_field(PASSWORD, &v, true);
    }
    if fields.generate {
        let password = generate::generate(DEFAULT_LENGTH, &CharClass::DEFAULT)?;
        entry.set_field(PASSWORD, &password, true);
    }
    if let Some(v) = fields.url {
        entry.set_field(URL, &v, false);
    }
    if let Some(v) = fields.notes {
        entry.set_field(NOTES, &v, false);
    }
    Ok(())
}

fn print_group(group: &Group, depth: usize, all: bool) {
    let indent = "  ".repeat(depth);
    println!("{indent}{}/", group.name);
    for entry in &group.entries {
        let user = match entry.username() {
            "" => String::new(),
            u => format!("  ({u})"),
        };
        if all {
            println!("{indent}  {}{user}  {}", entry.title(), entry.uuid);
        } else {
            println!("{indent}  {}{user}", entry.title());
        }
    }
    for child in &group.groups {
        print_group(child, depth + 1, all);
    }
}

fn print_entry(entry: &Entry, reveal: bool) {
    let password = if reveal {
        entry.password().to_string()
    } else if entry.password().is_empty() {
        String::new()
    } else {
        "********".to_string()
    };

    println!("Title:     {}", entry.title());
    println!("Username:  {}", entry.username());
    println!("Password:  {password}");
    println!("URL:       {}", entry.url());
    println!("Notes:     {}", entry.notes());
    println!("UUID:      {}", entry.uuid);
    println!(
        "Modified:  {}",
        entry.times.last_modification.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("History:   {} version(s)", entry.history.len());
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Cli::parse();
    if let Commands::Generate { options } = &args.command {
        let password = generate::generate(options.length, &options.classes())?;
        println!("{}", password.as_str());
        return Ok(());
    }

    let config = Config::load(args.config.as_deref(), default_config_path().ok())
        .context("failed to load configuration")?;
    let keychain = KeyringStore::new();
    let remembered: Option<&dyn SecretStore> = if args.remember {
        Some(&keychain)
    } else {
        None
    };

    match &args.command {
        Commands::Forget => {
            keychain.delete().context("failed to delete remembered password")?;
            println!("remembered password deleted");
            return Ok(());
        }
        Commands::Settings {
            rounds: None,
            gzip: false,
            no_gzip: false,
        } => bail!("nothing to change, pass --rounds, --gzip or --no-gzip"),
        _ => {}
    }

    let backend = Backend::resolve(&args, &config)?;

    if let Commands::Init {
        name,
        rounds,
        no_gzip,
    } = &args.command
    {
        let password = auth::read_new_password()?;
        if backend.exists(&password).await? {
            bail!("vault already exists");
        }

        let kdf = match rounds {
            Some(r) => cardvault::KdfParams::new(*r)?,
            None => config.kdf()?,
        };
        let compression = if *no_gzip {
            Compression::None
        } else {
            config.compression()
        };

        let mut session = VaultSession::create_with(&password, name, kdf, compression)?;
        backend.save(&mut session).await?;
        remember(remembered, &password)?;
        println!("vault initialized");
        return Ok(());
    }

    let password = auth::read_password(remembered)?;
    let mut session = backend.open(&password).await?;
    remember(remembered, &password)?;

    match args.command {
        Commands::Init { .. } | Commands::Forget | Commands::Generate { .. } => {}
        Commands::List { all } => {
            print_group(session.tree().root(), 0, all);
        }
        Commands::Show { entry, reveal } => {
            let entry = find_entry(session.tree(), &entry)?;
            print_entry(&entry, reveal);
        }
        Commands::Add {
            title,
            group,
            fields,
        } => {
            let parent = find_group(session.tree(), group.as_deref())?;
            let mut entry = Entry::new(&title);
            apply_fields(&mut entry, fields)?;
            session.tree_mut().try_add_entry(parent, entry)?;
            backend.save(&mut session).await?;
            println!("added entry '{title}'");
        }
        Commands::Edit {
            entry,
            title,
            fields,
        } => {
            let mut updated = find_entry(session.tree(), &entry)?;
            updated.snapshot();
            if let Some(t) = &title {
                updated.set_field(TITLE, t, false);
            }
            apply_fields(&mut updated, fields)?;
            updated.times.touch();
            session.tree_mut().try_update_entry(updated)?;
            backend.save(&mut session).await?;
            println!("entry '{entry}' updated");
        }
        Commands::Remove { entry } => {
            let uuid = find_entry(session.tree(), &entry)?.uuid;
            session.tree_mut().try_delete_entry(uuid)?;
            backend.save(&mut session).await?;
            println!("entry '{entry}' removed");
        }
        Commands::Mkgroup { name, parent } => {
            let parent = find_group(session.tree(), parent.as_deref())?;
            session.tree_mut().try_add_group(parent, Group::new(&name))?;
            backend.save(&mut session).await?;
            println!("group '{name}' created");
        }
        Commands::Rmgroup { group } => {
            let uuid = find_group(session.tree(), Some(&group))?;
            if uuid == session.tree().root().uuid {
                bail!("the root group cannot be removed");
            }
            session.tree_mut().try_delete_group(uuid)?;
            backend.save(&mut session).await?;
            println!("group '{group}' removed");
        }
        Commands::Search { query, field } => {
            let fields: Vec<SearchField> = if field.is_empty() {
                SearchField::ALL.to_vec()
            } else {
                field.into_iter().map(SearchField::from).collect()
            };
            let results = session.tree().search(&query, &fields);
            if results.is_empty() {
                println!("no matches");
                return Ok(());
            }
            for f in fields {
                for entry in results.bucket(f) {
                    println!("{:<9} {}  {}", format!("{f:?}:"), entry.title(), entry.uuid);
                }
            }
        }
        Commands::Info => {
            println!("{}", session.info());
        }
        Commands::Passwd => {
            let new_password: Zeroizing<String> = auth::read_new_password_with_confirmation()?;
            session.set_password(&new_password);
            backend.save(&mut session).await?;
            remember(remembered, &new_password)?;
            println!("password changed");
        }
        Commands::Settings {
            rounds,
            gzip,
            no_gzip,
        } => {
            if let Some(r) = rounds {
                session.set_transform_rounds(r)?;
            }
            if gzip {
                session.set_compression(Compression::Gzip);
            } else if no_gzip {
                session.set_compression(Compression::None);
            }
            backend.save(&mut session).await?;
            println!("settings updated");
        }
    }

    Ok(())
}

fn remember(store: Option<&dyn SecretStore>, password: &str) -> Result<()> {
    if let Some(store) = store {
        store
            .set(password)
            .context("failed to remember password")?;
    }
    Ok(())
}
