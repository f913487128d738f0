//! Command-line interface for mongodump
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and CLI overrides
//! - Connection string construction
//! - Translation of flags into [`DumpOptions`]

use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::config::{Config, LogLevel};
use crate::dump::{DumpOptions, DumpSettings, OutputTarget, parse_query};
use crate::error::Result;

pub mod completion;

/// Point-in-time streaming backup of a MongoDB deployment
#[derive(Parser, Debug)]
#[command(
    name = "mongodump",
    version,
    about = "Dump MongoDB databases and collections to BSON files",
    long_about = "Dump an entire deployment, a database or a single collection to a directory of
BSON files with JSON metadata, optionally capturing the oplog written during the dump."
)]
pub struct CliArgs {
    /// MongoDB connection URI
    ///
    /// Format: mongodb://[username:password@]host[:port][/database][?options]
    #[arg(value_name = "URI")]
    pub uri: Option<String>,

    /// Server to connect to
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Port to connect to
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Username for authentication
    #[arg(short = 'u', long, value_name = "USERNAME")]
    pub username: Option<String>,

    /// Password for authentication
    #[arg(short = 'p', long, value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Database that holds the user's credentials
    #[arg(
        long = "authenticationDatabase",
        visible_alias = "auth-database",
        value_name = "NAME"
    )]
    pub auth_database: Option<String>,

    /// Database to dump
    #[arg(short = 'd', long = "db", value_name = "NAME")]
    pub db: Option<String>,

    /// Collection to dump (requires --db)
    #[arg(short = 'c', long, value_name = "NAME")]
    pub collection: Option<String>,

    /// Query filter as extended JSON (requires --collection)
    #[arg(short = 'q', long, value_name = "JSON")]
    pub query: Option<String>,

    /// Output directory, or '-' for stdout
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    pub out: Option<String>,

    /// Capture oplog entries written during the dump
    #[arg(long)]
    pub oplog: bool,

    /// Dump the users and roles defined on --db
    #[arg(long = "dumpDbUsersAndRoles")]
    pub dump_users_and_roles: bool,

    /// Scan collections in natural order instead of by _id
    #[arg(long = "forceTableScan")]
    pub force_table_scan: bool,

    /// Collection to skip (repeatable)
    #[arg(long = "excludeCollection", value_name = "NAME")]
    pub exclude_collection: Vec<String>,

    /// Skip collections starting with this prefix (repeatable)
    #[arg(long = "excludeCollectionsWithPrefix", value_name = "PREFIX")]
    pub exclude_collections_with_prefix: Vec<String>,

    /// Configuration file path
    #[arg(long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Connection timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Quiet mode (errors only)
    #[arg(long)]
    pub quiet: bool,

    /// Verbose mode (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv")]
    pub very_verbose: bool,

    /// Disable progress spinners
    #[arg(long = "no-progress")]
    pub no_progress: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands for mongodump
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show version information
    Version,

    /// Generate shell completion script
    Completion {
        /// Shell type
        #[arg(value_enum, value_name = "SHELL")]
        shell: Shell,
    },
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded configuration
    config: Config,
}

impl CliInterface {
    /// Parse process arguments and load the configuration
    ///
    /// # Returns
    /// * `Result<Self>` - New CLI interface or error
    pub fn new() -> Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    /// Build the interface from already parsed arguments.
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Self::load_config(&args)?;
        Ok(Self { args, config })
    }

    /// Load configuration from file and merge with arguments
    fn load_config(args: &CliArgs) -> Result<Config> {
        let mut config = Config::load_from_file(args.config_file.as_deref())?;
        config.validate()?;
        Self::apply_args_to_config(&mut config, args);
        Ok(config)
    }

    /// Apply CLI arguments to configuration
    fn apply_args_to_config(config: &mut Config, args: &CliArgs) {
        config.logging.level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else if args.quiet {
            LogLevel::Error
        } else {
            config.logging.level
        };

        if let Some(timeout) = args.timeout {
            config.connection.timeout = timeout;
        }
        if args.no_progress || args.quiet {
            config.dump.show_progress = false;
        }
    }

    /// Get the MongoDB connection URI
    ///
    /// Priority:
    /// 1. Explicit URI argument
    /// 2. Built from --host, --port, --username and friends
    /// 3. `connection.default_uri` from the configuration
    pub fn get_connection_uri(&self) -> String {
        if let Some(uri) = &self.args.uri {
            return uri.clone();
        }
        if self.args.host.is_some() || self.args.port.is_some() || self.args.username.is_some() {
            return self.build_connection_uri();
        }
        self.config.connection.default_uri.clone()
    }

    /// Build connection URI from individual arguments
    ///
    /// `mongodb://[username[:password]@]host:port[/?authSource=db]`
    fn build_connection_uri(&self) -> String {
        let mut uri = String::from("mongodb://");

        if let Some(username) = &self.args.username {
            uri.push_str(username);
            if let Some(password) = &self.args.password {
                uri.push(':');
                uri.push_str(password);
            }
            uri.push('@');
        }

        uri.push_str(self.args.host.as_deref().unwrap_or("localhost"));
        uri.push(':');
        uri.push_str(&self.args.port.unwrap_or(27017).to_string());

        if self.args.username.is_some() {
            uri.push_str("/?authSource=");
            uri.push_str(self.args.auth_database.as_deref().unwrap_or("admin"));
        }

        uri
    }

    /// Translate dump flags into options
    ///
    /// # Returns
    /// * `Result<DumpOptions>` - Options, or a configuration error for a bad query
    pub fn dump_options(&self) -> Result<DumpOptions> {
        let query = self
            .args
            .query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .map(parse_query)
            .transpose()?;

        let output = match &self.args.out {
            Some(out) => OutputTarget::parse(out),
            None => OutputTarget::Directory(self.config.dump.out_dir.clone()),
        };

        Ok(DumpOptions {
            db: self.args.db.clone(),
            collection: self.args.collection.clone(),
            query,
            force_table_scan: self.args.force_table_scan,
            output,
            oplog: self.args.oplog,
            dump_users_and_roles: self.args.dump_users_and_roles,
            excluded_collections: self.args.exclude_collection.clone(),
            excluded_collection_prefixes: self.args.exclude_collections_with_prefix.clone(),
        })
    }

    pub fn dump_settings(&self) -> DumpSettings {
        DumpSettings::from(&self.config.dump)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle subcommands
    ///
    /// # Returns
    /// * `Result<bool>` - True if a subcommand ran and the process should exit
    pub fn handle_subcommand(&self) -> Result<bool> {
        match &self.args.command {
            Some(Commands::Version) => {
                println!("mongodump version {}", env!("CARGO_PKG_VERSION"));
                println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
                Ok(true)
            }
            Some(Commands::Completion { shell }) => {
                completion::generate_completion(*shell, &mut io::stdout())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
