use clap::{Args, Parser, Subcommand};

pub mod daemon;
pub mod error;
pub mod handler;
pub mod output;

/// Filepool - persistent download queue and local cache for course files
#[derive(Parser, Debug)]
#[command(name = "filepool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Override config directory path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<std::path::PathBuf>,

    /// Enable verbose logging (TRACE level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by the commands that act on one remote file
#[derive(Args, Debug, Clone, Default)]
pub struct FileArgs {
    /// Component that uses the file (e.g. mod_resource)
    #[arg(long)]
    pub component: Option<String>,

    /// Instance of the component
    #[arg(long)]
    pub component_id: Option<String>,

    /// Revision reported by the server
    #[arg(long, default_value_t = 0)]
    pub revision: i64,

    /// Modification time reported by the server (epoch seconds)
    #[arg(long, default_value_t = 0)]
    pub timemodified: i64,

    /// Destination relative to the site directory
    #[arg(long)]
    pub path: Option<String>,

    /// Web-service token of the site
    #[arg(long)]
    pub token: Option<String>,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the URL to use for a file (local copy when current)
    Url {
        site: String,
        url: String,

        #[command(flatten)]
        file: FileArgs,

        /// Accept an outdated local copy
        #[arg(long)]
        ignore_stale: bool,
    },

    /// Print the local path to use for a file (remote URL when not current)
    Src {
        site: String,
        url: String,

        #[command(flatten)]
        file: FileArgs,

        /// Accept an outdated local copy
        #[arg(long)]
        ignore_stale: bool,
    },

    /// Download a file now, bypassing the queue
    Download {
        site: String,
        url: String,

        #[command(flatten)]
        file: FileArgs,
    },

    /// Add a file to the download queue
    Enqueue {
        site: String,
        url: String,

        #[command(flatten)]
        file: FileArgs,

        /// Priority value (0-999, higher = sooner)
        #[arg(long)]
        priority: Option<i64>,
    },

    /// Show the pool state of a file
    State {
        site: String,
        url: String,

        #[arg(long, default_value_t = 0)]
        revision: i64,

        #[arg(long, default_value_t = 0)]
        timemodified: i64,
    },

    /// List queued files
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Process the queue until it is empty
    Run {
        /// Keep processing until Ctrl+C
        #[arg(long)]
        daemon: bool,
    },

    /// Mark pooled files stale
    Invalidate {
        site: String,

        /// A single file
        #[arg(long, conflicts_with_all = ["component", "all"])]
        url: Option<String>,

        /// Files linked to a component
        #[arg(long)]
        component: Option<String>,

        #[arg(long, requires = "component")]
        component_id: Option<String>,

        /// Every file of the site
        #[arg(long)]
        all: bool,

        /// Only files whose freshness cannot be judged from revision data
        #[arg(long)]
        only_unknown: bool,
    },

    /// Remove pooled files and their local copies
    Remove {
        site: String,

        /// A single file
        #[arg(long, conflicts_with = "component")]
        url: Option<String>,

        /// Files linked to a component
        #[arg(long)]
        component: Option<String>,

        #[arg(long, requires = "component")]
        component_id: Option<String>,
    },

    /// Manage packages
    Package {
        /// Package action
        #[command(subcommand)]
        action: PackageAction,
    },
}

/// Package actions
#[derive(Subcommand, Debug)]
pub enum PackageAction {
    /// Show package status
    Status {
        site: String,
        component: String,

        #[arg(long)]
        component_id: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download every file of a package now
    Download {
        site: String,

        #[command(flatten)]
        package: PackageArgs,
    },

    /// Queue every file of a package and wait for the queue
    Prefetch {
        site: String,

        #[command(flatten)]
        package: PackageArgs,
    },

    /// Estimate how much downloading a package would transfer
    Size {
        site: String,

        #[command(flatten)]
        package: PackageArgs,
    },

    /// Roll back packages left downloading by an interrupted run
    Restore { site: String },
}

#[derive(Args, Debug, Clone)]
pub struct PackageArgs {
    pub component: String,

    #[arg(long)]
    pub component_id: Option<String>,

    /// JSON file with the package files ([{"url": ..., "path": ..., "timemodified": ...}])
    #[arg(long, value_name = "FILE")]
    pub files: std::path::PathBuf,

    /// Opaque payload stored with the downloaded status
    #[arg(long)]
    pub extra: Option<String>,

    /// Site-relative directory receiving the files
    #[arg(long)]
    pub dir: Option<String>,

    /// Web-service token of the site
    #[arg(long)]
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "filepool",
            "enqueue",
            "site1",
            "https://lms.test/a.pdf",
            "--priority",
            "10",
            "--component",
            "mod_resource",
            "--component-id",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue { site, priority, file, .. } => {
                assert_eq!(site, "site1");
                assert_eq!(priority, Some(10));
                assert_eq!(file.component.as_deref(), Some("mod_resource"));
                assert_eq!(file.component_id.as_deref(), Some("4"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_package_download() {
        let cli = Cli::try_parse_from([
            "filepool",
            "-v",
            "package",
            "download",
            "site1",
            "mod_book",
            "--component-id",
            "7",
            "--files",
            "files.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Package {
                action: PackageAction::Download { .. }
            }
        ));
    }

    #[test]
    fn test_invalidate_url_conflicts_with_all() {
        let result = Cli::try_parse_from([
            "filepool",
            "invalidate",
            "site1",
            "--url",
            "https://lms.test/a",
            "--all",
        ]);
        assert!(result.is_err());
    }
}
