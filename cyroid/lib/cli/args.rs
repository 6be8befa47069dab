use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `cyroid` deploys and manages isolated cyber ranges on a Docker host
#[derive(Debug, Parser)]
#[command(name = "cyroid", author, about, version, styles=styles::styles())]
pub struct CyroidArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<CyroidSubcommand>,

    /// Path to the range database (defaults to ~/.cyroid/cyroid.db)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Path to a YAML settings file
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands for managing ranges
#[derive(Debug, Parser)]
pub enum CyroidSubcommand {
    /// Create a draft range from a YAML definition
    #[command(name = "create")]
    Create {
        /// The range definition file
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,
    },

    /// Deploy a range: sandbox, router, networks, VMs and consoles
    #[command(name = "deploy")]
    Deploy {
        /// The range id
        range: Uuid,
    },

    /// Start a stopped range
    #[command(name = "start")]
    Start {
        /// The range id
        range: Uuid,
    },

    /// Stop a running range
    #[command(name = "stop")]
    Stop {
        /// The range id
        range: Uuid,
    },

    /// Remove everything a range deployed and return it to draft
    #[command(name = "teardown")]
    Teardown {
        /// The range id
        range: Uuid,
    },

    /// Run pre-flight checks against a range
    #[command(name = "validate")]
    Validate {
        /// The range id
        range: Uuid,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show ranges, or one range with its networks, VMs and router
    #[command(name = "status")]
    Status {
        /// The range id
        range: Option<Uuid>,
    },

    /// List the sandbox containers on the host
    #[command(name = "sandboxes")]
    Sandboxes,

    /// Print where a VM's console can be reached, forwarding it if needed
    #[command(name = "vnc")]
    Vnc {
        /// The VM id
        vm: Uuid,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_consistent() {
        CyroidArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_deploy_with_global_db() -> anyhow::Result<()> {
        let id = Uuid::new_v4();
        let args = CyroidArgs::try_parse_from([
            "cyroid",
            "deploy",
            &id.to_string(),
            "--db",
            "/tmp/ranges.db",
        ])?;

        assert_eq!(args.db, Some(PathBuf::from("/tmp/ranges.db")));
        assert!(matches!(args.subcommand, Some(CyroidSubcommand::Deploy { range }) if range == id));
        Ok(())
    }

    #[test]
    fn test_rejects_malformed_range_id() {
        assert!(CyroidArgs::try_parse_from(["cyroid", "stop", "not-a-uuid"]).is_err());
    }
}
