//! # Development VM provisioning CLI
//!
//! Command line tool that provisions a cloud VM for development and installs
//! the toolchain on it.

use std::ffi::OsString;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::config::OnFailure;
use crate::naming::DEFAULT_PREFIX;

/// Provision a new VM, or resume an earlier run
#[derive(Debug, Parser)]
pub(crate) struct ProvisionOpts {
    /// Prefix for every generated resource name.
    ///
    /// Lowercase letters, digits and '-', starting with a letter, at most 16 characters.
    #[clap(default_value = DEFAULT_PREFIX)]
    pub(crate) prefix: String,

    /// Cloud region; overrides the configuration file.
    #[clap(long)]
    pub(crate) region: Option<String>,

    /// Read configuration from this file only.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Continue the run that created this VM, skipping completed steps.
    #[clap(long, value_name = "VM", conflicts_with = "region")]
    pub(crate) resume: Option<String>,

    /// After provisioning, install the toolchain on the VM.
    #[clap(long)]
    pub(crate) bootstrap: bool,

    /// What to do with created resources if a step fails.
    #[clap(long, value_enum)]
    pub(crate) on_failure: Option<OnFailure>,
}

/// Install the development toolchain on this machine
#[derive(Debug, Parser)]
pub(crate) struct BootstrapOpts {
    /// Read configuration from this file only.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Print the steps that would run, in order, and exit.
    #[clap(long)]
    pub(crate) list: bool,

    /// Ignore saved progress and check every step again.
    #[clap(long)]
    pub(crate) fresh: bool,
}

/// Check prerequisites without changing anything
#[derive(Debug, Parser)]
pub(crate) struct CheckOpts {
    /// Check the prerequisites for `bootstrap` instead of `provision`.
    #[clap(long)]
    pub(crate) bootstrap: bool,

    /// Read configuration from this file only.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,
}

/// Show the saved state of a provisioning run
#[derive(Debug, Parser)]
pub(crate) struct StatusOpts {
    /// The VM name printed when the run started.
    pub(crate) vm: String,

    /// Output in JSON format.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Delete everything a provisioning run created
#[derive(Debug, Parser)]
pub(crate) struct CleanupOpts {
    /// The VM name printed when the run started.
    pub(crate) vm: String,

    /// Read configuration from this file only.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,
}

/// Provision a cloud development VM and set it up.
///
/// A run creates an SSH key pair, a resource group with a public IP and a VM,
/// moves SSH to a custom port, writes a local SSH host entry, forwards Git
/// credentials and clones the project repositories. Progress is saved after
/// every step.
#[derive(Debug, Parser)]
#[clap(name = "devbox", version)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Provision a VM.
    Provision(ProvisionOpts),
    /// Install the development toolchain on the local machine.
    ///
    /// This is what `provision --bootstrap` runs on the VM; it needs root
    /// or passwordless sudo.
    Bootstrap(BootstrapOpts),
    /// Verify that required tools and environment variables are present.
    Check(CheckOpts),
    /// Display the saved state of a run.
    Status(StatusOpts),
    /// Delete the resources, keys and host entry created by a run.
    Cleanup(CleanupOpts),
}

fn check(opts: &CheckOpts) -> Result<()> {
    if opts.bootstrap {
        crate::bootstrap::check()?;
    } else {
        let home = crate::utils::home_dir()?;
        let config = crate::config::load_config(opts.config.as_deref(), &home)?;
        crate::provision::requirements(&config).check()?;
    }
    println!("All prerequisites present");
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Provision(opts) => crate::provision::run_provision(&opts),
        Opt::Bootstrap(opts) => crate::bootstrap::run_bootstrap(&opts),
        Opt::Check(opts) => check(&opts),
        Opt::Status(opts) => crate::status::status(&opts),
        Opt::Cleanup(opts) => crate::provision::run_cleanup(&opts),
    }
}

#[test]
fn test_parse_provision_args() {
    let o = Opt::try_parse_from(["devbox", "provision"]).unwrap();
    let o = match o {
        Opt::Provision(o) => o,
        o => panic!("Expected provision opts, not {o:?}"),
    };
    assert_eq!(o.prefix, DEFAULT_PREFIX);
    assert!(o.on_failure.is_none());

    let o = Opt::try_parse_from([
        "devbox",
        "provision",
        "demo1",
        "--region",
        "westus2",
        "--on-failure",
        "rollback",
    ])
    .unwrap();
    let o = match o {
        Opt::Provision(o) => o,
        o => panic!("Expected provision opts, not {o:?}"),
    };
    assert_eq!(o.prefix, "demo1");
    assert_eq!(o.region.as_deref(), Some("westus2"));
    assert_eq!(o.on_failure, Some(OnFailure::Rollback));

    assert!(
        Opt::try_parse_from(["devbox", "provision", "--resume", "x", "--region", "y"]).is_err()
    );
}

#[test]
fn test_parse_status_args() {
    let o = Opt::try_parse_from(["devbox", "status", "demo1-vm-abc", "--json"]).unwrap();
    match o {
        Opt::Status(o) => {
            assert_eq!(o.vm, "demo1-vm-abc");
            assert!(o.json);
        }
        o => panic!("Expected status opts, not {o:?}"),
    }
    assert!(Opt::try_parse_from(["devbox", "cleanup"]).is_err());
}
