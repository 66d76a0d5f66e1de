use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "atmos",
    about = "Run terraform for a working group with filtered output and an IPC callback channel",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Working group to operate on
    #[arg(short = 'g', long, default_value = "main", global = true)]
    pub group: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run terraform in the working group's working directory
    Tf {
        /// Do not generate the backend configuration
        #[arg(long)]
        skip_backend: bool,

        /// Do not export secrets as TF_VAR_* variables
        #[arg(long)]
        skip_secrets: bool,

        /// Run `terraform get` before the command
        #[arg(long)]
        get_modules: bool,

        /// Arguments passed to terraform
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show the resolved harness settings
    Config {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}
