//! sentrygate CLI — headless interface to the gateway daemon.
//!
//! Grounded on the teacher's `cli.rs`: a `clap::Parser` top-level struct
//! with one `Subcommand` enum, narrowed from the teacher's full agent
//! runtime surface (daemon/agent/memory/identity/schedule/channel/
//! module/generate/gui/watch) down to the three things an operator of
//! this gateway actually needs: run it, validate a policy file, and
//! inspect the bearer token.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use sentrygate::config;
use sentrygate::gateway::auth;
use sentrygate::lifecycle;
use sentrygate::logging;

#[derive(Parser, Debug)]
#[command(name = "sentrygate", about = "Execution gateway for AI-agent tool calls", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway daemon in the foreground.
    Serve(ServeArgs),
    /// Validate a permission-policy file without starting the gateway.
    Policy(PolicyArgs),
    /// Inspect the daemon bearer token.
    Token(TokenArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the runtime config file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the permission-policy file.
    #[arg(long, value_name = "PATH")]
    policy: Option<PathBuf>,

    /// Run without TLS. Development only — refused unless passed explicitly.
    #[arg(long, default_value_t = false)]
    insecure: bool,
}

#[derive(Parser, Debug)]
struct PolicyArgs {
    #[command(subcommand)]
    action: PolicyAction,
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    /// Parse and compile a policy file, reporting any invalid rule patterns.
    Check {
        #[arg(long, value_name = "PATH")]
        policy: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
struct TokenArgs {
    #[command(subcommand)]
    action: TokenAction,
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    /// Print the path of the daemon bearer-token file (never its contents).
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Policy(args) => run_policy(args),
        Commands::Token(args) => run_token(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), sentrygate::error::GatewayError> {
    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let runtime_config = config::load_config(&config_path)?;
    config::require_tls_unless_insecure(&runtime_config, args.insecure)?;

    let policy_path = args.policy.unwrap_or_else(|| config_path.with_file_name("policy.toml"));
    let policy = config::load_policy(&policy_path)?;

    let gateway = lifecycle::build(&runtime_config, policy).await?;
    lifecycle::run(gateway).await
}

fn run_policy(args: PolicyArgs) -> Result<(), sentrygate::error::GatewayError> {
    let PolicyAction::Check { policy } = args.action;
    let policy_path = policy.unwrap_or_else(|| config::default_config_path().with_file_name("policy.toml"));
    let permissions = config::load_policy(&policy_path)?;
    let rule_count = permissions.rules.len();
    let default_count = permissions.defaults.len();
    sentrygate::policy::PermissionEngine::compile(&permissions)?;
    println!("{policy_path:?}: ok ({rule_count} rules, {default_count} defaults)");
    Ok(())
}

fn run_token(args: TokenArgs) -> Result<(), sentrygate::error::GatewayError> {
    let TokenAction::Show = args.action;
    // Ensure the token file exists before reporting its location, but never
    // print the secret itself — only its path.
    auth::load_or_create_token()?;
    println!("{}", auth::token_path().display());
    Ok(())
}
