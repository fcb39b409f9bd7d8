use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "beach-jetty",
    author,
    version,
    about = "Stream relay that pairs raw TCP peers with registered identities",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server options when no subcommand is given.
    #[command(flatten)]
    pub serve: ServeArgs,
}

impl Cli {
    /// Bare invocation runs the server.
    pub fn into_command(self) -> Commands {
        self.command.unwrap_or(Commands::Serve(self.serve))
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the transport acceptor and the registration endpoint
    Serve(ServeArgs),

    /// Operator console against a shared control plane
    Console(ConsoleArgs),

    /// Run one liveness pass and exit
    Reap(ReapArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Control plane backend: `memory` or a `redis://` URL.
    #[arg(long, env = "JETTY_STORE", default_value = "memory")]
    pub store: String,

    /// Key prefix used by the redis backend.
    #[arg(long, env = "JETTY_STORE_PREFIX", default_value = "jetty:")]
    pub store_prefix: String,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address peers connect their streams to.
    #[arg(long, env = "JETTY_TCP_LISTEN", default_value = "0.0.0.0:8081")]
    pub tcp_listen: String,

    /// Address of the registration and status endpoints.
    #[arg(long, env = "JETTY_HTTP_LISTEN", default_value = "0.0.0.0:5005")]
    pub http_listen: String,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Line sent to every new stream connection.
    #[arg(long, env = "JETTY_GREETING")]
    pub greeting: Option<String>,

    /// Seconds between liveness passes; 0 disables the periodic reaper.
    #[arg(long, env = "JETTY_REAP_INTERVAL_SECS", default_value_t = 300)]
    pub reap_interval_secs: u64,

    /// Wait after each liveness probe before reading output.
    #[arg(long, env = "JETTY_SETTLE_SECS", default_value_t = 2)]
    pub settle_secs: u64,

    /// Attach the operator console to this process.
    #[arg(long, default_value_t = false)]
    pub console: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "JETTY_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,

    /// Template file used by the attached console.
    #[arg(long, env = "JETTY_TEMPLATES", default_value = "command_templates.json")]
    pub templates: String,
}

#[derive(Args, Debug, Clone)]
pub struct ConsoleArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, env = "JETTY_TEMPLATES", default_value = "command_templates.json")]
    pub templates: String,

    /// How long a shell command waits for output.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,

    #[arg(long, env = "JETTY_SETTLE_SECS", default_value_t = 2)]
    pub settle_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ReapArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, env = "JETTY_SETTLE_SECS", default_value_t = 2)]
    pub settle_secs: u64,
}
