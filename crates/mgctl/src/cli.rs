use api_types::VisibilityLevel;
use clap::Parser;
use clap::Subcommand;
use utils::version;

/// Operator client for the metagpu device plugin management API.
#[derive(Parser, Debug)]
#[command(about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "MGCTL_ADDR",
        default_value = "localhost:50052",
        help = "Address of the device plugin management API"
    )]
    pub addr: String,

    #[arg(
        long,
        global = true,
        env = "MGCTL_TOKEN",
        hide_env_values = true,
        help = "Token presented to the management API"
    )]
    pub token: Option<String>,

    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect or kill GPU processes
    #[command(subcommand)]
    Process(ProcessCommand),
    /// Check that the management API answers
    Ping,
    /// Manage access tokens
    #[command(subcommand)]
    Token(TokenCommand),
}

#[derive(Subcommand, Debug)]
pub enum ProcessCommand {
    /// List GPU processes
    List {
        /// Keep the table updated from the server stream
        #[arg(long, short, default_value_t = false)]
        watch: bool,
        /// Pod to scope the listing to, ignored for device level tokens
        #[arg(long, env = "HOSTNAME")]
        pod_id: Option<String>,
    },
    /// Kill a GPU process
    Kill {
        pid: u32,
        #[arg(long, env = "HOSTNAME")]
        pod_id: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Sign a new visibility token
    Create {
        #[arg(long)]
        level: VisibilityLevel,
        #[arg(long)]
        pod_id: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        /// Lifetime in seconds, the token never expires when unset
        #[arg(long)]
        ttl_secs: Option<u64>,
        #[arg(long, env = "MGCTL_JWT_SECRET", hide_env_values = true)]
        secret: String,
    },
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn process_list_parses_watch_and_pod() {
        let cli = Cli::parse_from(["mgctl", "process", "list", "--watch", "--pod-id", "pod-a"]);

        let Command::Process(ProcessCommand::List { watch, pod_id }) = cli.command else {
            panic!("expected process list");
        };
        assert!(watch);
        assert_eq!(pod_id.as_deref(), Some("pod-a"));
        assert_eq!(cli.addr, "localhost:50052");
    }

    #[test]
    fn token_level_accepts_names_and_claim_values() {
        let by_name = Cli::parse_from([
            "mgctl", "token", "create", "--level", "device", "--secret", "s",
        ]);
        let by_claim = Cli::parse_from(["mgctl", "token", "create", "--level", "l1", "--secret", "s"]);

        let level = |cli: Cli| match cli.command {
            Command::Token(TokenCommand::Create { level, .. }) => level,
            other => panic!("unexpected command {other:?}"),
        };
        assert_eq!(level(by_name), VisibilityLevel::Device);
        assert_eq!(level(by_claim), VisibilityLevel::Container);
    }
}
