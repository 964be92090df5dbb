use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::graph::{EdgeKind, NodeKind};

#[derive(Debug, Parser)]
#[command(
    name = "atlas-graph",
    version,
    about = "CI/CD dependency graph builder",
    long_about = "Normalize CI/CD entities from many source systems into one dependency graph per scope, then traverse it safely, score its documentation coverage and detect documentation drift."
)]
pub struct Cli {
    /// Only log warnings and errors
    #[arg(short, long, global = true, default_value_t = false)]
    pub quiet: bool,
    /// More detail in logs and tables (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrderArg {
    Dfs,
    Bfs,
    Topo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetricArg {
    In,
    Out,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormatArg {
    Json,
    Graphml,
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DotThemeArg {
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[allow(clippy::upper_case_acronyms)]
pub enum DotRankDirArg {
    LR,
    TB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnOffArg {
    On,
    Off,
}

fn parse_edge_kind(s: &str) -> Result<EdgeKind, String> {
    EdgeKind::parse(s).ok_or_else(|| {
        let known: Vec<&str> = EdgeKind::ALL.iter().map(EdgeKind::as_str).collect();
        format!("unknown edge kind '{s}' (expected one of: {})", known.join(", "))
    })
}

fn parse_node_kind(s: &str) -> Result<NodeKind, String> {
    NodeKind::parse(s).ok_or_else(|| {
        let known: Vec<&str> = NodeKind::ALL.iter().map(NodeKind::as_str).collect();
        format!("unknown node kind '{s}' (expected one of: {})", known.join(", "))
    })
}

/// Where a scope's graph lives and how to print results.
#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// State directory holding `<scope>.graph.json` files
    #[arg(long, env = "ATLAS_GRAPH_STATE")]
    pub state: PathBuf,
    /// Scope to read
    #[arg(long)]
    pub scope: String,
    /// Path to a TOML configuration file (default: atlas-graph.toml in the state directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Output format; overrides `[query] default_format`
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
    /// Skip the first N rows of list output
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
    /// Print at most N rows of list output
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay a JSON-lines stream of messages into the state directory
    Ingest {
        /// State directory (created if missing)
        #[arg(long, env = "ATLAS_GRAPH_STATE")]
        state: PathBuf,
        /// JSON-lines file with one stream message per line; `-` reads stdin
        #[arg(long)]
        input: PathBuf,
        /// Path to a TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run queries against a stored scope graph
    Query {
        #[command(subcommand)]
        query: QueryCommands,
    },
    /// Export a scope graph as JSON, GraphML or DOT
    Export {
        #[arg(long, env = "ATLAS_GRAPH_STATE")]
        state: PathBuf,
        #[arg(long)]
        scope: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ExportFormatArg::Json)]
        format: ExportFormatArg,
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// DOT: one cluster per source system
        #[arg(long, value_enum, default_value_t = OnOffArg::Off)]
        dot_clusters: OnOffArg,
        /// DOT: include legend
        #[arg(long, value_enum, default_value_t = OnOffArg::Off)]
        dot_legend: OnOffArg,
        #[arg(long, value_enum, default_value_t = DotThemeArg::Light)]
        dot_theme: DotThemeArg,
        #[arg(long, value_enum, default_value_t = DotRankDirArg::LR)]
        dot_rankdir: DotRankDirArg,
        /// DOT: outline nodes by documentation coverage
        #[arg(long, default_value_t = false)]
        dot_coverage: bool,
    },
    /// Structural diff between two exported graph JSON files
    Diff {
        #[arg(long)]
        before: PathBuf,
        #[arg(long)]
        after: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Detect shared resources and triggers across scopes
    Link {
        #[arg(long, env = "ATLAS_GRAPH_STATE")]
        state: PathBuf,
        /// Scopes to link (repeatable); defaults to every stored scope
        #[arg(long = "scope")]
        scopes: Vec<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List scopes stored in a state directory
    Scopes {
        #[arg(long, env = "ATLAS_GRAPH_STATE")]
        state: PathBuf,
    },
    /// Repository documentation tools
    Docs {
        #[command(subcommand)]
        docs: DocsCommands,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueryCommands {
    /// Walk the graph from one or more start nodes
    Traverse {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Start node id or unique name (repeatable)
        #[arg(long = "start", required = true)]
        start: Vec<String>,
        /// `incoming` walks from a pipeline down to its jobs
        #[arg(long, value_enum, default_value_t = DirectionArg::Outgoing)]
        direction: DirectionArg,
        #[arg(long, value_enum, default_value_t = OrderArg::Dfs)]
        order: OrderArg,
        /// Only follow these edge kinds (repeatable)
        #[arg(long = "edge-kind", value_parser = parse_edge_kind)]
        edge_kinds: Vec<EdgeKind>,
        #[arg(long)]
        max_depth: Option<usize>,
    },
    /// List cycles in the scope graph
    Cycles {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Shortest path between two nodes
    Path {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, value_enum, default_value_t = DirectionArg::Outgoing)]
        direction: DirectionArg,
        #[arg(long = "edge-kind", value_parser = parse_edge_kind)]
        edge_kinds: Vec<EdgeKind>,
    },
    /// Top-N nodes by degree centrality
    Hubs {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, value_enum, default_value_t = MetricArg::Total)]
        metric: MetricArg,
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Only rank nodes of this kind
        #[arg(long, value_parser = parse_node_kind)]
        kind: Option<NodeKind>,
    },
    /// Documentation coverage scores, worst first
    Coverage {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Documentation whose node neighborhood changed since it was recorded
    Drift {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Show one node with its neighbors and documentation
    NodeInfo {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Node id or unique name
        #[arg(long)]
        node: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum DocsCommands {
    /// Check a repository checkout for expected documentation files
    Detect {
        /// Repository root
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Also check the graph of this scope (needs --state)
        #[arg(long, requires = "state")]
        scope: Option<String>,
        #[arg(long, env = "ATLAS_GRAPH_STATE")]
        state: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
