use crate::cli::{
    Cli, Commands, DirectionArg, DocsCommands, DotRankDirArg, DotThemeArg, ExportFormatArg,
    MetricArg, OnOffArg, OrderArg, OutputFormat, QueryCommands, ScopeArgs,
};
use crate::docs::detect::{discover_doc_files, evaluate_project_docs};
use crate::errors::AtlasGraphError;
use crate::export::{export, DotGenerator, DotOptions, DotTheme, ExportFormat, RankDir};
use crate::graph::{CicdGraph, Direction, NodeId};
use crate::persistence::{GraphRepository, JsonFileRepository};
use crate::query::{
    resolve_node, CentralityMetric, CycleDetectionQuery, HubsQuery, NodeInfoQuery, Query,
    ShortestPathQuery,
};
use crate::store::GraphService;
use crate::traversal::{Order, TraversalRequest};
use crate::utils::config::{resolve_config, Config};
use crate::utils::table::{page, render, short_id};
use clap::CommandFactory;
use clap_complete::generate;
use serde::Serialize;
use std::fs;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Run the CLI logic in-process.
///
/// Returns an exit code: 0 on success, 1 on failure, 2 for invalid configuration.
#[must_use]
pub fn run_cli(cli: Cli) -> i32 {
    crate::utils::logging::init(cli.quiet, cli.verbose);
    let verbose = cli.verbose;
    let outcome = match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let bin_name = env!("CARGO_PKG_NAME");
            generate(shell, &mut cmd, bin_name, &mut io::stdout());
            Ok(0)
        }
        Commands::Ingest { state, input, config, format } => {
            run_ingest(&state, &input, config.as_deref(), format)
        }
        Commands::Query { query } => run_query(query, verbose).map(|()| 0),
        Commands::Export {
            state,
            scope,
            config,
            format,
            out,
            dot_clusters,
            dot_legend,
            dot_theme,
            dot_rankdir,
            dot_coverage,
        } => {
            let flags = DotOptions {
                clusters: matches!(dot_clusters, OnOffArg::On),
                legend: matches!(dot_legend, OnOffArg::On),
                theme: match dot_theme {
                    DotThemeArg::Dark => DotTheme::Dark,
                    DotThemeArg::Light => DotTheme::Light,
                },
                rankdir: match dot_rankdir {
                    DotRankDirArg::TB => RankDir::TB,
                    DotRankDirArg::LR => RankDir::LR,
                },
                rounded: true,
            };
            run_export(&state, &scope, config.as_deref(), format, out.as_deref(), flags, dot_coverage)
                .map(|()| 0)
        }
        Commands::Diff { before, after, format } => run_diff(&before, &after, format).map(|()| 0),
        Commands::Link { state, scopes, format } => run_link(&state, scopes, format).map(|()| 0),
        Commands::Scopes { state } => JsonFileRepository::new(&state)
            .and_then(|repo| repo.list_scopes())
            .map(|scopes| {
                for s in scopes {
                    println!("{s}");
                }
                0
            }),
        Commands::Docs { docs: DocsCommands::Detect { path, scope, state, format } } => {
            run_docs_detect(&path, scope.as_deref(), state.as_deref(), format).map(|()| 0)
        }
    };
    match outcome {
        Ok(code) => code,
        Err(e @ (AtlasGraphError::Config(_) | AtlasGraphError::Toml(_))) => {
            eprintln!("Error: {e}");
            2
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AtlasGraphError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn pick_format(cfg: &Config, flag: Option<OutputFormat>) -> OutputFormat {
    flag.unwrap_or_else(|| match cfg.default_format() {
        Some("json") => OutputFormat::Json,
        _ => OutputFormat::Text,
    })
}

fn direction(d: DirectionArg) -> Direction {
    match d {
        DirectionArg::Outgoing => Direction::Outgoing,
        DirectionArg::Incoming => Direction::Incoming,
        DirectionArg::Both => Direction::Both,
    }
}

fn run_ingest(
    state: &Path,
    input: &Path,
    config: Option<&Path>,
    format: OutputFormat,
) -> Result<i32, AtlasGraphError> {
    let cfg = resolve_config(config, Some(state))?;
    let settings = cfg.service_settings()?;
    let workers = cfg.worker_settings()?;
    let repo = Arc::new(JsonFileRepository::new(state)?);
    let service = Arc::new(GraphService::new(repo, settings));

    let lines = if input == Path::new("-") {
        crate::stream::read_json_lines(io::stdin().lock())?
    } else {
        crate::stream::read_json_lines(BufReader::new(fs::File::open(input)?))?
    };
    let invalid = lines.invalid;
    let summaries = crate::stream::replay(service, workers, lines.messages)?;
    let failed = summaries.iter().any(|s| !s.errors.is_empty());

    if matches!(format, OutputFormat::Json) {
        #[derive(Serialize)]
        struct Out<'a> {
            scopes: &'a [crate::stream::ScopeSummary],
            invalid_lines: &'a [(usize, String)],
        }
        print_json(&Out { scopes: &summaries, invalid_lines: &invalid })?;
    } else {
        let rows: Vec<Vec<String>> = summaries
            .iter()
            .map(|s| {
                vec![
                    s.scope.clone(),
                    s.messages.to_string(),
                    s.accepted.to_string(),
                    s.rejected.to_string(),
                    s.pending.to_string(),
                    s.dropped.to_string(),
                    s.revision.to_string(),
                ]
            })
            .collect();
        println!(
            "{}",
            render(&["Scope", "Messages", "Accepted", "Rejected", "Pending", "Dropped", "Revision"], &rows)
        );
        for s in &summaries {
            for e in &s.errors {
                eprintln!("{}: {e}", s.scope);
            }
        }
        if !invalid.is_empty() {
            eprintln!("{} undecodable line(s) skipped", invalid.len());
        }
    }
    Ok(i32::from(failed))
}

/// Open a stored scope; a scope without a graph file is an error rather than an empty graph.
fn open_stored(args: &ScopeArgs) -> Result<(Config, GraphService), AtlasGraphError> {
    let cfg = resolve_config(args.config.as_deref(), Some(&args.state))?;
    let repo = JsonFileRepository::new(&args.state)?;
    if !repo.graph_path(&args.scope).exists() {
        return Err(AtlasGraphError::UnknownScope(args.scope.clone()));
    }
    let service = GraphService::new(Arc::new(repo), cfg.service_settings()?);
    Ok((cfg, service))
}

#[allow(clippy::too_many_lines)]
fn run_query(query: QueryCommands, verbose: u8) -> Result<(), AtlasGraphError> {
    match query {
        QueryCommands::Traverse { scope, start, direction: dir, order, edge_kinds, max_depth } => {
            let (cfg, service) = open_stored(&scope)?;
            let graph = service.get_graph(&scope.scope)?;
            let start: Vec<NodeId> =
                start.iter().map(|s| resolve_node(&graph, s)).collect::<Result<_, _>>()?;
            let mut req = TraversalRequest::from_nodes(start).direction(direction(dir)).order(match order {
                OrderArg::Dfs => Order::DepthFirst,
                OrderArg::Bfs => Order::BreadthFirst,
                OrderArg::Topo => Order::Topological,
            });
            if !edge_kinds.is_empty() {
                req = req.edge_kinds(edge_kinds);
            }
            if let Some(d) = max_depth {
                req = req.max_depth(d);
            }
            let result = service.traverse(&scope.scope, &req, None)?;
            let visited = page(&result.order, scope.offset, scope.limit);
            if matches!(pick_format(&cfg, scope.format), OutputFormat::Json) {
                #[derive(Serialize)]
                struct Out<'a> {
                    order: &'a [NodeId],
                    cycles: &'a [Vec<NodeId>],
                    excluded: &'a [NodeId],
                }
                print_json(&Out { order: visited, cycles: &result.report.cycles, excluded: &result.report.excluded })
            } else {
                let rows: Vec<Vec<String>> = visited
                    .iter()
                    .enumerate()
                    .map(|(i, id)| {
                        let (name, kind) =
                            graph.node(id).map_or((String::new(), String::new()), |n| (n.name.clone(), n.kind.to_string()));
                        let id = if verbose == 0 { short_id(&id.0) } else { id.0.clone() };
                        vec![(scope.offset + i + 1).to_string(), name, kind, id]
                    })
                    .collect();
                println!("{}", render(&["#", "Name", "Kind", "Id"], &rows));
                for cyc in &result.report.cycles {
                    println!("cycle: {}", names(&graph, cyc).join(" -> "));
                }
                if !result.report.excluded.is_empty() {
                    println!("excluded from ordering: {}", names(&graph, &result.report.excluded).join(", "));
                }
                Ok(())
            }
        }
        QueryCommands::Cycles { scope } => {
            let (cfg, service) = open_stored(&scope)?;
            let graph = service.get_graph(&scope.scope)?;
            let (_, rows) = CycleDetectionQuery::new().run(&graph);
            let rows = page(&rows, scope.offset, scope.limit);
            if matches!(pick_format(&cfg, scope.format), OutputFormat::Json) {
                print_json(rows)
            } else {
                if rows.is_empty() {
                    println!("<no cycles>");
                }
                for r in rows {
                    println!("{}", r.names.join(" -> "));
                }
                Ok(())
            }
        }
        QueryCommands::Path { scope, from, to, direction: dir, edge_kinds } => {
            let (cfg, service) = open_stored(&scope)?;
            let graph = service.get_graph(&scope.scope)?;
            let mut q = ShortestPathQuery::new(resolve_node(&graph, &from)?, resolve_node(&graph, &to)?);
            q.direction = direction(dir);
            if !edge_kinds.is_empty() {
                q.kinds = Some(edge_kinds);
            }
            let path = q.run(&graph);
            if matches!(pick_format(&cfg, scope.format), OutputFormat::Json) {
                print_json(&path)
            } else if path.is_empty() {
                println!("<no path>");
                Ok(())
            } else {
                let rows: Vec<Vec<String>> = path
                    .iter()
                    .enumerate()
                    .map(|(i, id)| vec![(i + 1).to_string(), names(&graph, std::slice::from_ref(id)).remove(0)])
                    .collect();
                println!("{}", render(&["Step", "Node"], &rows));
                Ok(())
            }
        }
        QueryCommands::Hubs { scope, metric, top, kind } => {
            let (cfg, service) = open_stored(&scope)?;
            let graph = service.get_graph(&scope.scope)?;
            let m = match metric {
                MetricArg::In => CentralityMetric::In,
                MetricArg::Out => CentralityMetric::Out,
                MetricArg::Total => CentralityMetric::Total,
            };
            let rows = HubsQuery::new(m, top).with_kind(kind).run(&graph);
            let rows = page(&rows, scope.offset, scope.limit);
            if matches!(pick_format(&cfg, scope.format), OutputFormat::Json) {
                print_json(rows)
            } else {
                let body: Vec<Vec<String>> = rows
                    .iter()
                    .map(|r| {
                        vec![
                            r.name.clone(),
                            r.kind.to_string(),
                            r.in_degree.to_string(),
                            r.out_degree.to_string(),
                            (r.in_degree + r.out_degree).to_string(),
                        ]
                    })
                    .collect();
                println!("{}", render(&["Name", "Kind", "In", "Out", "Total"], &body));
                Ok(())
            }
        }
        QueryCommands::Coverage { scope } => {
            let (cfg, service) = open_stored(&scope)?;
            let graph = service.get_graph(&scope.scope)?;
            let report = service.get_coverage(&scope.scope)?;
            let worst = report.worst(report.scores.len());
            let rows = page(&worst, scope.offset, scope.limit);
            if matches!(pick_format(&cfg, scope.format), OutputFormat::Json) {
                #[derive(Serialize)]
                struct Out<'a> {
                    scope: &'a str,
                    revision: u64,
                    aggregate: f64,
                    scores: &'a [&'a crate::docs::CoverageScore],
                }
                print_json(&Out { scope: &report.scope, revision: report.revision, aggregate: report.aggregate, scores: rows })
            } else {
                let body: Vec<Vec<String>> = rows
                    .iter()
                    .map(|s| {
                        let mut row = vec![
                            names(&graph, std::slice::from_ref(&s.node_id)).remove(0),
                            s.classification.to_string(),
                            format!("{:.3}", s.score),
                        ];
                        if verbose > 0 {
                            row.push(format!("{:.2}", s.weight));
                            row.push(format!("{:.2}", s.covered_fraction));
                        }
                        row
                    })
                    .collect();
                let headers: &[&str] = if verbose == 0 {
                    &["Node", "Class", "Score"]
                } else {
                    &["Node", "Class", "Score", "Weight", "Covered"]
                };
                println!("{}", render(headers, &body));
                println!("aggregate coverage: {:.3} (revision {})", report.aggregate, report.revision);
                Ok(())
            }
        }
        QueryCommands::Drift { scope } => {
            let (cfg, service) = open_stored(&scope)?;
            let graph = service.get_graph(&scope.scope)?;
            let findings = service.get_drift(&scope.scope)?;
            let rows = page(&findings, scope.offset, scope.limit);
            if matches!(pick_format(&cfg, scope.format), OutputFormat::Json) {
                print_json(rows)
            } else {
                if rows.is_empty() {
                    println!("<no drift>");
                    return Ok(());
                }
                let body: Vec<Vec<String>> = rows
                    .iter()
                    .map(|f| {
                        let crate::docs::DriftReason::NeighborhoodChanged { added, removed } = &f.reason;
                        vec![
                            names(&graph, std::slice::from_ref(&f.node_id)).remove(0),
                            short_id(&f.artifact_id.0),
                            names(&graph, added).join(", "),
                            names(&graph, removed).join(", "),
                        ]
                    })
                    .collect();
                println!("{}", render(&["Node", "Artifact", "Added", "Removed"], &body));
                Ok(())
            }
        }
        QueryCommands::NodeInfo { scope, node } => {
            let (cfg, service) = open_stored(&scope)?;
            let graph = service.get_graph(&scope.scope)?;
            let id = resolve_node(&graph, &node)?;
            let info = NodeInfoQuery::new(id.clone())
                .run(&graph)
                .ok_or_else(|| AtlasGraphError::Query(format!("no node '{id}'")))?;
            if matches!(pick_format(&cfg, scope.format), OutputFormat::Json) {
                print_json(&info)
            } else {
                println!("{} ({}) [{}]", info.name, info.kind, info.id);
                println!("source: {} / {}", info.source_system, info.external_key);
                let mut rows: Vec<Vec<String>> = Vec::new();
                for e in &info.inbound {
                    rows.push(vec!["in".into(), e.relation.clone(), e.name.clone(), e.kind.clone()]);
                }
                for e in &info.outbound {
                    rows.push(vec!["out".into(), e.relation.clone(), e.name.clone(), e.kind.clone()]);
                }
                println!("{}", render(&["Dir", "Relation", "Node", "Kind"], &rows));
                for d in &info.docs {
                    println!("doc: {} {} (seen {})", d.kind, short_id(&d.id), d.last_seen_at);
                }
                Ok(())
            }
        }
    }
}

fn names(graph: &CicdGraph, ids: &[NodeId]) -> Vec<String> {
    ids.iter().map(|id| graph.node(id).map_or_else(|| id.0.clone(), |n| n.name.clone())).collect()
}

fn run_export(
    state: &Path,
    scope: &str,
    config: Option<&Path>,
    format: ExportFormatArg,
    out: Option<&Path>,
    flags: DotOptions,
    with_coverage: bool,
) -> Result<(), AtlasGraphError> {
    let args = ScopeArgs {
        state: state.to_path_buf(),
        scope: scope.to_string(),
        config: config.map(Path::to_path_buf),
        format: None,
        offset: 0,
        limit: None,
    };
    let (cfg, service) = open_stored(&args)?;
    let graph = service.get_graph(scope)?;
    let bytes = match format {
        ExportFormatArg::Json => export(&graph, ExportFormat::Json)?,
        ExportFormatArg::Graphml => export(&graph, ExportFormat::GraphMl)?,
        ExportFormatArg::Dot => {
            let coverage = if with_coverage { Some(service.get_coverage(scope)?) } else { None };
            DotGenerator::new()
                .generate_dot_with_options(&graph, cfg.dot_options(flags), coverage.as_ref())
                .into_bytes()
        }
    };
    match out {
        Some(p) => fs::write(p, &bytes)
            .map_err(|e| AtlasGraphError::Export(format!("failed to write {}: {e}", p.display()))),
        None => Ok(io::stdout().write_all(&bytes)?),
    }
}

fn run_diff(before: &Path, after: &Path, format: OutputFormat) -> Result<(), AtlasGraphError> {
    use crate::diff::{diff_graphs, ChangeType};
    let d = diff_graphs(&CicdGraph::load_json(before)?, &CicdGraph::load_json(after)?);
    if matches!(format, OutputFormat::Json) {
        return print_json(&d);
    }
    if !d.has_changes() {
        println!("<no changes>");
        return Ok(());
    }
    let sign = |c: ChangeType| match c {
        ChangeType::Added => "+",
        ChangeType::Removed => "-",
        ChangeType::Modified => "~",
    };
    let mut rows: Vec<Vec<String>> = d
        .node_changes
        .iter()
        .map(|c| vec![sign(c.change).into(), c.kind.to_string(), c.name.clone(), c.fields.join(", ")])
        .collect();
    rows.extend(d.edge_changes.iter().map(|e| {
        vec![sign(e.change).into(), e.kind.to_string(), format!("{} -> {}", e.from, e.to), String::new()]
    }));
    println!("{}", render(&["", "Kind", "Entity", "Fields"], &rows));
    println!("{} change(s)", d.total_changes());
    Ok(())
}

fn run_link(state: &Path, scopes: Vec<String>, format: OutputFormat) -> Result<(), AtlasGraphError> {
    let repo = JsonFileRepository::new(state)?;
    let scopes = if scopes.is_empty() { repo.list_scopes()? } else { scopes };
    let mut graphs: Vec<CicdGraph> = Vec::with_capacity(scopes.len());
    for s in &scopes {
        match repo.load(s)? {
            Some(g) => graphs.push(g),
            None => warn!(scope = %s, "no stored graph, skipping"),
        }
    }
    let refs: Vec<&CicdGraph> = graphs.iter().collect();
    let view = crate::linker::link_scopes(&refs);
    if matches!(format, OutputFormat::Json) {
        return print_json(&view);
    }
    let rows: Vec<Vec<String>> = view
        .links
        .iter()
        .map(|l| {
            vec![
                l.link_type.as_str().to_string(),
                l.source_scope.clone(),
                short_id(&l.source_node.0),
                l.target_scope.clone(),
                short_id(&l.target_node.0),
                format!("{:.1}", l.confidence),
            ]
        })
        .collect();
    println!("{}", render(&["Link", "From scope", "From", "To scope", "To", "Confidence"], &rows));
    Ok(())
}

fn run_docs_detect(
    path: &Path,
    scope: Option<&str>,
    state: Option<&Path>,
    format: OutputFormat,
) -> Result<(), AtlasGraphError> {
    let files = discover_doc_files(path)?;
    let graph = match (scope, state) {
        (Some(s), Some(dir)) => Some(
            JsonFileRepository::new(dir)?
                .load(s)?
                .ok_or_else(|| AtlasGraphError::UnknownScope(s.to_string()))?,
        ),
        _ => None,
    };
    let report = evaluate_project_docs(graph.as_ref(), &files);
    if matches!(format, OutputFormat::Json) {
        return print_json(&report);
    }
    let rows: Vec<Vec<String>> =
        report.files.iter().map(|f| vec![f.kind.to_string(), f.path.clone()]).collect();
    println!("{}", render(&["Kind", "Path"], &rows));
    println!("coverage: {:.1}%", report.coverage_pct);
    for m in &report.missing {
        println!("missing: {m}");
    }
    for w in &report.drift_warnings {
        println!("warning: {w}");
    }
    Ok(())
}
