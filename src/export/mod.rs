use crate::docs::{Classification, CoverageReport};
use crate::errors::AtlasGraphError;
use crate::graph::{CicdGraph, EdgeKind, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    GraphMl,
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotTheme { Light, Dark }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankDir { LR, TB }

#[derive(Debug, Clone, Copy)]
pub struct DotOptions {
    /// Group nodes into one cluster per source system.
    pub clusters: bool,
    pub legend: bool,
    pub theme: DotTheme,
    pub rankdir: RankDir,
    pub rounded: bool,
}

impl Default for DotOptions {
    fn default() -> Self {
        Self { clusters: false, legend: false, theme: DotTheme::Light, rankdir: RankDir::LR, rounded: true }
    }
}

/// Serialize a graph to bytes in the requested format.
///
/// # Errors
/// Returns `AtlasGraphError` if JSON serialization fails.
pub fn export(graph: &CicdGraph, format: ExportFormat) -> Result<Vec<u8>, AtlasGraphError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(graph)?),
        ExportFormat::GraphMl => Ok(GraphMlWriter::new().write(graph).into_bytes()),
        ExportFormat::Dot => Ok(DotGenerator::new().generate_dot(graph).into_bytes()),
    }
}

#[derive(Debug, Default)]
pub struct GraphMlWriter;

impl GraphMlWriter {
    #[must_use]
    pub fn new() -> Self { Self {} }

    /// GraphML with `node_kind`, `name`, `source_system` and `edge_kind` keys.
    #[must_use]
    pub fn write(&self, graph: &CicdGraph) -> String {
        let mut s = String::new();
        s.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        s.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
        s.push_str("  <key id=\"node_kind\" for=\"node\" attr.name=\"node_kind\" attr.type=\"string\"/>\n");
        s.push_str("  <key id=\"name\" for=\"node\" attr.name=\"name\" attr.type=\"string\"/>\n");
        s.push_str("  <key id=\"source_system\" for=\"node\" attr.name=\"source_system\" attr.type=\"string\"/>\n");
        s.push_str("  <key id=\"edge_kind\" for=\"edge\" attr.name=\"edge_kind\" attr.type=\"string\"/>\n");
        let _ = writeln!(s, "  <graph id=\"{}\" edgedefault=\"directed\">", xml_escape(graph.scope()));
        for node in graph.nodes() {
            let _ = writeln!(s, "    <node id=\"{}\">", xml_escape(&node.id.0));
            let _ = writeln!(s, "      <data key=\"node_kind\">{}</data>", node.kind);
            let _ = writeln!(s, "      <data key=\"name\">{}</data>", xml_escape(&node.name));
            if !node.source_system.is_empty() {
                let _ = writeln!(s, "      <data key=\"source_system\">{}</data>", xml_escape(&node.source_system));
            }
            s.push_str("    </node>\n");
        }
        for (i, edge) in graph.edges().enumerate() {
            let _ = writeln!(
                s,
                "    <edge id=\"e{i}\" source=\"{}\" target=\"{}\">",
                xml_escape(&edge.from.0),
                xml_escape(&edge.to.0)
            );
            let _ = writeln!(s, "      <data key=\"edge_kind\">{}</data>", edge.kind);
            s.push_str("    </edge>\n");
        }
        s.push_str("  </graph>\n</graphml>\n");
        s
    }
}

#[derive(Debug, Default)]
pub struct DotGenerator;

impl DotGenerator {
    #[must_use]
    pub fn new() -> Self { Self {} }

    #[must_use]
    pub fn generate_dot(&self, graph: &CicdGraph) -> String {
        self.generate_dot_with_options(graph, DotOptions::default(), None)
    }

    /// Generate DOT with the given `opts`, optionally outlining nodes by coverage classification.
    #[must_use]
    pub fn generate_dot_with_options(
        &self,
        graph: &CicdGraph,
        opts: DotOptions,
        coverage: Option<&CoverageReport>,
    ) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "digraph \"{}\" {{", escape_label(graph.scope()));
        let rank = match opts.rankdir { RankDir::LR => "LR", RankDir::TB => "TB" };
        let node_style = if opts.rounded { "filled,rounded" } else { "filled" };
        let font = match opts.theme { DotTheme::Light => "black", DotTheme::Dark => "white" };
        let _ = write!(
            s,
            "  rankdir={rank};\n  graph [fontname=Helvetica];\n  node [shape=box, fontsize=10, style=\"{node_style}\", fontcolor={font}];\n  edge [fontname=Helvetica, fontsize=9];\n"
        );

        let write_node = |out: &mut String, indent: &str, node: &crate::graph::Node| {
            let node_id = sanitize_id(&node.id.0);
            let (fill, shape) = style_for_kind_with_theme(node.kind, opts.theme);
            let label = escape_label(&format!("{}\n({})", node.name, node.kind));
            let mut extra = String::new();
            if let Some(score) = coverage.and_then(|r| r.scores.get(&node.id)) {
                let outline = outline_for(score.classification);
                let _ = write!(
                    extra,
                    ", color=\"{outline}\", penwidth=2, tooltip=\"{} {:.2}\"",
                    score.classification, score.score
                );
            }
            let _ = writeln!(
                out,
                "{indent}\"{node_id}\" [label=\"{label}\", fillcolor=\"{fill}\", shape=\"{shape}\"{extra}];"
            );
        };

        if opts.clusters {
            let mut by_source: BTreeMap<&str, Vec<&crate::graph::Node>> = BTreeMap::new();
            for node in graph.nodes() {
                by_source.entry(node.source_system.as_str()).or_default().push(node);
            }
            for (source, nodes) in by_source {
                let cluster_id = format!("cluster_{}", sanitize_id(source));
                let _ = write!(s, "  subgraph \"{cluster_id}\" {{\n    label=\"{}\";\n    color=lightgrey;\n", escape_label(source));
                for node in nodes {
                    write_node(&mut s, "    ", node);
                }
                s.push_str("  }\n");
            }
        } else {
            for node in graph.nodes() {
                write_node(&mut s, "  ", node);
            }
        }

        for edge in graph.edges() {
            let from = sanitize_id(&edge.from.0);
            let to = sanitize_id(&edge.to.0);
            let (color, style) = style_for_edge(edge.kind);
            let _ = writeln!(s, "  \"{from}\" -> \"{to}\" [label=\"{}\", color=\"{color}\", style=\"{style}\"];", edge.kind);
        }

        if opts.legend {
            s.push_str("  subgraph cluster_legend {\n    label=\"Legend\";\n    color=grey;\n");
            for kind in NodeKind::ALL {
                let (fill, shape) = style_for_kind_with_theme(kind, opts.theme);
                let id = sanitize_id(&format!("legend_{kind}"));
                let _ = writeln!(s, "    \"{id}\" [label=\"{kind}\", fillcolor=\"{fill}\", shape=\"{shape}\"];");
            }
            s.push_str("  }\n");
        }

        s.push_str("}\n");
        s
    }
}

fn sanitize_id(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn escape_label(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn outline_for(c: Classification) -> &'static str {
    match c {
        Classification::Documented => "#2e7d32",
        Classification::Partial => "#f9a825",
        Classification::Stale => "#ef6c00",
        Classification::Undocumented => "#c62828",
    }
}

fn style_for_edge(k: EdgeKind) -> (&'static str, &'static str) {
    match k {
        EdgeKind::DependsOn | EdgeKind::Needs => ("#1f77b4", "solid"),
        EdgeKind::Triggers => ("#d62728", "bold"),
        EdgeKind::Contains => ("#7f7f7f", "solid"),
        EdgeKind::Produces | EdgeKind::Consumes => ("#2ca02c", "dashed"),
        EdgeKind::Uses => ("#9467bd", "dashed"),
        EdgeKind::Calls => ("#8c564b", "dotted"),
    }
}

fn style_for_kind_with_theme(k: NodeKind, theme: DotTheme) -> (&'static str, &'static str) {
    match (theme, k) {
        (DotTheme::Light, NodeKind::Pipeline) => ("#4CAF50", "component"),
        (DotTheme::Light, NodeKind::Stage) => ("#03A9F4", "tab"),
        (DotTheme::Light, NodeKind::Job) => ("#2196F3", "box"),
        (DotTheme::Light, NodeKind::Step) => ("#00BCD4", "oval"),
        (DotTheme::Light, NodeKind::Artifact) => ("#FFC107", "note"),
        (DotTheme::Light, NodeKind::ContainerImage) => ("#9C27B0", "box3d"),
        (DotTheme::Light, NodeKind::Runner) => ("#607D8B", "cds"),
        (DotTheme::Light, NodeKind::SecretRef) => ("#F44336", "octagon"),
        (DotTheme::Light, NodeKind::Environment) => ("#8BC34A", "hexagon"),
        (DotTheme::Light, NodeKind::ExternalService) => ("#795548", "parallelogram"),
        (DotTheme::Light, NodeKind::Repository) => ("#FF9800", "folder"),
        (DotTheme::Light, NodeKind::DocFile) => ("#E91E63", "note"),

        (DotTheme::Dark, NodeKind::Pipeline) => ("#1b5e20", "component"),
        (DotTheme::Dark, NodeKind::Stage) => ("#01579b", "tab"),
        (DotTheme::Dark, NodeKind::Job) => ("#0d47a1", "box"),
        (DotTheme::Dark, NodeKind::Step) => ("#006064", "oval"),
        (DotTheme::Dark, NodeKind::Artifact) => ("#8d6e00", "note"),
        (DotTheme::Dark, NodeKind::ContainerImage) => ("#4a148c", "box3d"),
        (DotTheme::Dark, NodeKind::Runner) => ("#263238", "cds"),
        (DotTheme::Dark, NodeKind::SecretRef) => ("#b71c1c", "octagon"),
        (DotTheme::Dark, NodeKind::Environment) => ("#33691e", "hexagon"),
        (DotTheme::Dark, NodeKind::ExternalService) => ("#3e2723", "parallelogram"),
        (DotTheme::Dark, NodeKind::Repository) => ("#e65100", "folder"),
        (DotTheme::Dark, NodeKind::DocFile) => ("#880e4f", "note"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::fixture;

    #[test]
    fn test_sanitize_id_basic() {
        assert_eq!(sanitize_id("ci:job/build#1"), "ci_job_build_1");
        assert_eq!(sanitize_id("abc_DEF012"), "abc_DEF012");
    }

    #[test]
    fn test_escape_label_quotes_and_newlines() {
        assert_eq!(escape_label("a\"b\nc"), "a\\\"b\\nc");
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
    }

    #[test]
    fn test_every_kind_has_a_style_in_both_themes() {
        for k in NodeKind::ALL {
            assert_ne!(style_for_kind_with_theme(k, DotTheme::Light).0, style_for_kind_with_theme(k, DotTheme::Dark).0);
        }
    }

    #[test]
    fn test_dot_and_graphml_contain_nodes_and_edges() {
        let g = fixture(&[("p", NodeKind::Pipeline), ("j", NodeKind::Job)], &[("j", "p", EdgeKind::Contains)]);
        let dot = String::from_utf8(export(&g, ExportFormat::Dot).unwrap()).unwrap();
        assert!(dot.starts_with("digraph \"test\" {"));
        assert!(dot.contains("\"j\" -> \"p\" [label=\"contains\""));
        assert!(dot.contains("label=\"p\\n(pipeline)\""));

        let gml = String::from_utf8(export(&g, ExportFormat::GraphMl).unwrap()).unwrap();
        assert!(gml.contains("<node id=\"p\">"));
        assert!(gml.contains("<data key=\"edge_kind\">contains</data>"));

        let json = export(&g, ExportFormat::Json).unwrap();
        let back: CicdGraph = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_clusters_and_legend() {
        let g = fixture(&[("j", NodeKind::Job)], &[]);
        let opts = DotOptions { clusters: true, legend: true, theme: DotTheme::Dark, ..Default::default() };
        let dot = DotGenerator::new().generate_dot_with_options(&g, opts, None);
        assert!(dot.contains("subgraph \"cluster_test\""));
        assert!(dot.contains("cluster_legend"));
        assert!(dot.contains("fontcolor=white"));
    }
}
