use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use pci_enum::{
    ApertureAllocator, DeviceKind, DeviceNode, DeviceTree, EnumerationConfig, EnumerationOutcome,
    EnumerationReport, EnumerationSession, NodeId, ResourceClass,
};
use pci_sim::{Topology, TopologySpec};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pci-topology",
    about = "Enumerate a simulated PCI platform described in JSON and print the assigned resources."
)]
struct Args {
    /// Topology description (JSON)
    topology: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Allocation rounds before a partial outcome is accepted (1-3)
    #[arg(long, value_name = "N", default_value_t = 3)]
    attempts: usize,

    /// Do not size expansion ROMs or reserve space for them
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_option_roms: bool,

    /// Fail unless every request was satisfied
    #[arg(long, action = clap::ArgAction::SetTrue)]
    strict: bool,

    /// Log engine activity to stderr (RUST_LOG overrides)
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    run(args)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    if !(1..=3).contains(&args.attempts) {
        bail!("--attempts must be between 1 and 3, got {}", args.attempts);
    }
    let text = fs::read_to_string(&args.topology)
        .with_context(|| format!("read {}", args.topology.display()))?;
    let spec: TopologySpec = serde_json::from_str(&text)
        .with_context(|| format!("parse {}", args.topology.display()))?;
    let topology = Topology::from_spec(&spec).context("build simulated platform")?;

    let config = EnumerationConfig {
        probe_option_roms: !args.no_option_roms,
        max_allocation_attempts: args.attempts,
        ..EnumerationConfig::default()
    };
    let mut session = EnumerationSession::new(
        topology.bus,
        ApertureAllocator::new(topology.roots),
        config,
    )
    .with_hot_plug_policy(topology.hot_plug);
    let report = session.enumerate().context("enumerate")?;

    let summary = Summary::new(session.tree(), &report);
    match args.format {
        Format::Text => print!("{}", summary.to_text()),
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        ),
    }

    if args.strict && report.outcome != EnumerationOutcome::Complete {
        bail!("enumeration was not complete: {}", outcome_label(&report.outcome));
    }
    Ok(())
}

fn outcome_label(outcome: &EnumerationOutcome) -> String {
    match outcome {
        EnumerationOutcome::Complete => "complete".to_owned(),
        EnumerationOutcome::Reduced { stripped } => format!("reduced ({stripped:?} stripped)"),
        EnumerationOutcome::Partial {
            unsatisfied,
            stripped,
        } => {
            let missing: Vec<String> = unsatisfied
                .iter()
                .map(|(root, class)| format!("root {root} {class}"))
                .collect();
            format!(
                "partial ({stripped:?} stripped; unsatisfied: {})",
                missing.join(", ")
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    outcome: String,
    attempts: usize,
    devices: usize,
    roots: Vec<FunctionSummary>,
    problems: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FunctionSummary {
    bdf: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buses: Option<[u8; 2]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    windows: Vec<RangeSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bars: Vec<RangeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rom: Option<RangeSummary>,
    committed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<FunctionSummary>,
}

#[derive(Debug, Serialize)]
struct RangeSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<u8>,
    class: String,
    base: u64,
    length: u64,
}

impl RangeSummary {
    fn label(&self) -> String {
        let name = match self.index {
            Some(index) => format!("BAR{index} {}", self.class),
            None => self.class.clone(),
        };
        format!("{name:<12} {:#010x}+{:#x}", self.base, self.length)
    }
}

impl Summary {
    fn new(tree: &DeviceTree, report: &EnumerationReport) -> Self {
        let roots = tree
            .roots()
            .iter()
            .filter_map(|&id| function_summary(tree, id))
            .collect();

        let mut problems = Vec::new();
        for (bdf, err) in &report.discovery.aborted {
            problems.push(format!("{bdf}: sub-tree not scanned: {err}"));
        }
        for (bdf, err) in &report.discovery.probe_faults {
            problems.push(format!("{bdf}: windows not sized: {err}"));
        }
        for (bridge, class, requested) in &report.capped {
            let at = tree
                .get(*bridge)
                .map(|node| node.bdf.to_string())
                .unwrap_or_default();
            problems.push(format!("{at}: {class} capped, {requested:#x} requested"));
        }
        for (bdf, err) in &report.program.faults {
            problems.push(format!("{bdf}: left disabled: {err}"));
        }
        if !report.program.unassigned.is_empty() {
            problems.push(format!(
                "{} window(s) left unassigned",
                report.program.unassigned.len()
            ));
        }

        Self {
            outcome: outcome_label(&report.outcome),
            attempts: report.attempts,
            devices: report.devices,
            roots,
            problems,
        }
    }

    fn to_text(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            write_function(&mut out, root, 0);
        }
        let _ = writeln!(
            out,
            "{} device(s); outcome: {} after {} attempt(s)",
            self.devices, self.outcome, self.attempts
        );
        for problem in &self.problems {
            let _ = writeln!(out, "warning: {problem}");
        }
        out
    }
}

fn write_function(out: &mut String, function: &FunctionSummary, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut line = format!("{indent}{} {}", function.bdf, function.kind);
    if let Some(id) = &function.id {
        let _ = write!(line, " [{id}]");
    }
    if let Some([secondary, subordinate]) = function.buses {
        let _ = write!(line, " bus {secondary:02x}-{subordinate:02x}");
    }
    if !function.committed && function.kind != "root" {
        line.push_str(" (not programmed)");
    }
    let _ = writeln!(out, "{line}");
    for range in function
        .windows
        .iter()
        .chain(&function.bars)
        .chain(&function.rom)
    {
        let _ = writeln!(out, "{indent}    {}", range.label());
    }
    for child in &function.children {
        write_function(out, child, depth + 1);
    }
}

fn kind_label(node: &DeviceNode) -> &'static str {
    match node.kind {
        DeviceKind::RootBridge { .. } => "root",
        DeviceKind::Endpoint => "endpoint",
        DeviceKind::PciBridge => "pci-bridge",
        DeviceKind::LegacyBridge => "legacy-bridge",
        DeviceKind::CardBusBridge => "cardbus-bridge",
    }
}

fn function_summary(tree: &DeviceTree, id: NodeId) -> Option<FunctionSummary> {
    let node = tree.get(id)?;
    let is_root = matches!(node.kind, DeviceKind::RootBridge { .. });
    let windows = node
        .bridge
        .as_ref()
        .map(|state| {
            ResourceClass::APERTURES
                .iter()
                .filter_map(|&class| {
                    state.window(class).map(|window| RangeSummary {
                        index: None,
                        class: class.to_string(),
                        base: window.base,
                        length: window.length,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let bars = node
        .bars()
        .map(|bar| RangeSummary {
            index: Some(bar.index),
            class: bar.class.to_string(),
            base: bar.base,
            length: bar.length,
        })
        .collect();
    let rom = node.rom.map(|rom| RangeSummary {
        index: None,
        class: "rom".to_owned(),
        base: rom.base,
        length: rom.length,
    });

    Some(FunctionSummary {
        bdf: match node.kind {
            DeviceKind::RootBridge { index } => format!("root{index}"),
            _ => node.bdf.to_string(),
        },
        kind: kind_label(node),
        id: (!is_root).then(|| {
            format!(
                "{:04x}:{:04x} class {:02x}{:02x}",
                node.header.vendor_id(),
                node.header.device_id(),
                node.header.class(),
                node.header.subclass()
            )
        }),
        buses: node
            .bridge
            .as_ref()
            .map(|state| [state.secondary, state.subordinate]),
        windows,
        bars,
        rom,
        committed: node.committed,
        children: node
            .children()
            .iter()
            .filter_map(|&child| function_summary(tree, child))
            .collect(),
    })
}
