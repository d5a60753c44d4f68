//! pipeflow binary: load a pipeline definition and run requests through it.
//!
//! ```bash
//! # Run one request, print the response as JSON
//! RUST_LOG=info cargo run --bin pipeflow-node -- run \
//!     --definition add_one.json --input in=1,2,3
//!
//! # Batched input with an explicit shape and an external plugin library
//! cargo run --bin pipeflow-node -- run --definition crop.json \
//!     --input image=0,1,2,3,4,5 --shape image=2,3 --library crop=./libcrop.so
//!
//! # Show nodes, wiring and declared plugin tensors
//! cargo run --bin pipeflow-node -- inspect --definition add_one.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipeflow_pipeline::{LocalBackend, Pipeline, RequestOutcome};
use pipeflow_plugin::LibraryRegistry;
use pipeflow_types::{NodeKind, PipelineDefinition, Precision, Tensor, TensorMap};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "pipeflow-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Run inference pipelines built from custom node libraries"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one request and print the response. Only custom node
    /// pipelines: no inference backend is attached, so `model` nodes are
    /// rejected.
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Request input as `name=v1,v2,...` (FP32). Repeatable.
        #[arg(long = "input", value_name = "NAME=VALUES")]
        inputs: Vec<String>,

        /// Shape of an input as `name=d1,d2,...`. Defaults to a flat vector.
        #[arg(long = "shape", value_name = "NAME=DIMS")]
        shapes: Vec<String>,
    },

    /// Print the pipeline's nodes, connections and plugin tensor metadata.
    Inspect {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// List the built-in plugin libraries.
    Libraries,
}

#[derive(Args)]
struct PipelineArgs {
    /// Pipeline definition (JSON).
    #[arg(long, value_name = "FILE")]
    definition: PathBuf,

    /// Extra plugin library as `name=path`. Repeatable.
    #[arg(long = "library", value_name = "NAME=PATH")]
    libraries: Vec<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=pipeflow_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { pipeline, inputs, shapes } => {
            let report = run(&pipeline, &inputs, &shapes)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Inspect { pipeline } => print!("{}", inspect(&pipeline)?),
        Command::Libraries => {
            for name in LibraryRegistry::with_builtins().names() {
                println!("{name}");
            }
        }
    }
    Ok(())
}

// ── Loading ───────────────────────────────────────────────────────────────────

fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    PipelineDefinition::from_json(&text)
        .with_context(|| format!("parsing {}", path.display()))
}

fn load_pipeline(args: &PipelineArgs) -> Result<Pipeline> {
    let definition = load_definition(&args.definition)?;
    let models: Vec<&str> = definition
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Model { .. }))
        .map(|n| n.name.as_str())
        .collect();
    if !models.is_empty() {
        bail!(
            "pipeline {} has model nodes ({}); pipeflow-node has no inference backend and only runs custom node pipelines",
            definition.name,
            models.join(", ")
        );
    }
    let mut libraries = LibraryRegistry::with_builtins();
    for spec in &args.libraries {
        let (name, path) = split_pair(spec)?;
        libraries
            .load(name, Path::new(path))
            .with_context(|| format!("loading library {name}"))?;
        info!(library = %name, path = %path, "library loaded");
    }
    Pipeline::build(&definition, &libraries, &LocalBackend::default())
        .with_context(|| format!("building pipeline {}", definition.name))
}

// ── Run ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RunReport {
    request_id: String,
    started_at: String,
    elapsed_us: u64,
    outputs: BTreeMap<String, TensorReport>,
}

#[derive(Debug, Serialize)]
struct TensorReport {
    shape: Vec<usize>,
    precision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<Vec<f32>>,
    bytes: usize,
}

impl TensorReport {
    fn new(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            precision: tensor.precision().to_string(),
            values: (tensor.precision() == Precision::Fp32)
                .then(|| tensor.to_f32_vec().ok())
                .flatten(),
            bytes: tensor.byte_len(),
        }
    }
}

impl From<RequestOutcome> for RunReport {
    fn from(outcome: RequestOutcome) -> Self {
        Self {
            request_id: outcome.request_id,
            started_at: outcome.started_at.to_rfc3339(),
            elapsed_us: outcome.elapsed.as_micros() as u64,
            outputs: outcome
                .outputs
                .iter()
                .map(|(name, t)| (name.clone(), TensorReport::new(t)))
                .collect(),
        }
    }
}

fn run(args: &PipelineArgs, inputs: &[String], shapes: &[String]) -> Result<RunReport> {
    let pipeline = load_pipeline(args)?;
    let request = parse_request(inputs, shapes)?;
    let outcome = pipeline.execute(request)?;
    Ok(outcome.into())
}

fn parse_request(inputs: &[String], shapes: &[String]) -> Result<TensorMap> {
    let mut shape_of: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for spec in shapes {
        let (name, dims) = split_pair(spec)?;
        let dims = parse_list::<usize>(dims).with_context(|| format!("shape of {name}"))?;
        shape_of.insert(name, dims);
    }
    let mut request = TensorMap::new();
    for spec in inputs {
        let (name, values) = split_pair(spec)?;
        let values = parse_list::<f32>(values).with_context(|| format!("values of {name}"))?;
        let shape = shape_of.remove(name).unwrap_or_else(|| vec![values.len()]);
        let tensor = Tensor::from_f32(shape, &values).with_context(|| format!("input {name}"))?;
        if request.insert(name.to_string(), tensor).is_some() {
            bail!("input {name} given twice");
        }
    }
    if let Some(name) = shape_of.keys().next() {
        bail!("shape given for unknown input {name}");
    }
    Ok(request)
}

fn split_pair(spec: &str) -> Result<(&str, &str)> {
    spec.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{spec}'"))
}

fn parse_list<T>(text: &str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|v| v.trim().parse::<T>().with_context(|| format!("bad value '{v}'")))
        .collect()
}

// ── Inspect ───────────────────────────────────────────────────────────────────

fn inspect(args: &PipelineArgs) -> Result<String> {
    use std::fmt::Write as _;

    let definition = load_definition(&args.definition)?;
    let pipeline = load_pipeline(args)?;
    let mut out = String::new();
    writeln!(out, "pipeline {}", pipeline.name())?;
    for node in &definition.nodes {
        write!(out, "  {:<16} {:<7}", node.name, node.kind.label())?;
        if let Some(count) = node.demultiply_count {
            write!(out, " demultiply={}", i64::from(count))?;
        }
        if !node.gather_from.is_empty() {
            let gathered: Vec<&str> = node.gather_from.iter().map(String::as_str).collect();
            write!(out, " gather={}", gathered.join(","))?;
        }
        writeln!(out)?;
        if pipeline.node(&node.name).and_then(|n| n.plugin()).is_some() {
            let (inputs, outputs) = pipeline.node_info(&node.name)?;
            for spec in inputs {
                writeln!(out, "      in  {spec}")?;
            }
            for spec in outputs {
                writeln!(out, "      out {spec}")?;
            }
        }
    }
    for conn in &definition.connections {
        for m in &conn.mapping {
            writeln!(out, "  {}.{} → {}.{}", conn.from, m.output, conn.to, m.input)?;
        }
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ADD_ONE: &str = r#"{
        "name": "add_one",
        "nodes": [
            { "name": "request", "kind": { "type": "entry" } },
            { "name": "add", "kind": { "type": "custom", "library": "add_sub",
                                       "params": { "add_number": "1" } } },
            { "name": "response", "kind": { "type": "exit" } }
        ],
        "connections": [
            { "from": "request", "to": "add",
              "mapping": [ { "output": "in", "input": "input_numbers" } ] },
            { "from": "add", "to": "response",
              "mapping": [ { "output": "output_numbers", "input": "out" } ] }
        ]
    }"#;

    fn definition_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    fn args(file: &tempfile::NamedTempFile) -> PipelineArgs {
        PipelineArgs { definition: file.path().to_path_buf(), libraries: Vec::new() }
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "pipeflow-node", "run", "--definition", "p.json",
            "--input", "in=1,2", "--shape", "in=2,1", "--library", "x=/tmp/x.so",
        ])
        .unwrap();
        match cli.command {
            Command::Run { pipeline, inputs, shapes } => {
                assert_eq!(pipeline.definition, PathBuf::from("p.json"));
                assert_eq!(pipeline.libraries, vec!["x=/tmp/x.so".to_string()]);
                assert_eq!(inputs, vec!["in=1,2".to_string()]);
                assert_eq!(shapes, vec!["in=2,1".to_string()]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_add_one_from_file() {
        let file = definition_file(ADD_ONE);
        let report = run(&args(&file), &["in=1,2,3".into()], &[]).unwrap();
        let out = &report.outputs["out"];
        assert_eq!(out.shape, vec![3]);
        assert_eq!(out.precision, "FP32");
        assert_eq!(out.values.as_deref(), Some(&[2.0, 3.0, 4.0][..]));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outputs"]["out"]["bytes"], 12);
    }

    #[test]
    fn request_parsing() {
        let request = parse_request(&["a=1,2,3,4".into()], &["a=2,2".into()]).unwrap();
        assert_eq!(request["a"].shape(), &[2, 2]);
        assert!(parse_request(&["a=1,x".into()], &[]).is_err());
        assert!(parse_request(&["a=1".into(), "a=2".into()], &[]).is_err());
        assert!(parse_request(&["a=1".into()], &["b=1".into()]).is_err());
        assert!(parse_request(&["a=1,2,3".into()], &["a=2,2".into()]).is_err());
        assert!(split_pair("=1").is_err());
    }

    #[test]
    fn inspect_lists_nodes_and_plugin_tensors() {
        let file = definition_file(ADD_ONE);
        let text = inspect(&args(&file)).unwrap();
        assert!(text.starts_with("pipeline add_one\n"));
        assert!(text.contains("in  input_numbers [-1,-1] FP32"));
        assert!(text.contains("out output_numbers [-1,-1] FP32"));
        assert!(text.contains("request.in → add.input_numbers"));
    }

    #[test]
    fn model_nodes_are_rejected_before_build() {
        let json = r#"{
            "name": "classify",
            "nodes": [
                { "name": "request", "kind": { "type": "entry" } },
                { "name": "net", "kind": { "type": "model", "model_name": "resnet" } },
                { "name": "response", "kind": { "type": "exit" } }
            ],
            "connections": [
                { "from": "request", "to": "net", "mapping": [ { "output": "in", "input": "x" } ] },
                { "from": "net", "to": "response", "mapping": [ { "output": "y", "input": "out" } ] }
            ]
        }"#;
        let file = definition_file(json);
        let err = run(&args(&file), &["in=1".into()], &[]).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("model nodes (net)"));
        assert!(text.contains("no inference backend"));
        assert!(inspect(&args(&file)).is_err());
    }

    #[test]
    fn bad_definition_reports_path() {
        let file = definition_file("{ not json");
        let err = run(&args(&file), &[], &[]).unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
    }
}
