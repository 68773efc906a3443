//! dmreg CLI: check, print and pack datamodel definition files.

use clap::{Parser, Subcommand};
use dmreg_core::config::RegistryConfig;
use dmreg_core::hash::hash_bytes;
use dmreg_core::schema::{Node, Payload, SchemaTree};
use dmreg_core::NodeId;
use dmreg_exec::Engine;
use dmreg_query::dsl::yaml::{parse_definitions, Definitions, NodeDef};
use dmreg_query::{CompletionFn, Query};
use dmreg_reloc::schema_block::{pack_adjacent_at, rebase, unpack};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "dmreg")]
#[command(about = "Datamodel registry: validate, dump and pack definition files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a definition file's schema and queries into an empty registry
    Validate {
        /// Path to the definition YAML file
        #[arg(short, long)]
        file: PathBuf,

        /// Per-node query cap (overrides config)
        #[arg(long)]
        max_queries_per_node: Option<usize>,
    },

    /// Print the merged schema tree
    Dump {
        /// Path to the definition YAML file
        #[arg(short, long)]
        file: PathBuf,

        /// Emit JSON instead of an indented tree
        #[arg(long)]
        json: bool,
    },

    /// Pack the schema into a relocatable block and verify a rebase round trip
    Pack {
        /// Path to the definition YAML file
        #[arg(short, long)]
        file: PathBuf,

        /// Base address to lay the block out at (overrides config)
        #[arg(long)]
        base: Option<u64>,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate {
            file,
            max_queries_per_node,
        } => validate(&file, max_queries_per_node),
        Commands::Dump { file, json } => dump(&file, json),
        Commands::Pack { file, base } => pack(&file, base),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn load(path: &Path) -> CliResult<Definitions> {
    let src = fs::read_to_string(path)?;
    Ok(parse_definitions(&src)?)
}

/// Environment first, then the file's `config:` section, then CLI flags.
fn effective_config(defs: &Definitions, max_queries_per_node: Option<usize>) -> RegistryConfig {
    let mut cfg = RegistryConfig::from_env();
    cfg.apply(&defs.config);
    if let Some(v) = max_queries_per_node {
        cfg.max_queries_per_node = Some(v);
    }
    cfg
}

fn validate(path: &Path, max_queries_per_node: Option<usize>) -> CliResult<()> {
    let defs = load(path)?;
    let cfg = effective_config(&defs, max_queries_per_node);
    let schema = defs.build_schema()?;
    let discard: CompletionFn = Arc::new(|_, _| {});
    let queries: Vec<Query> = defs.build_queries(discard)?;
    let names: Vec<String> = queries.iter().map(|q| q.name.clone()).collect();

    let engine = Engine::new(cfg)?;
    let ids = engine.registry().register_provider(Some(&schema), queries)?;
    let nodes = engine.registry().read_tree(SchemaTree::len);
    engine.shutdown();

    println!("✓ {} is valid", path.display());
    println!("  Schema nodes: {}", nodes);
    for (name, id) in names.iter().zip(ids) {
        println!("  Query {} -> {}", name, id);
    }
    Ok(())
}

fn merged_tree(defs: &Definitions) -> CliResult<SchemaTree> {
    let schema = defs.build_schema()?;
    let engine = Engine::new(effective_config(defs, None))?;
    engine.registry().register_provider(Some(&schema), Vec::new())?;
    let tree = engine.registry().snapshot();
    engine.shutdown();
    Ok(tree)
}

fn dump(path: &Path, json: bool) -> CliResult<()> {
    let tree = merged_tree(&load(path)?)?;
    let Some(root) = tree.root() else {
        return Err("registry has no root".into());
    };
    if json {
        let defs = tree
            .children(root)
            .iter()
            .map(|c| to_def(&tree, *c))
            .collect::<Option<Vec<_>>>()
            .ok_or("dangling node id")?;
        println!("{}", serde_json::to_string_pretty(&defs)?);
    } else {
        print!("{}", render(&tree, root));
    }
    Ok(())
}

fn pack(path: &Path, base: Option<u64>) -> CliResult<()> {
    let defs = load(path)?;
    let cfg = effective_config(&defs, None);
    let base = base.unwrap_or(cfg.block_base);
    let tree = merged_tree(&defs)?;
    let root = tree.root().ok_or("registry has no root")?;

    let mut block = pack_adjacent_at(&tree, root, base)?;
    let checksum = hash_bytes(&block);
    let moved_to = base.wrapping_add(0x10_0000).max(1);
    rebase(&mut block, base, moved_to)?;
    let back = unpack(&block, moved_to)?;
    let back_root = back.root().ok_or("decoded block has no root")?;
    if !tree.structurally_eq(root, &back, back_root) {
        return Err("rebased block does not match the schema".into());
    }

    println!("✓ Packed {} nodes", tree.len());
    println!("  Block size: {} bytes", block.len());
    println!("  Base: {:#x}", base);
    println!("  Checksum: {}", checksum);
    println!("  Rebase to {:#x}: round trip ok", moved_to);
    Ok(())
}

fn describe(node: &Node) -> String {
    let mut s = format!("{}: {}", node.name, node.kind);
    if node.array {
        s.push_str("[]");
    }
    match &node.payload {
        Payload::Source { returns, .. } | Payload::Event { returns, .. } => {
            s.push_str(&format!(" -> {}", returns));
        }
        Payload::Object { ident, .. } => s.push_str(&format!(" [{}]", ident.kind())),
        Payload::Reference { path } => s.push_str(&format!(" = {}", path)),
        Payload::None => {}
    }
    if !node.queries().is_empty() {
        s.push_str(&format!(" ({} queries)", node.queries().len()));
    }
    s
}

fn render(tree: &SchemaTree, root: NodeId) -> String {
    let mut out = String::new();
    let mut work = vec![(root, 0usize)];
    while let Some((id, depth)) = work.pop() {
        let Some(node) = tree.node(id) else { continue };
        out.push_str(&"  ".repeat(depth));
        out.push_str(&describe(node));
        out.push('\n');
        for c in node.children().iter().rev() {
            work.push((*c, depth + 1));
        }
    }
    out
}

/// The definition-file form of the subtree at `id`.
fn to_def(tree: &SchemaTree, id: NodeId) -> Option<NodeDef> {
    let node = tree.node(id)?;
    let mut def = NodeDef {
        kind: node.kind.to_string(),
        name: node.name.clone(),
        array: node.array,
        returns: None,
        ident: None,
        path: None,
        children: Vec::with_capacity(node.children().len()),
    };
    match &node.payload {
        Payload::Source { returns, .. } | Payload::Event { returns, .. } => {
            def.returns = Some(returns.to_string())
        }
        Payload::Object { ident, .. } => def.ident = Some(ident.kind().to_string()),
        Payload::Reference { path } => def.path = Some(path.clone()),
        Payload::None => {}
    }
    for c in node.children() {
        def.children.push(to_def(tree, *c)?);
    }
    Some(def)
}
