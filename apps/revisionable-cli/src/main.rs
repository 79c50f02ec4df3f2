use anyhow::Context;
use clap::{Parser, Subcommand};
use revisionable_common::{AssociationSpec, Value};
use revisionable_kernel::{EntityModel, EntityStore, FieldKind, MemoryStore, Schema};
use revisionable_persist::{
    Backend, Encoding, RevisionContext, RevisionOptions, Revisioner, SnapshotPayload, SnapshotTable, codec, layout,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "revisionable-cli", about = "CLI tool for record revision history")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and supported formats
    Info,
    /// Print the DDL for the snapshot table
    Schema {
        /// Table name
        #[arg(short, long, default_value = layout::DEFAULT_TABLE)]
        table: String,
        /// Target backend: sqlite, mysql or postgres
        #[arg(short, long, default_value = "sqlite")]
        backend: Backend,
    },
    /// Validate a revisioning configuration file (YAML or JSON)
    CheckConfig {
        file: PathBuf,
    },
    /// Revise a post several times, then restore the oldest kept revision
    Demo {
        /// Number of revisioned updates
        #[arg(short, long, default_value = "5")]
        mutations: usize,
        /// Revisions kept per record
        #[arg(short, long, default_value = "3")]
        limit: usize,
        /// Payload encoding: cbor, json, yaml or xml
        #[arg(short, long, default_value = "cbor")]
        encoding: Encoding,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("revisionable-cli v{}", env!("CARGO_PKG_VERSION"));
            let encodings: Vec<&str> = Encoding::ALL.iter().map(|e| e.name()).collect();
            println!("encodings: {}", encodings.join(", "));
            let backends: Vec<&str> = Backend::ALL.iter().map(|b| b.name()).collect();
            println!("backends: {}", backends.join(", "));
            println!("snapshot table: {}", layout::DEFAULT_TABLE);
        }
        Commands::Schema { table, backend } => {
            for statement in SnapshotTable::new(table).ddl(backend) {
                println!("{statement};");
            }
            if let Some(limit) = backend.payload_limit() {
                println!("-- payloads larger than {limit} bytes are rejected by {backend}");
            }
        }
        Commands::CheckConfig { file } => check_config(&file)?,
        Commands::Demo {
            mutations,
            limit,
            encoding,
        } => demo(mutations, limit, encoding)?,
    }

    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let options = if is_json {
        RevisionOptions::from_json_str(&text)
    } else {
        RevisionOptions::from_yaml_str(&text)
    }
    .with_context(|| format!("invalid configuration in {}", path.display()))?;

    println!("associations: {}", options.associations);
    println!("limit: {}", options.limit.map_or("none".to_owned(), |l| l.to_string()));
    println!(
        "minimum_age: {}",
        options
            .minimum_age
            .map_or("none".to_owned(), |age| format!("{}s", age.num_seconds()))
    );
    println!("on_update: {}, on_destroy: {}", options.on_update, options.on_destroy);
    println!("dependent: {:?}", options.dependent);
    println!("encoding: {}", options.encoding);
    for (column, source) in &options.meta {
        println!("meta {column}: {source:?}");
    }
    Ok(())
}

fn demo_schema() -> anyhow::Result<Schema> {
    Ok(Schema::new()
        .with(
            EntityModel::new("Post")
                .key("id", FieldKind::Int)
                .required("title", FieldKind::Text)
                .has_many("comments", "Comment", &["post_id"]),
        )?
        .with(
            EntityModel::new("Comment")
                .key("id", FieldKind::Int)
                .field("post_id", FieldKind::Int)
                .field("body", FieldKind::Text),
        )?)
}

fn demo(mutations: usize, limit: usize, encoding: Encoding) -> anyhow::Result<()> {
    println!("Revision demo: mutations={mutations}, limit={limit}, encoding={encoding}");
    let mut store = MemoryStore::new(demo_schema()?);
    let ctx = RevisionContext::new();

    let mut post = store.schema().new_record("Post")?;
    post.set("title", "draft 0")?;
    store.save(&mut post)?;
    let id = post.identity().context("post has no identity after save")?;
    let post_id = post.get("id").cloned().context("post has no id column")?;
    for body in ["first!", "nice post"] {
        let mut comment = store.schema().new_record("Comment")?;
        comment.set("post_id", post_id.clone())?;
        comment.set("body", body)?;
        store.save(&mut comment)?;
    }

    let options = RevisionOptions::new()
        .with_associations(AssociationSpec::new().include("comments"))
        .with_limit(limit)
        .with_on_update(true)
        .with_encoding(encoding);
    let revisioner = Revisioner::new(store.schema(), "Post", options)?;

    for i in 1..=mutations {
        post.set("title", format!("draft {i}"))?;
        revisioner.update(&mut store, &mut post, ctx)?;
    }
    tracing::info!(%id, mutations, "updates applied");

    let revisions = revisioner.revisions(&store, &id)?;
    println!("Kept {} revisions of Post {id}:", revisions.len());
    for snapshot in &revisions {
        let tree = snapshot.attributes()?;
        println!(
            "  #{} title={} size={}B format={} at {}",
            snapshot.revision,
            tree.scalar("title").unwrap_or(&Value::Null),
            snapshot.payload.len(),
            codec::encoding_of(&snapshot.payload)?,
            snapshot.created_at.to_rfc3339(),
        );
    }

    let Some(oldest) = revisions.last() else {
        println!("Nothing to restore");
        return Ok(());
    };
    let restored = revisioner
        .restore_revision_and_commit(&mut store, &id, oldest.revision, ctx)?
        .context("revision disappeared before restore")?;
    let current = store
        .fetch("Post", &id)?
        .context("post missing after restore")?;
    println!(
        "Restored revision {}: title={} comments={}",
        oldest.revision,
        current.get("title").unwrap_or(&Value::Null),
        restored.children("comments").map_or(0, |comments| comments.len()),
    );
    println!(
        "Latest revision now #{}",
        revisioner.last_revision(&store, &id)?.map_or(0, |s| s.revision)
    );
    Ok(())
}
