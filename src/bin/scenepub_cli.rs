//! ScenePub CLI - Bridge interface for pipeline tools
//!
//! Commands: templates, parse, render, next-version, collect, publish,
//! resolve-roots, render-path, secondary
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 when a publish task fails

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scenepub_core::host::ProcessEnv;
use scenepub_core::session::prepare_render_path;
use scenepub_core::{
    collect_current_session, publish_secondary_geometry, resolve_local_storage_root,
    versioning::next_version_on_disk, Fields, HostContext, LocalTracker, MemoryScene,
    PublishConfig, PublishPipeline, RunContext, SecondaryTask, TemplateRegistry,
};

#[derive(Parser)]
#[command(name = "scenepub-cli")]
#[command(about = "ScenePub CLI - Scene Publish Orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the publish configuration (YAML)
    #[arg(short, long, default_value = "scenepub.yml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured templates
    Templates,

    /// Extract template fields from a path
    Parse {
        #[arg(short, long)]
        template: String,

        #[arg(short, long)]
        path: String,
    },

    /// Build a path from template fields
    Render {
        #[arg(short, long)]
        template: String,

        /// JSON object of field values
        #[arg(short, long)]
        fields: String,
    },

    /// Next free version of a path on disk
    NextVersion {
        #[arg(short, long)]
        template: String,

        #[arg(short, long)]
        path: String,
    },

    /// Collect publish items from a scene document
    Collect {
        #[arg(short, long)]
        scene: PathBuf,
    },

    /// Collect, validate, publish and finalize a scene document
    Publish {
        #[arg(short, long)]
        scene: PathBuf,

        /// Tracking ledger (JSON), created when missing
        #[arg(short, long)]
        ledger: PathBuf,

        /// Tasks to skip, as `plugin=item`
        #[arg(long)]
        uncheck: Vec<String>,
    },

    /// Repoint references authored against another storage root
    ResolveRoots {
        #[arg(short, long)]
        scene: PathBuf,
    },

    /// Point the scene's render output at its templated render folder
    RenderPath {
        #[arg(short, long)]
        scene: PathBuf,
    },

    /// Export and register a batch of geometry nodes
    Secondary {
        #[arg(short, long)]
        scene: PathBuf,

        #[arg(short, long)]
        ledger: PathBuf,

        /// JSON array of tasks
        #[arg(short, long)]
        tasks: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "scenepub=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn emit(value: &impl Serialize) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn fail(error: impl Display) -> ExitCode {
    let output = serde_json::json!({
        "success": false,
        "error": error.to_string(),
    });
    println!("{}", output);
    ExitCode::FAILURE
}

fn load_scene(path: &Path) -> Result<MemoryScene, String> {
    MemoryScene::load(path).map_err(|e| format!("Failed to load scene: {}", e))
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match PublishConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => return fail(format!("Failed to load config: {}", e)),
    };
    let registry = match config.template_registry() {
        Ok(r) => r,
        Err(e) => return fail(format!("Failed to build templates: {}", e)),
    };

    match cli.command {
        Commands::Templates => {
            let templates: Vec<_> = registry
                .list()
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name(),
                        "definition": t.definition(),
                        "keys": t.keys().map(|k| k.name.clone()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            emit(&templates)
        }

        Commands::Parse { template, path } => match registry.require(&template) {
            Ok(t) => match t.parse(&path) {
                Ok(fields) => emit(&fields),
                Err(e) => fail(e),
            },
            Err(e) => fail(e),
        },

        Commands::Render { template, fields } => {
            let fields: Fields = match serde_json::from_str(&fields) {
                Ok(f) => f,
                Err(e) => return fail(format!("Invalid fields: {}", e)),
            };
            match registry.require(&template).and_then(|t| t.render(&fields)) {
                Ok(path) => emit(&serde_json::json!({ "path": path })),
                Err(e) => fail(e),
            }
        }

        Commands::NextVersion { template, path } => {
            match registry
                .require(&template)
                .and_then(|t| next_version_on_disk(t, &path))
            {
                Ok(bump) => emit(&bump),
                Err(e) => fail(e),
            }
        }

        Commands::Collect { scene } => {
            let mut doc = match load_scene(&scene) {
                Ok(d) => d,
                Err(e) => return fail(e),
            };
            let host = HostContext::new(&mut doc, &ProcessEnv);
            match collect_current_session(&host, &registry, &config.collector) {
                Ok(tree) => emit(&tree),
                Err(e) => fail(e),
            }
        }

        Commands::Publish {
            scene,
            ledger,
            uncheck,
        } => publish(&config, &registry, &scene, &ledger, &uncheck),

        Commands::ResolveRoots { scene } => {
            let mut doc = match load_scene(&scene) {
                Ok(d) => d,
                Err(e) => return fail(e),
            };
            let update = {
                let mut host = HostContext::new(&mut doc, &ProcessEnv);
                resolve_local_storage_root(&mut host)
            };
            match update {
                Ok(update) => {
                    if update.is_some() {
                        if let Err(e) = doc.write(&scene) {
                            return fail(e);
                        }
                    }
                    emit(&update)
                }
                Err(e) => fail(e),
            }
        }

        Commands::RenderPath { scene } => {
            let Some(render_template) = config.session.render_template.as_deref() else {
                return fail("No render template is configured");
            };
            let mut doc = match load_scene(&scene) {
                Ok(d) => d,
                Err(e) => return fail(e),
            };
            let Some(file) = doc.current_file.clone() else {
                return fail("The scene has never been saved");
            };
            let path = {
                let mut host = HostContext::new(&mut doc, &ProcessEnv);
                prepare_render_path(&mut host, &registry, &config.context, render_template, &file)
            };
            match path {
                Some(path) => match doc.write(&scene) {
                    Ok(()) => emit(&serde_json::json!({ "render_path": path })),
                    Err(e) => fail(e),
                },
                None => fail("Could not prepare the render path"),
            }
        }

        Commands::Secondary {
            scene,
            ledger,
            tasks,
        } => {
            let tasks: Vec<SecondaryTask> = match serde_json::from_str(&tasks) {
                Ok(t) => t,
                Err(e) => return fail(format!("Invalid tasks: {}", e)),
            };
            let Some(work) = config
                .collector
                .work_template
                .as_deref()
                .and_then(|name| registry.get(name))
            else {
                return fail("No work template is configured");
            };
            let mut doc = match load_scene(&scene) {
                Ok(d) => d,
                Err(e) => return fail(e),
            };
            let Some(session) = doc.current_file.clone() else {
                return fail("The scene has never been saved");
            };
            let mut tracker = match LocalTracker::open(&ledger) {
                Ok(t) => t,
                Err(e) => return fail(e),
            };
            let mut host = HostContext::new(&mut doc, &ProcessEnv);
            match publish_secondary_geometry(
                &mut host,
                &registry,
                &mut tracker,
                &config.context,
                &tasks,
                work,
                &session,
            ) {
                Ok(outcome) => {
                    let code = emit(&outcome);
                    if outcome.is_success() {
                        code
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(e) => fail(e),
            }
        }
    }
}

fn publish(
    config: &PublishConfig,
    registry: &TemplateRegistry,
    scene: &Path,
    ledger: &Path,
    uncheck: &[String],
) -> ExitCode {
    let mut doc = match load_scene(scene) {
        Ok(d) => d,
        Err(e) => return fail(e),
    };
    let mut tracker = match LocalTracker::open(ledger) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    let mut pipeline = match PublishPipeline::from_config(config) {
        Ok(p) => p,
        Err(e) => return fail(e),
    };

    let report = {
        let mut host = HostContext::new(&mut doc, &ProcessEnv);
        if let Err(e) = resolve_local_storage_root(&mut host) {
            tracing::warn!(error = %e, "storage root check failed");
        }
        let mut tree = match collect_current_session(&host, registry, &config.collector) {
            Ok(t) => t,
            Err(e) => return fail(e),
        };

        let mut ctx = RunContext::new(host, registry, &config.context);
        pipeline.plan(&ctx, &tree);
        for entry in uncheck {
            let Some((plugin, item_name)) = entry.split_once('=') else {
                return fail(format!("Expected plugin=item, got '{}'", entry));
            };
            let items: Vec<_> = tree
                .preorder()
                .into_iter()
                .filter(|id| tree.item(*id).name == item_name)
                .collect();
            for item in items {
                if let Err(e) = pipeline.set_checked(&tree, plugin, item, false) {
                    return fail(e);
                }
            }
        }
        match pipeline.run(&mut ctx, &mut tree, &mut tracker) {
            Ok(report) => report,
            Err(e) => return fail(e),
        }
    };

    if let Err(e) = doc.write(scene) {
        return fail(e);
    }
    let code = emit(&report);
    if report.is_success() {
        code
    } else {
        ExitCode::from(2)
    }
}
