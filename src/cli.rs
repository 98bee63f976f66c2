use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::Token;
use crate::cancellation::{CancelRedundantPipelinesService, LogAuditSink};
use crate::config::{Config, OutputFormat};
use crate::domain::{PipelineId, PipelineSource, ProjectId, ScheduleId, UserId};
use crate::output;
use crate::providers::gitlab::GitLabClient;
use crate::schedules::{
    CreatePipelineRequest, CreatePipelineService, LogErrorTracker, PipelineScheduleSweeper,
    RunOptions, RunPipelineScheduleWorker, SweepEntry,
};
use crate::store::{MemoryStore, PipelineStore, Relation, StateSnapshot};

#[derive(Parser)]
#[command(name = "ci-autocancel")]
#[command(author, version, about = "Cancels redundant CI pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./ci-autocancel.{toml,json,yaml,yml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// State file holding projects, pipelines and schedules
    #[arg(short, long, global = true, env = "CI_AUTOCANCEL_STATE")]
    state: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Cancel pipelines made redundant by an existing pipeline
    CancelRedundant {
        #[arg(short = 'P', long)]
        pipeline: PipelineId,
    },
    /// Create a pipeline for the current head of a ref
    CreatePipeline {
        #[arg(short = 'P', long)]
        project: ProjectId,

        #[arg(short, long = "ref")]
        ref_: String,

        #[arg(long, default_value = "push")]
        source: PipelineSource,

        #[arg(short, long, default_value_t = 1)]
        user: UserId,
    },
    /// Fire one pipeline schedule
    RunSchedule {
        #[arg(short = 'S', long)]
        schedule: ScheduleId,

        #[arg(short, long)]
        user: UserId,

        /// `next_run_at` was already advanced by the caller
        #[arg(long, default_value_t = false)]
        next_run_scheduled: bool,
    },
    /// Fire every due pipeline schedule
    Sweep {
        /// Keep sweeping until interrupted
        #[arg(short, long, default_value_t = false)]
        watch: bool,
    },
    /// Refresh ref heads from GitLab
    SyncHeads {
        #[arg(short = 'P', long)]
        project: ProjectId,

        #[arg(short, long = "ref", required = true)]
        refs: Vec<String>,

        #[arg(short, long, env = "GITLAB_TOKEN")]
        token: Option<String>,
    },
    /// List a project's pipelines and schedules
    Show {
        #[arg(short = 'P', long)]
        project: ProjectId,
    },
    /// Write the effective configuration to a file
    InitConfig {
        /// Format follows the extension (.toml, .json, .yaml, .yml)
        #[arg(default_value = "ci-autocancel.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long, default_value_t = false)]
        force: bool,
    },
}

/// Loaded configuration and state for one command.
struct Workspace {
    config: Config,
    state_path: PathBuf,
    store: Arc<MemoryStore>,
}

impl Workspace {
    fn open(config_path: Option<&Path>, state_path: Option<&Path>) -> Result<Self> {
        let config = Config::load(config_path)?;
        let state_path = match state_path {
            Some(path) => path.to_path_buf(),
            None => StateSnapshot::default_path()?,
        };
        let snapshot = StateSnapshot::load_or_default(&state_path)?;

        Ok(Self {
            config,
            state_path,
            store: Arc::new(MemoryStore::from_snapshot(snapshot)),
        })
    }

    fn save(&self) -> Result<()> {
        self.store
            .snapshot()
            .context("Failed to snapshot state")?
            .save(&self.state_path)?;
        info!("State written to: {}", self.state_path.display());
        Ok(())
    }

    fn creator(&self) -> CreatePipelineService<MemoryStore> {
        CreatePipelineService::new(
            self.store.clone(),
            Arc::new(self.config.features.clone()),
            Arc::new(LogAuditSink),
            self.config.cancellation_settings(),
        )
    }

    fn worker(&self) -> RunPipelineScheduleWorker<CreatePipelineService<MemoryStore>> {
        RunPipelineScheduleWorker::new(
            self.store.clone(),
            self.store.clone(),
            Arc::new(self.creator()),
            Arc::new(self.config.features.clone()),
        )
        .with_tracker(Arc::new(LogErrorTracker))
    }
}

impl Cli {
    fn wants_json(&self, config: &Config) -> bool {
        self.json || config.output.format == OutputFormat::Json
    }

    fn print_json<T: Serialize>(&self, config: &Config, value: &T) -> Result<()> {
        let json_output = if self.pretty || config.output.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        println!("{json_output}");
        Ok(())
    }

    async fn execute_cancel_redundant(&self, workspace: &Workspace, id: PipelineId) -> Result<()> {
        let pipeline = workspace
            .store
            .pipeline(id)?
            .with_context(|| format!("Pipeline {id} not found"))?;

        let settings = workspace.config.cancellation_settings();
        let report = CancelRedundantPipelinesService::new(
            &pipeline,
            workspace.store.as_ref(),
            &workspace.config.features,
            &LogAuditSink,
            &settings,
        )
        .execute()
        .await
        .with_context(|| format!("Failed to cancel redundant pipelines for {id}"))?;

        workspace.save()?;

        if self.wants_json(&workspace.config) {
            self.print_json(&workspace.config, &report)
        } else {
            output::print_cancellation(&report);
            Ok(())
        }
    }

    async fn execute_create_pipeline(
        &self,
        workspace: &Workspace,
        project: ProjectId,
        ref_: &str,
        source: PipelineSource,
        user: UserId,
    ) -> Result<()> {
        info!("Creating {source} pipeline for project {project} on {ref_}");

        let response = workspace
            .creator()
            .execute(CreatePipelineRequest::new(project, ref_, source, user))
            .await?;

        workspace.save()?;

        if self.wants_json(&workspace.config) {
            self.print_json(&workspace.config, &response)
        } else {
            output::print_creation(&response);
            Ok(())
        }
    }

    async fn execute_run_schedule(
        &self,
        workspace: &Workspace,
        schedule: ScheduleId,
        user: UserId,
        next_run_scheduled: bool,
    ) -> Result<()> {
        let outcome = workspace
            .worker()
            .perform(schedule, user, RunOptions { next_run_scheduled })
            .await;

        workspace.save()?;

        let entries = [SweepEntry {
            schedule_id: schedule,
            outcome,
        }];
        if self.wants_json(&workspace.config) {
            self.print_json(&workspace.config, &entries[0])
        } else {
            output::print_schedule_runs(&entries);
            Ok(())
        }
    }

    async fn execute_sweep(&self, workspace: &Workspace, watch: bool) -> Result<()> {
        let sweeper =
            PipelineScheduleSweeper::new(workspace.store.clone(), Arc::new(workspace.worker()));

        if watch {
            let period = workspace.config.sweep_interval();
            info!("Sweeping pipeline schedules every {period:?}");
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {e}");
                }
            };
            let persist = |entries: &[SweepEntry]| {
                if entries.is_empty() {
                    return;
                }
                if let Err(e) = workspace.save() {
                    warn!("Failed to persist state after sweep: {e:#}");
                }
            };
            let sweeps = sweeper.watch(period, shutdown, persist).await;
            info!("Ran {sweeps} sweep(s)");
            return Ok(());
        }

        let entries = sweeper.sweep(Utc::now()).await?;
        workspace.save()?;

        if self.wants_json(&workspace.config) {
            self.print_json(&workspace.config, &entries)
        } else {
            output::print_schedule_runs(&entries);
            Ok(())
        }
    }

    async fn execute_sync_heads(
        &self,
        workspace: &Workspace,
        project_id: ProjectId,
        refs: &[String],
        token: Option<&str>,
    ) -> Result<()> {
        let project = workspace
            .store
            .project(project_id)?
            .with_context(|| format!("Project {project_id} not found"))?;

        let token = token
            .or(workspace.config.gitlab.token.as_deref())
            .map(Token::from);
        let client = GitLabClient::new(&workspace.config.gitlab.base_url, token)?;

        let mut synced = Vec::new();
        for (branch, result) in client.branch_heads(project.id, &project.path, refs).await {
            match result {
                Ok(Some(head)) => {
                    info!("{} head of {branch} is {}", project.path, head.sha);
                    workspace.store.set_ref_head(head.clone())?;
                    synced.push(head);
                }
                Ok(None) => warn!("Branch {branch} not found in {}", project.path),
                Err(e) => warn!("Failed to fetch {branch} from {}: {e}", project.path),
            }
        }

        workspace.save()?;

        if self.wants_json(&workspace.config) {
            self.print_json(&workspace.config, &synced)
        } else {
            for head in &synced {
                println!("{} {}", head.ref_, head.sha);
            }
            Ok(())
        }
    }

    fn execute_show(&self, workspace: &Workspace, project: ProjectId) -> Result<()> {
        let mut pipelines = workspace.store.pipelines(&Relation::for_project(project))?;
        pipelines.sort_by_key(|p| p.id);

        let mut schedules: Vec<_> = workspace
            .store
            .snapshot()?
            .schedules
            .into_iter()
            .filter(|s| s.project_id == project)
            .collect();
        schedules.sort_by_key(|s| s.id);

        if self.wants_json(&workspace.config) {
            #[derive(Serialize)]
            struct Listing<'a> {
                pipelines: &'a [crate::domain::Pipeline],
                schedules: &'a [crate::domain::PipelineSchedule],
            }
            self.print_json(
                &workspace.config,
                &Listing {
                    pipelines: &pipelines,
                    schedules: &schedules,
                },
            )
        } else {
            let mut rows = Vec::with_capacity(pipelines.len());
            for pipeline in pipelines {
                let builds = workspace.store.builds_for(pipeline.id)?;
                rows.push((pipeline, builds));
            }
            output::print_pipelines(&rows, &schedules);
            Ok(())
        }
    }

    fn execute_init_config(&self, workspace: &Workspace, path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "Config file already exists: {} (use --force to overwrite)",
                path.display()
            );
        }

        workspace.config.save(path)?;
        info!("Configuration written to: {}", path.display());
        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        let workspace = Workspace::open(self.config.as_deref(), self.state.as_deref())?;

        match &self.command {
            Commands::CancelRedundant { pipeline } => {
                self.execute_cancel_redundant(&workspace, *pipeline).await
            }
            Commands::CreatePipeline {
                project,
                ref_,
                source,
                user,
            } => {
                self.execute_create_pipeline(&workspace, *project, ref_, *source, *user)
                    .await
            }
            Commands::RunSchedule {
                schedule,
                user,
                next_run_scheduled,
            } => {
                self.execute_run_schedule(&workspace, *schedule, *user, *next_run_scheduled)
                    .await
            }
            Commands::Sweep { watch } => self.execute_sweep(&workspace, *watch).await,
            Commands::SyncHeads {
                project,
                refs,
                token,
            } => {
                self.execute_sync_heads(&workspace, *project, refs, token.as_deref())
                    .await
            }
            Commands::Show { project } => self.execute_show(&workspace, *project),
            Commands::InitConfig { path, force } => {
                self.execute_init_config(&workspace, path, *force)
            }
        }
    }
}
