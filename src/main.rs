use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use filesync::cancel::{CancelController, CancelOptions};
use filesync::cli::{Cli, Commands, EXIT_CONFIG_ERROR, EXIT_SUCCESS, EXIT_TARGET_FAILURE};
use filesync::config;
use filesync::forge::github::GitHubForge;
use filesync::forge::Forge;
use filesync::git::Author;
use filesync::naming::DEFAULT_BRANCH_PREFIX;
use filesync::orchestrator::Orchestrator;
use filesync::resource::Pools;
use filesync::scheduler::GroupFilter;
use tokio_util::sync::CancellationToken;

fn init_logging(verbose: u8) {
    if std::env::var_os("NO_COLOR").is_some() {
        colored::control::set_override(false);
    }
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    flexi_logger::Logger::try_with_str(level)
        .expect("log level filter string is always valid")
        .format(|w, now, record| {
            write!(
                w,
                "[{}] {} {}",
                now.format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                &record.args()
            )
        })
        .start()
        .expect("starting logger");
}

fn group_filter(groups: Vec<String>, skip_groups: Vec<String>) -> GroupFilter {
    GroupFilter {
        only: groups,
        skip: skip_groups,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match config::load(&cli.config) {
        Ok(c) => c,
        Err(err) => {
            log::error!("loading config {}: {err}", cli.config.display());
            return ExitCode::from(EXIT_CONFIG_ERROR as u8);
        }
    };

    match cli.command {
        Commands::Validate => {
            log::info!("config is valid: {} group(s)", config.groups.len());
            ExitCode::from(EXIT_SUCCESS as u8)
        }

        Commands::Sync { dry_run, groups, skip_groups, automerge, repos } => {
            let forge = match GitHubForge::from_env() {
                Ok(f) => Arc::new(f) as Arc<dyn Forge>,
                Err(err) => {
                    log::error!("building forge client: {err}");
                    return ExitCode::from(EXIT_CONFIG_ERROR as u8);
                }
            };
            let orchestrator = Orchestrator {
                forge,
                git_binary: which_git(),
                author: Author {
                    name: "filesync-bot".to_string(),
                    email: "filesync-bot@users.noreply.github.com".to_string(),
                },
                branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
                dry_run,
                automerge,
                max_parallel_targets: 8,
                pools: Arc::new(Pools::new()),
            };
            let filter = group_filter(groups, skip_groups);
            let result = orchestrator
                .run(&config, &filter, &repos, CancellationToken::new(), None)
                .await;
            for report in &result.reports {
                log::info!("{}/{}: {:?}", report.group_id, report.repo, report.status);
            }
            ExitCode::from(result.exit_code() as u8)
        }

        Commands::Status { groups, skip_groups } => {
            let forge = match GitHubForge::from_env() {
                Ok(f) => Arc::new(f) as Arc<dyn Forge>,
                Err(err) => {
                    log::error!("building forge client: {err}");
                    return ExitCode::from(EXIT_CONFIG_ERROR as u8);
                }
            };
            let filter = group_filter(groups, skip_groups);
            let ct = CancellationToken::new();
            for layer in filesync::scheduler::plan(&config, &filter) {
                for group in layer {
                    let source = match forge
                        .get_latest_commit(&group.source.repo, &group.source.branch, &ct)
                        .await
                    {
                        Ok(sha) => filesync::state::SourceState {
                            repo: group.source.repo.clone(),
                            branch: group.source.branch.clone(),
                            latest_commit_sha: sha,
                        },
                        Err(err) => {
                            println!("{}: error resolving source state: {err}", group.id);
                            continue;
                        }
                    };
                    for target in &group.targets {
                        match filesync::state::resolve_target_state(
                            forge.as_ref(),
                            &target.repo,
                            DEFAULT_BRANCH_PREFIX,
                            &group.id,
                            &ct,
                        )
                        .await
                        {
                            Ok(state) if state.needs_sync(&source) => {
                                println!("{}/{}: never synced or behind source", group.id, target.repo)
                            }
                            Ok(_) => println!("{}/{}: up to date", group.id, target.repo),
                            Err(err) => println!("{}/{}: error resolving state: {err}", group.id, target.repo),
                        }
                    }
                }
            }
            ExitCode::from(EXIT_SUCCESS as u8)
        }

        Commands::Cancel { groups, skip_groups, dry_run, keep_branches, comment, repos } => {
            let forge = match GitHubForge::from_env() {
                Ok(f) => Arc::new(f) as Arc<dyn Forge>,
                Err(err) => {
                    log::error!("building forge client: {err}");
                    return ExitCode::from(EXIT_CONFIG_ERROR as u8);
                }
            };
            let controller = CancelController {
                forge,
                options: CancelOptions {
                    branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
                    dry_run,
                    keep_branches,
                    comment,
                },
            };
            let filter = group_filter(groups, skip_groups);
            let results = controller.cancel_all(&config, &filter, &repos, &CancellationToken::new()).await;
            let mut any_failed = false;
            for (group_id, target_results) in &results {
                for target_result in target_results {
                    match &target_result.outcome {
                        Ok(outcome) => log::info!("{group_id}/{}: {outcome:?}", target_result.repo),
                        Err(err) => {
                            any_failed = true;
                            log::error!("{group_id}/{}: {err}", target_result.repo);
                        }
                    }
                }
            }
            ExitCode::from(if any_failed { EXIT_TARGET_FAILURE as u8 } else { EXIT_SUCCESS as u8 })
        }

        Commands::Diagnose => {
            let forge_ok = GitHubForge::from_env().is_ok();
            println!("forge auth: {}", if forge_ok { "ok" } else { "FAILED (check GH_TOKEN/GITHUB_TOKEN)" });
            println!("config groups: {}", config.groups.len());
            ExitCode::from(if forge_ok { EXIT_SUCCESS as u8 } else { EXIT_CONFIG_ERROR as u8 })
        }
    }
}

fn which_git() -> std::path::PathBuf {
    std::path::PathBuf::from("git")
}
