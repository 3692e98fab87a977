//! `devicedock` command line: a thin layer that parses arguments, builds a
//! [`DeviceSessionManager`] and prints what the library returns.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use devicedock_backend::{BackendClient, BackendConfig, DEFAULT_BACKEND_URL};
use devicedock_protocol::worker::SwipeDirection;
use devicedock_protocol::DeviceSession;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{resolve_viewer_base_url, ManagerConfig};
use crate::manager::DeviceSessionManager;
use crate::paths;
use crate::provisioning::StartOptions;

#[derive(Parser, Debug)]
#[command(name = "devicedock")]
#[command(about = "Start, drive and stop cloud devices")]
#[command(version)]
pub struct Cli {
    /// Session index to act on. Defaults to the active session.
    #[arg(short = 's', long = "session", global = true)]
    pub session: Option<usize>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, env = "DEVICEDOCK_BACKEND_URL", default_value = DEFAULT_BACKEND_URL, global = true)]
    pub backend_url: String,

    #[arg(long, env = "DEVICEDOCK_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "DEVICEDOCK_VIEWER_URL", global = true)]
    pub viewer_url: Option<String>,

    /// Directory holding the `.devicedock` session cache.
    #[arg(long, env = "DEVICEDOCK_WORK_DIR", global = true)]
    pub work_dir: Option<PathBuf>,

    /// Directory for logs.
    #[arg(long, env = "DEVICEDOCK_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision a new device session
    Start(StartArgs),
    /// Stop a session (or all of them)
    Stop {
        #[arg(long)]
        all: bool,
    },
    /// List tracked sessions
    List,
    /// Make a session the active one
    Use { index: usize },
    /// Show the active (or selected) session
    Info,
    /// Check that the worker and device are reachable
    Doctor,
    /// Reconcile the local cache with the backend
    Sync,
    /// Print the live viewer URL
    Watch {
        /// Keep running and reconcile periodically until interrupted.
        #[arg(long)]
        follow: bool,
    },
    /// Capture the screen
    Screenshot {
        /// Write the PNG here instead of the session screenshot folder.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Tap a point
    Tap(TapArgs),
    /// Type text into the field at a point
    Type {
        x: i32,
        y: i32,
        text: String,
        #[arg(long)]
        clear: bool,
    },
    /// Swipe from a point
    Swipe {
        x: i32,
        y: i32,
        direction: SwipeDirection,
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Install an app build from a URL
    Install {
        app_url: String,
        #[arg(long)]
        bundle_id: Option<String>,
    },
    /// Launch an installed app
    Launch { bundle_id: String },
    /// Open a URL or deep link on the device
    OpenUrl { url: String },
    /// Locate an element by description
    Find {
        target: String,
        /// Tap the element once found.
        #[arg(long)]
        tap: bool,
    },
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[arg(long, default_value = "android")]
    pub platform: String,
    #[arg(long)]
    pub app_id: Option<String>,
    #[arg(long)]
    pub build_version_id: Option<String>,
    #[arg(long)]
    pub app_url: Option<String>,
    #[arg(long)]
    pub app_link: Option<String>,
    #[arg(long)]
    pub app_package: Option<String>,
    #[arg(long)]
    pub test_id: Option<String>,
    /// Idle timeout in seconds.
    #[arg(long)]
    pub idle_timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct TapArgs {
    pub x: i32,
    pub y: i32,
    #[arg(long, conflicts_with = "long_press")]
    pub double: bool,
    /// Hold for this many milliseconds.
    #[arg(long)]
    pub long_press: Option<u64>,
}

impl StartArgs {
    fn into_options(self) -> StartOptions {
        StartOptions {
            platform: self.platform,
            app_id: self.app_id,
            build_version_id: self.build_version_id,
            app_url: self.app_url,
            app_link: self.app_link,
            app_package: self.app_package,
            test_id: self.test_id,
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
        }
    }
}

fn build_manager(cli: &Cli) -> anyhow::Result<DeviceSessionManager> {
    let api_key = cli
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .context("no API key: pass --api-key or set DEVICEDOCK_API_KEY")?;
    let backend = BackendClient::new(BackendConfig::new(&cli.backend_url, api_key))
        .context("failed to build backend client")?;
    let work_dir = paths::resolve_work_dir(cli.work_dir.as_deref())
        .context("failed to resolve work directory")?;
    let config = ManagerConfig::new(work_dir)
        .with_viewer_base_url(resolve_viewer_base_url(cli.viewer_url.as_deref()));
    DeviceSessionManager::new(config, backend).context("failed to start session manager")
}

/// Syncs with the backend, falling back to the local cache.
async fn refresh(manager: &DeviceSessionManager) {
    if let Err(err) = manager.sync_sessions().await {
        warn!(
            component = "cli",
            event = "cli.sync_failed",
            error = %err,
        );
        manager.load_persisted_session().await;
    }
}

fn emit(json: bool, value: Value, text: impl FnOnce() -> String) {
    if json {
        println!("{value}");
    } else {
        println!("{}", text());
    }
}

fn describe(session: &DeviceSession, active: Option<usize>) -> String {
    let marker = if active == Some(session.index) { "*" } else { " " };
    format!(
        "{marker} [{}] {} {} (session {}, started {})",
        session.index,
        session.platform,
        session.workflow_run_id,
        session.session_id,
        session.started_at.to_rfc3339(),
    )
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let manager = build_manager(&cli)?;
    refresh(&manager).await;

    let index = cli.session;
    let json = cli.json;
    match cli.command {
        Command::Start(args) => {
            let options = args.into_options();
            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });
            let started = manager.start_session(options, Some(&cancel)).await;
            watcher.abort();
            let started = started.context("failed to start session")?;
            emit(
                json,
                json!({
                    "index": started.index,
                    "device_ready": started.device_ready,
                    "session": started.session,
                }),
                || {
                    let mut text = format!(
                        "started session {} on {}\nviewer: {}",
                        started.index, started.session.platform, started.session.viewer_url
                    );
                    if !started.device_ready {
                        text.push_str(
                            "\ndevice not connected yet; run `devicedock doctor` to check again",
                        );
                    }
                    text
                },
            );
        }
        Command::Stop { all } => {
            if all {
                manager
                    .stop_all_sessions()
                    .await
                    .context("failed to stop sessions")?;
                emit(json, json!({"stopped": "all"}), || "stopped all sessions".into());
            } else {
                let session = manager.resolve_session(index).await?;
                manager
                    .stop_session(session.index)
                    .await
                    .with_context(|| format!("failed to stop session {}", session.index))?;
                emit(json, json!({"stopped": session.index}), || {
                    format!("stopped session {}", session.index)
                });
            }
        }
        Command::List => {
            let sessions = manager.list_sessions().await;
            let active = manager.active_index().await;
            emit(
                json,
                json!({"active": active, "sessions": sessions}),
                || {
                    if sessions.is_empty() {
                        return "no sessions".to_string();
                    }
                    sessions
                        .iter()
                        .map(|session| describe(session, active))
                        .collect::<Vec<_>>()
                        .join("\n")
                },
            );
        }
        Command::Use { index } => {
            manager.set_active(index).await?;
            emit(json, json!({"active": index}), || {
                format!("session {index} is now active")
            });
        }
        Command::Info => {
            let session = manager.resolve_session(index).await?;
            let active = manager.active_index().await;
            let anchor = manager.screen_anchor(session.index).await;
            emit(
                json,
                json!({
                    "session": session,
                    "active": active == Some(session.index),
                    "anchor": anchor.as_ref().map(|anchor| json!({
                        "token": anchor.token,
                        "actions_used": anchor.actions_used,
                    })),
                }),
                || {
                    let mut text = describe(&session, active);
                    text.push_str(&format!(
                        "\n  worker: {}\n  viewer: {}",
                        session.worker_base_url, session.viewer_url
                    ));
                    text
                },
            );
        }
        Command::Doctor => {
            let readiness = manager.health_check(index).await?;
            emit(
                json,
                json!({
                    "index": readiness.index,
                    "device_ready": readiness.device_ready,
                    "detail": readiness.detail,
                }),
                || match &readiness.detail {
                    None => format!("session {}: device ready", readiness.index),
                    Some(detail) => format!("session {}: not ready ({detail})", readiness.index),
                },
            );
            if !readiness.device_ready {
                bail!("device for session {} is not ready", readiness.index);
            }
        }
        Command::Sync => {
            let report = manager.sync_sessions().await.context("sync failed")?;
            emit(
                json,
                json!({
                    "reconciled": report.reconciled,
                    "pruned": report.pruned,
                    "adopted": report.adopted,
                    "total": report.total,
                }),
                || {
                    format!(
                        "{} sessions ({} adopted, {} pruned, {} reconciled)",
                        report.total, report.adopted, report.pruned, report.reconciled
                    )
                },
            );
        }
        Command::Watch { follow } => {
            let session = manager.resolve_session(index).await?;
            let url = if session.viewer_url.is_empty() {
                manager
                    .config()
                    .viewer_url(&session.workflow_run_id, session.platform.as_str())
            } else {
                session.viewer_url.clone()
            };
            emit(json, json!({"index": session.index, "viewer_url": url}), || url.clone());
            if follow {
                let cancel = CancellationToken::new();
                let sync = manager.spawn_periodic_sync(manager.config().sync_interval, cancel.clone());
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to listen for interrupt")?;
                cancel.cancel();
                let _ = sync.await;
            }
        }
        Command::Screenshot { output } => {
            let shot = manager.screenshot(index).await?;
            let path = match output {
                Some(path) => {
                    std::fs::write(&path, &shot.image)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    path
                }
                None => manager
                    .persist_anchor_image(shot.index, &shot.token, &shot.image)
                    .await
                    .context("failed to save screenshot")?,
            };
            emit(
                json,
                json!({"index": shot.index, "token": shot.token, "path": path}),
                || format!("{} ({})", path.display(), shot.token),
            );
        }
        Command::Tap(args) => {
            let response = if args.double {
                manager.double_tap(index, args.x, args.y).await?
            } else if let Some(duration) = args.long_press {
                manager.long_press(index, args.x, args.y, Some(duration)).await?
            } else {
                manager.tap(index, args.x, args.y).await?
            };
            emit(json, json!(response), || format!("tapped ({}, {})", args.x, args.y));
        }
        Command::Type { x, y, text, clear } => {
            let response = manager.type_text(index, x, y, &text, clear).await?;
            emit(json, json!(response), || format!("typed {} characters", text.chars().count()));
        }
        Command::Swipe {
            x,
            y,
            direction,
            duration_ms,
        } => {
            let response = manager.swipe(index, x, y, direction, duration_ms).await?;
            emit(json, json!(response), || format!("swiped {direction:?} from ({x}, {y})"));
        }
        Command::Install { app_url, bundle_id } => {
            let installed = manager
                .install_app(index, &app_url, bundle_id.as_deref())
                .await
                .context("install failed")?;
            emit(json, json!(installed), || match installed.app_identifier() {
                Some(id) => format!("installed {id}"),
                None => "installed".to_string(),
            });
        }
        Command::Launch { bundle_id } => {
            manager
                .launch_app(index, &bundle_id)
                .await
                .with_context(|| format!("failed to launch {bundle_id}"))?;
            emit(json, json!({"launched": bundle_id}), || format!("launched {bundle_id}"));
        }
        Command::OpenUrl { url } => {
            if !manager.open_url(index, &url).await? {
                bail!("this device's worker does not support opening URLs");
            }
            emit(json, json!({"opened": url}), || format!("opened {url}"));
        }
        Command::Find { target, tap } => {
            let resolved = if tap {
                manager.tap_target(index, &target).await?
            } else {
                manager.resolve_target(index, &target).await?
            };
            emit(
                json,
                json!({
                    "x": resolved.x,
                    "y": resolved.y,
                    "source": format!("{:?}", resolved.source).to_lowercase(),
                    "tapped": tap,
                }),
                || format!("'{target}' at ({}, {})", resolved.x, resolved.y),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;
    use clap::Parser;

    use super::*;

    #[test]
    fn cli_requires_subcommand() {
        let err = match Cli::try_parse_from(["devicedock"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn cli_rejects_unknown_subcommand() {
        let err = match Cli::try_parse_from(["devicedock", "reboot"]) {
            Ok(_) => panic!("expected invalid subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["devicedock", "tap", "10", "20", "-s", "2", "--json"])
            .expect("parse");
        assert_eq!(cli.session, Some(2));
        assert!(cli.json);
        match cli.command {
            Command::Tap(args) => {
                assert_eq!((args.x, args.y), (10, 20));
                assert!(!args.double);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn start_options_carry_idle_timeout_in_seconds() {
        let cli = Cli::try_parse_from([
            "devicedock",
            "start",
            "--platform",
            "ios",
            "--app-url",
            "https://builds.test/app.ipa",
            "--idle-timeout",
            "90",
        ])
        .expect("parse");
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        let options = args.into_options();
        assert_eq!(options.platform, "ios");
        assert_eq!(options.app_url.as_deref(), Some("https://builds.test/app.ipa"));
        assert_eq!(options.idle_timeout, Some(Duration::from_secs(90)));
        assert!(options.test_id.is_none());
    }

    #[test]
    fn swipe_direction_is_validated() {
        let cli = Cli::try_parse_from(["devicedock", "swipe", "5", "6", "UP"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Swipe {
                direction: SwipeDirection::Up,
                ..
            }
        ));

        let err = Cli::try_parse_from(["devicedock", "swipe", "5", "6", "sideways"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn double_tap_conflicts_with_long_press() {
        let err = Cli::try_parse_from(["devicedock", "tap", "1", "2", "--double", "--long-press", "900"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }
}
