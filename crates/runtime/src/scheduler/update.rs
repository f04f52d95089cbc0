//! Auto-update checker: once per day, inside the quiet window, compare the
//! installed checkout's HEAD against remote main and notify on divergence.
//! Transient git failures are logged at debug and otherwise swallowed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use git2::Repository;
use tokio::sync::watch;
use tracing::{debug, info};

use super::Notifier;
use super::schedule::is_in_window;

/// Gap between checks.
const CHECK_GAP: Duration = Duration::hours(24);
/// Poll cadence inside the run loop.
const POLL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    /// Remote main moved past local HEAD.
    Behind { local: String, remote: String },
    /// The check could not complete (no repo, no network, no remote ref).
    Unavailable,
}

pub struct UpdateChecker {
    install_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
    tz: Tz,
    quiet_start: u32,
    quiet_end: u32,
}

impl UpdateChecker {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        notifier: Arc<dyn Notifier>,
        tz: Tz,
        quiet_start: u32,
        quiet_end: u32,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            notifier,
            tz,
            quiet_start,
            quiet_end,
        }
    }

    /// One comparison of HEAD vs `origin/main`. Every failure path collapses
    /// to `Unavailable`.
    pub fn check(&self) -> UpdateStatus {
        match compare_head_to_remote_main(&self.install_dir) {
            Ok(status) => status,
            Err(err) => {
                debug!(%err, dir = %self.install_dir.display(), "update check unavailable");
                UpdateStatus::Unavailable
            }
        }
    }

    /// The long-running checker: fires at most once per 24 h, only inside
    /// the quiet window.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = std::time::Duration::from_secs(POLL_SECS);
        let mut last_check: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {
                    let now = Utc::now();
                    if !is_in_window(now, self.tz, self.quiet_start, self.quiet_end) {
                        continue;
                    }
                    if last_check.map(|t| now - t < CHECK_GAP).unwrap_or(false) {
                        continue;
                    }
                    last_check = Some(now);

                    if let UpdateStatus::Behind { local, remote } = self.check() {
                        info!(%local, %remote, "update available");
                        self.notifier.notify(
                            "auto-update",
                            &format!(
                                "An update is available ({} → {}). Restart to apply it.",
                                &local[..local.len().min(8)],
                                &remote[..remote.len().min(8)]
                            ),
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn compare_head_to_remote_main(dir: &Path) -> anyhow::Result<UpdateStatus> {
    let repo = Repository::open(dir)?;

    // Refresh origin/main; a failed fetch still allows comparing against the
    // last-known remote ref.
    if let Ok(mut remote) = repo.find_remote("origin") {
        if let Err(err) = remote.fetch(&["main"], None, None) {
            debug!(%err, "fetch failed — comparing against cached remote ref");
        }
    }

    let head = repo.head()?.peel_to_commit()?.id();
    let remote_main = repo
        .find_reference("refs/remotes/origin/main")?
        .peel_to_commit()?
        .id();

    if head == remote_main {
        return Ok(UpdateStatus::UpToDate);
    }
    // Divergence only counts when remote main is ahead of us.
    if repo.graph_descendant_of(remote_main, head)? {
        Ok(UpdateStatus::Behind {
            local: head.to_string(),
            remote: remote_main.to_string(),
        })
    } else {
        Ok(UpdateStatus::UpToDate)
    }
}
